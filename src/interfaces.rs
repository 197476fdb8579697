use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use get_if_addrs::{get_if_addrs, IfAddr};
use ipnetwork::Ipv4Network;
use parking_lot::RwLock;

/// One local IPv4 interface as last observed.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub ipv4: Ipv4Addr,
    pub network: Option<Ipv4Network>,
    pub last_seen: Instant,
}

/// Inventory of local IPv4 interfaces. `refresh` swaps the whole map in one
/// write so readers observe either the previous or the new list, never a
/// half-merged one.
pub struct InterfaceInventory {
    info: RwLock<HashMap<String, InterfaceInfo>>,
}

impl InterfaceInventory {
    pub fn new() -> Self {
        let inventory = Self {
            info: RwLock::new(HashMap::new()),
        };
        inventory.refresh();
        inventory
    }

    pub fn refresh(&self) {
        let addrs = match get_if_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                log::error!("Error enumerating interfaces: {}", e);
                return;
            }
        };

        let now = Instant::now();
        let mut fresh: HashMap<String, InterfaceInfo> = HashMap::new();
        for iface in addrs {
            if let IfAddr::V4(v4) = &iface.addr {
                let network = Ipv4Network::with_netmask(v4.ip, v4.netmask).ok();
                fresh.insert(
                    iface.name.clone(),
                    InterfaceInfo {
                        name: iface.name,
                        ipv4: v4.ip,
                        network,
                        last_seen: now,
                    },
                );
            }
        }

        let mut info = self.info.write();
        for (name, entry) in &fresh {
            match info.get(name) {
                Some(old) if old.ipv4 != entry.ipv4 => {
                    log::warn!("Interface {} IP changed: {} -> {}", name, old.ipv4, entry.ipv4);
                }
                None => log::debug!("Discovered interface {}: {}", name, entry.ipv4),
                _ => {}
            }
        }
        for name in info.keys() {
            if !fresh.contains_key(name) {
                log::warn!("Interface {} removed/disconnected", name);
            }
        }
        *info = fresh;
    }

    pub fn list(&self) -> Vec<InterfaceInfo> {
        self.info.read().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<InterfaceInfo> {
        self.info.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.info.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.info.read().keys().cloned().collect()
    }
}

impl Default for InterfaceInventory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_loopback() {
        let inventory = InterfaceInventory::new();
        let list = inventory.list();
        // Every machine this runs on has a loopback with 127.0.0.1.
        assert!(list.iter().any(|i| i.ipv4.is_loopback()));
    }

    #[test]
    fn refresh_keeps_list_consistent() {
        let inventory = InterfaceInventory::new();
        let before: Vec<String> = inventory.names();
        inventory.refresh();
        let after: Vec<String> = inventory.names();
        assert_eq!(
            {
                let mut b = before;
                b.sort();
                b
            },
            {
                let mut a = after;
                a.sort();
                a
            }
        );
    }
}
