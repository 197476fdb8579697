use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::net::{TcpSocket, TcpStream};

use crate::dns::DnsResolver;
use crate::error::{ProxyError, Result};
use crate::interfaces::InterfaceInventory;
use crate::runway::{DnsServer, Runway, UpstreamProxy};

// interface name, upstream hop (if any), dns endpoint
type ComboKey = (String, Option<String>, String);

struct Catalog {
    runways: Vec<Runway>,
    by_id: HashMap<String, usize>,
    by_combo: HashMap<ComboKey, String>,
    next_seq: usize,
}

/// Egress-path catalog: the cross-product of usable interfaces, upstream
/// proxies and DNS resolvers. IDs are stable for the process lifetime; an
/// interface disappearing leaves its runways in place (probes fail for them)
/// and rediscovery never renumbers.
pub struct RunwayManager {
    configured_interfaces: Vec<String>,
    upstream_proxies: Vec<Arc<UpstreamProxy>>,
    dns_servers: Vec<Arc<DnsServer>>,
    dns_resolver: Arc<DnsResolver>,
    interfaces: Arc<InterfaceInventory>,
    catalog: RwLock<Catalog>,
}

impl RunwayManager {
    pub fn new(
        configured_interfaces: Vec<String>,
        upstream_proxies: Vec<Arc<UpstreamProxy>>,
        dns_servers: Vec<Arc<DnsServer>>,
        dns_resolver: Arc<DnsResolver>,
        interfaces: Arc<InterfaceInventory>,
    ) -> Self {
        Self {
            configured_interfaces,
            upstream_proxies,
            dns_servers,
            dns_resolver,
            interfaces,
            catalog: RwLock::new(Catalog {
                runways: Vec::new(),
                by_id: HashMap::new(),
                by_combo: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn refresh_interfaces(&self) {
        self.interfaces.refresh();
    }

    pub fn get_interfaces(&self) -> Vec<crate::interfaces::InterfaceInfo> {
        self.interfaces.list()
    }

    fn interfaces_to_use(&self) -> Vec<String> {
        if self.configured_interfaces.iter().any(|name| name == "auto") {
            let mut names = self.interfaces.names();
            names.sort();
            names
        } else {
            self.configured_interfaces
                .iter()
                .filter(|name| self.interfaces.contains(name))
                .cloned()
                .collect()
        }
    }

    /// Rebuilds the cross-product against the current interface list.
    /// Existing combinations keep their IDs; new ones are appended.
    pub fn discover_runways(&self) -> Vec<Runway> {
        let interfaces = self.interfaces_to_use();
        let mut guard = self.catalog.write();
        let catalog = &mut *guard;
        let mut appended = 0usize;

        // Direct runways first, then proxied ones, matching probe priority.
        for interface in &interfaces {
            let Some(info) = self.interfaces.get(interface) else {
                continue;
            };
            for dns in &self.dns_servers {
                let key = (interface.clone(), None, dns.endpoint());
                if let Some(id) = catalog.by_combo.get(&key) {
                    let idx = catalog.by_id[id];
                    catalog.runways[idx].source_ip = info.ipv4;
                    continue;
                }
                let id = format!(
                    "direct_{}_{}_{}",
                    interface, dns.config.host, catalog.next_seq
                );
                Self::append(catalog, key, id, interface, info.ipv4, None, dns);
                appended += 1;
            }
        }

        for interface in &interfaces {
            let Some(info) = self.interfaces.get(interface) else {
                continue;
            };
            for proxy in &self.upstream_proxies {
                for dns in &self.dns_servers {
                    let key = (interface.clone(), Some(proxy.url()), dns.endpoint());
                    if let Some(id) = catalog.by_combo.get(&key) {
                        let idx = catalog.by_id[id];
                        catalog.runways[idx].source_ip = info.ipv4;
                        continue;
                    }
                    let id = format!(
                        "proxy_{}_{}_{}_{}_{}",
                        interface,
                        proxy.config.proxy_type,
                        proxy.config.host,
                        dns.config.host,
                        catalog.next_seq
                    );
                    Self::append(
                        catalog,
                        key,
                        id,
                        interface,
                        info.ipv4,
                        Some(Arc::clone(proxy)),
                        dns,
                    );
                    appended += 1;
                }
            }
        }

        if appended > 0 {
            log::info!(
                "Discovered {} new runways ({} total)",
                appended,
                catalog.runways.len()
            );
        }
        catalog.runways.clone()
    }

    fn append(
        catalog: &mut Catalog,
        key: ComboKey,
        id: String,
        interface: &str,
        source_ip: Ipv4Addr,
        upstream_proxy: Option<Arc<UpstreamProxy>>,
        dns: &Arc<DnsServer>,
    ) {
        let runway = Runway::new(
            id.clone(),
            interface.to_string(),
            source_ip,
            upstream_proxy,
            Arc::clone(dns),
        );
        catalog.by_id.insert(id.clone(), catalog.runways.len());
        catalog.by_combo.insert(key, id);
        catalog.runways.push(runway);
        catalog.next_seq += 1;
    }

    pub fn get_runway(&self, runway_id: &str) -> Option<Runway> {
        let catalog = self.catalog.read();
        catalog
            .by_id
            .get(runway_id)
            .map(|&idx| catalog.runways[idx].clone())
    }

    /// Snapshot in stable (append) order.
    pub fn get_all_runways(&self) -> Vec<Runway> {
        self.catalog.read().runways.clone()
    }

    pub fn runway_count(&self) -> usize {
        self.catalog.read().runways.len()
    }

    /// Resolves `host` through the runway's own DNS server; IPv4 literals
    /// skip resolution entirely.
    pub async fn resolve_host(&self, runway: &Runway, host: &str) -> Result<Ipv4Addr> {
        if self.dns_resolver.is_ip_address(host) {
            return host.parse().map_err(|_| ProxyError::DnsMalformed);
        }
        let (ip, _) = self
            .dns_resolver
            .resolve_via(&runway.dns_server, host)
            .await?;
        Ok(ip)
    }

    /// Opens a TCP stream to `dest` bound to the runway's source address.
    pub async fn open_stream(
        &self,
        runway: &Runway,
        dest: SocketAddr,
        timeout: Duration,
    ) -> Result<TcpStream> {
        if !self.interfaces.contains(&runway.interface) {
            return Err(ProxyError::SocketConnect {
                addr: dest.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("interface {} is gone", runway.interface),
                ),
            });
        }

        let socket = TcpSocket::new_v4().map_err(ProxyError::SocketCreate)?;
        let source = SocketAddr::from((runway.source_ip, 0));
        socket.bind(source).map_err(|e| ProxyError::SocketBind {
            addr: source.to_string(),
            source: e,
        })?;

        match tokio::time::timeout(timeout, socket.connect(dest)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::SocketConnect {
                addr: dest.to_string(),
                source: e,
            }),
            Err(_) => Err(ProxyError::IoTimeout(timeout)),
        }
    }

    /// Probes one (target, runway) pair. Returns `(net_ok, user_ok, rtt)`;
    /// the caller decides what to feed the tracker. `target` is `host` or
    /// `host:port` with 80 assumed.
    pub async fn test_runway_accessibility(
        &self,
        target: &str,
        runway: &Runway,
        timeout: Duration,
    ) -> (bool, bool, Duration) {
        let start = Instant::now();
        let (host, port) = split_target(target);

        let net_ok = if let Some(proxy) = &runway.upstream_proxy {
            // Reaching the proxy hop is what decides a proxied runway.
            self.probe_proxy_hop(runway, proxy, timeout).await
        } else {
            match self.resolve_host(runway, host).await {
                Ok(ip) => self
                    .open_stream(runway, SocketAddr::from((ip, port)), timeout)
                    .await
                    .is_ok(),
                Err(e) => {
                    log::debug!("Probe resolve failed for {} via {}: {}", host, runway.id, e);
                    false
                }
            }
        };

        // Probes cannot see content; the request path refines user-level
        // success through the validator.
        let user_ok = net_ok;
        (net_ok, user_ok, start.elapsed())
    }

    async fn probe_proxy_hop(
        &self,
        runway: &Runway,
        proxy: &Arc<UpstreamProxy>,
        timeout: Duration,
    ) -> bool {
        let ip = match self.resolve_host(runway, &proxy.config.host).await {
            Ok(ip) => ip,
            Err(e) => {
                log::debug!("Probe resolve failed for proxy {}: {}", proxy.url(), e);
                proxy.record_failure();
                return false;
            }
        };

        match self
            .open_stream(runway, SocketAddr::from((ip, proxy.config.port)), timeout)
            .await
        {
            Ok(_) => {
                proxy.record_success();
                true
            }
            Err(e) => {
                log::debug!("Proxy hop {} unreachable: {}", proxy.url(), e);
                proxy.record_failure();
                false
            }
        }
    }
}

/// Splits `host[:port]`, defaulting to port 80.
pub fn split_target(target: &str) -> (&str, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (target, 80),
        },
        None => (target, 80),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DnsServerConfig, UpstreamProxyConfig};

    fn dns(host: &str) -> Arc<DnsServer> {
        Arc::new(DnsServer::new(DnsServerConfig {
            host: host.to_string(),
            port: 53,
            name: String::new(),
        }))
    }

    fn manager(proxies: Vec<Arc<UpstreamProxy>>, servers: Vec<Arc<DnsServer>>) -> RunwayManager {
        let resolver = Arc::new(DnsResolver::new(servers.clone(), 0.2));
        RunwayManager::new(
            vec!["auto".to_string()],
            proxies,
            servers,
            resolver,
            Arc::new(InterfaceInventory::new()),
        )
    }

    #[test]
    fn split_target_handles_optional_port() {
        assert_eq!(split_target("example.com"), ("example.com", 80));
        assert_eq!(split_target("example.com:8080"), ("example.com", 8080));
        assert_eq!(split_target("10.0.0.1:443"), ("10.0.0.1", 443));
        assert_eq!(split_target("weird:port"), ("weird:port", 80));
    }

    #[test]
    fn cross_product_shape_and_id_format() {
        let proxy = Arc::new(UpstreamProxy::new(UpstreamProxyConfig {
            proxy_type: "http".to_string(),
            host: "10.9.9.9".to_string(),
            port: 3128,
        }));
        let servers = vec![dns("1.1.1.1"), dns("8.8.8.8")];
        let m = manager(vec![proxy], servers);

        let runways = m.discover_runways();
        let iface_count = m.interfaces_to_use().len();
        assert!(iface_count >= 1, "expected at least a loopback interface");
        // Per interface: 2 direct + 1 proxy x 2 dns.
        assert_eq!(runways.len(), iface_count * 4);

        let mut ids = std::collections::HashSet::new();
        for r in &runways {
            assert!(ids.insert(r.id.clone()), "duplicate id {}", r.id);
            if r.is_direct {
                assert!(r.id.starts_with(&format!("direct_{}_", r.interface)));
            } else {
                assert!(r.id.starts_with(&format!("proxy_{}_http_", r.interface)));
            }
        }
        // Direct runways come first in catalog order.
        let first_proxied = runways.iter().position(|r| !r.is_direct);
        if let Some(pos) = first_proxied {
            assert!(runways[..pos].iter().all(|r| r.is_direct));
            assert!(runways[pos..].iter().all(|r| !r.is_direct));
        }
    }

    #[test]
    fn rediscovery_keeps_ids_stable() {
        let m = manager(vec![], vec![dns("1.1.1.1")]);
        let first: Vec<String> = m.discover_runways().into_iter().map(|r| r.id).collect();
        let second: Vec<String> = m.discover_runways().into_iter().map(|r| r.id).collect();
        assert_eq!(first, second);
        assert_eq!(m.runway_count(), first.len());
    }

    #[test]
    fn lookup_by_id() {
        let m = manager(vec![], vec![dns("1.1.1.1")]);
        let runways = m.discover_runways();
        if let Some(first) = runways.first() {
            assert_eq!(m.get_runway(&first.id).unwrap().id, first.id);
        }
        assert!(m.get_runway("direct_missing_0_999").is_none());
    }

    #[tokio::test]
    async fn direct_probe_succeeds_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let m = manager(vec![], vec![dns("1.1.1.1")]);
        let runways = m.discover_runways();
        let Some(lo) = runways.iter().find(|r| r.source_ip.is_loopback()) else {
            return; // no loopback interface visible in this environment
        };

        let (net_ok, user_ok, rtt) = m
            .test_runway_accessibility(
                &format!("127.0.0.1:{}", port),
                lo,
                Duration::from_secs(2),
            )
            .await;
        assert!(net_ok);
        assert_eq!(user_ok, net_ok);
        assert!(rtt <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn proxied_probe_flags_unreachable_hop() {
        let proxy = Arc::new(UpstreamProxy::new(UpstreamProxyConfig {
            proxy_type: "http".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1, // nothing listens here
        }));
        let m = manager(vec![Arc::clone(&proxy)], vec![dns("1.1.1.1")]);
        let runways = m.discover_runways();
        let Some(proxied) = runways
            .iter()
            .find(|r| !r.is_direct && r.source_ip.is_loopback())
        else {
            return;
        };

        let (net_ok, _, _) = m
            .test_runway_accessibility("example.com", proxied, Duration::from_millis(500))
            .await;
        assert!(!net_ok);
        assert!(!proxy.is_accessible());
        assert!(proxy.failure_count() >= 1);
    }
}
