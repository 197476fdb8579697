use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Active,
    Completed,
    Error,
}

/// One in-flight client connection, owned by its handler task and published
/// here for observers.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub client_ip: String,
    pub client_port: u16,
    pub start_time: u64,
    pub target_host: String,
    pub target_port: u16,
    pub runway_id: String,
    pub method: String,
    pub path: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub status: ConnectionStatus,
    pub error: Option<String>,
}

/// Observer view of a record; `duration` is computed at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    #[serde(flatten)]
    pub record: ConnectionRecord,
    pub duration: u64,
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Live map of client connections plus process-wide totals.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, ConnectionRecord>>,
    total_connections: AtomicU64,
    total_bytes_sent: AtomicU64,
    total_bytes_received: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            total_connections: AtomicU64::new(0),
            total_bytes_sent: AtomicU64::new(0),
            total_bytes_received: AtomicU64::new(0),
        }
    }

    /// Registers a newly accepted connection and returns its stable id,
    /// `client_ip:port-start_epoch`.
    pub fn register(&self, client_ip: &str, client_port: u16) -> String {
        let start_time = epoch_secs();
        let id = format!("{}:{}-{}", client_ip, client_port, start_time);
        let record = ConnectionRecord {
            id: id.clone(),
            client_ip: client_ip.to_string(),
            client_port,
            start_time,
            target_host: String::new(),
            target_port: 0,
            runway_id: String::new(),
            method: String::new(),
            path: String::new(),
            bytes_sent: 0,
            bytes_received: 0,
            status: ConnectionStatus::Connecting,
            error: None,
        };
        self.connections.lock().insert(id.clone(), record);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        id
    }

    pub fn update<F>(&self, id: &str, f: F)
    where
        F: FnOnce(&mut ConnectionRecord),
    {
        if let Some(record) = self.connections.lock().get_mut(id) {
            f(record);
        }
    }

    pub fn remove(&self, id: &str) {
        self.connections.lock().remove(id);
    }

    pub fn add_transfer(&self, sent: u64, received: u64) {
        self.total_bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.total_bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    pub fn active_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received.load(Ordering::Relaxed)
    }

    /// Deep copy of the live map for observers.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let now = epoch_secs();
        self.connections
            .lock()
            .values()
            .map(|record| ConnectionSnapshot {
                record: record.clone(),
                duration: now.saturating_sub(record.start_time),
            })
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_connecting_to_completed() {
        let registry = ConnectionRegistry::new();
        let id = registry.register("127.0.0.1", 40123);
        assert!(id.starts_with("127.0.0.1:40123-"));
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.total_connections(), 1);

        registry.update(&id, |r| {
            r.target_host = "example.com".to_string();
            r.target_port = 80;
            r.status = ConnectionStatus::Active;
        });
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].record.status, ConnectionStatus::Active);
        assert_eq!(snapshot[0].record.target_host, "example.com");

        registry.update(&id, |r| r.status = ConnectionStatus::Completed);
        registry.remove(&id);
        assert_eq!(registry.active_count(), 0);
        // Totals survive the record's removal.
        assert_eq!(registry.total_connections(), 1);
    }

    #[test]
    fn totals_accumulate_across_connections() {
        let registry = ConnectionRegistry::new();
        registry.add_transfer(100, 40);
        registry.add_transfer(50, 10);
        assert_eq!(registry.total_bytes_sent(), 150);
        assert_eq!(registry.total_bytes_received(), 50);
    }

    #[test]
    fn update_on_unknown_id_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        registry.update("nope", |r| r.status = ConnectionStatus::Error);
        assert_eq!(registry.active_count(), 0);
    }
}
