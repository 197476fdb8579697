use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{DnsServerConfig, UpstreamProxyConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunwayState {
    Unknown,
    Accessible,
    PartiallyAccessible,
    Inaccessible,
    Testing,
}

/// Shared upstream proxy record. Every runway that routes through this hop
/// holds the same `Arc` and observes the same accessibility flag.
#[derive(Debug)]
pub struct UpstreamProxy {
    pub config: UpstreamProxyConfig,
    accessible: AtomicBool,
    failure_count: AtomicU32,
    last_success: Mutex<Option<Instant>>,
}

impl UpstreamProxy {
    pub fn new(config: UpstreamProxyConfig) -> Self {
        Self {
            config,
            accessible: AtomicBool::new(true),
            failure_count: AtomicU32::new(0),
            last_success: Mutex::new(None),
        }
    }

    pub fn is_accessible(&self) -> bool {
        self.accessible.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        self.accessible.store(true, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        *self.last_success.lock() = Some(Instant::now());
    }

    pub fn record_failure(&self) {
        self.accessible.store(false, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// `type://host:port`, the hop address used for chaining and display.
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.config.proxy_type, self.config.host, self.config.port
        )
    }

    /// True when requests can be rewritten into absolute-form and sent to
    /// this hop. SOCKS hops are probed but never carry forwarded requests.
    pub fn speaks_http(&self) -> bool {
        matches!(self.config.proxy_type.as_str(), "http" | "https")
    }
}

/// Shared recursive resolver record, one per configured DNS server.
#[derive(Debug)]
pub struct DnsServer {
    pub config: DnsServerConfig,
    response_time: Mutex<f64>,
    failure_count: AtomicU32,
    last_success: Mutex<Option<Instant>>,
}

impl DnsServer {
    pub fn new(config: DnsServerConfig) -> Self {
        Self {
            config,
            response_time: Mutex::new(0.0),
            failure_count: AtomicU32::new(0),
            last_success: Mutex::new(None),
        }
    }

    pub fn record_success(&self, rtt_secs: f64) {
        let mut avg = self.response_time.lock();
        *avg = if *avg == 0.0 {
            rtt_secs
        } else {
            *avg * 0.7 + rtt_secs * 0.3
        };
        self.failure_count.store(0, Ordering::Relaxed);
        *self.last_success.lock() = Some(Instant::now());
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_time(&self) -> f64 {
        *self.response_time.lock()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

/// A concrete egress path: local interface + optional upstream proxy +
/// recursive DNS resolver.
#[derive(Debug, Clone)]
pub struct Runway {
    pub id: String,
    pub interface: String,
    pub source_ip: Ipv4Addr,
    pub upstream_proxy: Option<Arc<UpstreamProxy>>,
    pub dns_server: Arc<DnsServer>,
    pub is_direct: bool,
}

impl Runway {
    pub fn new(
        id: String,
        interface: String,
        source_ip: Ipv4Addr,
        upstream_proxy: Option<Arc<UpstreamProxy>>,
        dns_server: Arc<DnsServer>,
    ) -> Self {
        let is_direct = upstream_proxy.is_none();
        Self {
            id,
            interface,
            source_ip,
            upstream_proxy,
            dns_server,
            is_direct,
        }
    }
}
