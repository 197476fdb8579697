use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::net::UdpSocket;

use crate::error::{ProxyError, Result};
use crate::runway::DnsServer;

// RFC 1035 - Domain Names - Implementation and Specification

const CACHE_TTL_SECS: u64 = 300;
const MAX_POINTER_JUMPS: usize = 10;
const MAX_LABEL_LEN: usize = 63;
const UDP_RESPONSE_BYTES: usize = 512;

pub struct DnsResolver {
    servers: Vec<Arc<DnsServer>>,
    cache: RwLock<HashMap<String, (Ipv4Addr, u64)>>,
    timeout: Duration,
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl DnsResolver {
    pub fn new(servers: Vec<Arc<DnsServer>>, timeout_secs: f64) -> Self {
        Self {
            servers,
            cache: RwLock::new(HashMap::new()),
            timeout: Duration::from_secs_f64(timeout_secs),
        }
    }

    pub fn is_ip_address(&self, target: &str) -> bool {
        target.parse::<Ipv4Addr>().is_ok()
    }

    pub fn is_private_ip(&self, target: &str) -> bool {
        target
            .parse::<Ipv4Addr>()
            .map(|ip| ip.is_private() || ip.is_loopback())
            .unwrap_or(false)
    }

    /// Resolves `domain`, rotating through the configured servers in order.
    /// IPv4 literals short-circuit with zero rtt.
    pub async fn resolve(&self, domain: &str) -> Result<(Ipv4Addr, Duration)> {
        if let Ok(ip) = domain.parse::<Ipv4Addr>() {
            return Ok((ip, Duration::ZERO));
        }

        if let Some(ip) = self.cache_lookup(domain) {
            return Ok((ip, Duration::ZERO));
        }

        let mut last_err = None;
        for server in &self.servers {
            match self.query_server(server, domain).await {
                Ok((ip, rtt)) => {
                    self.cache_store(domain, ip, epoch_secs() + CACHE_TTL_SECS);
                    log::debug!(
                        "Resolved {} -> {} via {} in {:?}",
                        domain,
                        ip,
                        server.endpoint(),
                        rtt
                    );
                    return Ok((ip, rtt));
                }
                Err(e) => {
                    log::debug!("DNS error for {} via {}: {}", domain, server.endpoint(), e);
                    last_err = Some(e);
                }
            }
        }

        Err(ProxyError::DnsAllServersFailed {
            domain: domain.to_string(),
            last: Box::new(last_err.unwrap_or(ProxyError::DnsNoAnswer)),
        })
    }

    /// Resolves `domain` through one specific server, as the runway-scoped
    /// paths (forwarding, probing) require.
    pub async fn resolve_via(
        &self,
        server: &Arc<DnsServer>,
        domain: &str,
    ) -> Result<(Ipv4Addr, Duration)> {
        if let Ok(ip) = domain.parse::<Ipv4Addr>() {
            return Ok((ip, Duration::ZERO));
        }

        if let Some(ip) = self.cache_lookup(domain) {
            return Ok((ip, Duration::ZERO));
        }

        let (ip, rtt) = self.query_server(server, domain).await?;
        self.cache_store(domain, ip, epoch_secs() + CACHE_TTL_SECS);
        Ok((ip, rtt))
    }

    fn cache_lookup(&self, domain: &str) -> Option<Ipv4Addr> {
        let cache = self.cache.read();
        match cache.get(domain) {
            Some((ip, expiry)) if *expiry > epoch_secs() => Some(*ip),
            _ => None,
        }
    }

    fn cache_store(&self, domain: &str, ip: Ipv4Addr, expiry: u64) {
        self.cache.write().insert(domain.to_string(), (ip, expiry));
    }

    async fn query_server(
        &self,
        server: &Arc<DnsServer>,
        domain: &str,
    ) -> Result<(Ipv4Addr, Duration)> {
        let txn_id: u16 = rand::random();
        let query = build_query(txn_id, domain)?;

        let addr: SocketAddr = format!("{}:{}", server.config.host, server.config.port)
            .parse()
            .map_err(|_| {
                ProxyError::SocketConnect {
                    addr: server.endpoint(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "dns server host is not an address",
                    ),
                }
            })?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(ProxyError::SocketCreate)?;

        let start = Instant::now();
        socket.send_to(&query, addr).await?;

        let mut buf = vec![0u8; UDP_RESPONSE_BYTES];
        let received = match tokio::time::timeout(self.timeout, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                server.record_failure();
                return Err(ProxyError::Io(e));
            }
            Err(_) => {
                server.record_failure();
                return Err(ProxyError::DnsTimeout(self.timeout));
            }
        };
        let rtt = start.elapsed();
        buf.truncate(received);

        if buf.len() < 2 || u16::from_be_bytes([buf[0], buf[1]]) != txn_id {
            server.record_failure();
            return Err(ProxyError::DnsMalformed);
        }

        match parse_response(&buf) {
            Ok(ip) => {
                server.record_success(rtt.as_secs_f64());
                Ok((ip, rtt))
            }
            Err(e) => {
                server.record_failure();
                Err(e)
            }
        }
    }
}

// RFC 1035 Section 3.1 - domain name encoding
fn encode_name(domain: &str, buf: &mut Vec<u8>) -> Result<()> {
    let trimmed = domain.trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(ProxyError::DnsMalformed);
    }
    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(ProxyError::DnsMalformed);
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    Ok(())
}

// RFC 1035 Section 4.1.1 - message header, question follows
pub fn build_query(txn_id: u16, domain: &str) -> Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(32);
    packet.extend_from_slice(&txn_id.to_be_bytes());
    packet.push(0x01); // QR=0, Opcode=0, AA=0, TC=0, RD=1
    packet.push(0x00); // RA=0, Z=0, RCODE=0
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    encode_name(domain, &mut packet)?;
    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE=A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS=IN
    Ok(packet)
}

// RFC 1035 Section 4.1.4 - name decompression. Returns the decoded name and
// the position just past the name in the original byte stream. Pointer chains
// are capped to defeat malicious loops.
fn decode_name(msg: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut next = None;
    let mut jumps = 0;

    loop {
        let len = *msg.get(pos).ok_or(ProxyError::DnsMalformed)? as usize;

        if len == 0 {
            pos += 1;
            break;
        }

        if len & 0xC0 == 0xC0 {
            if jumps >= MAX_POINTER_JUMPS {
                return Err(ProxyError::DnsMalformed);
            }
            let low = *msg.get(pos + 1).ok_or(ProxyError::DnsMalformed)? as usize;
            if next.is_none() {
                next = Some(pos + 2);
            }
            pos = ((len & 0x3F) << 8) | low;
            jumps += 1;
            continue;
        }

        if len > MAX_LABEL_LEN || pos + 1 + len > msg.len() {
            return Err(ProxyError::DnsMalformed);
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(&msg[pos + 1..pos + 1 + len]));
        pos += 1 + len;
    }

    Ok((name, next.unwrap_or(pos)))
}

// RFC 1035 Section 4.1.3 - walk the answer section for the first A record.
pub fn parse_response(msg: &[u8]) -> Result<Ipv4Addr> {
    if msg.len() < 12 {
        return Err(ProxyError::DnsMalformed);
    }

    let rcode = msg[3] & 0x0F;
    match rcode {
        0 => {}
        3 => return Err(ProxyError::DnsNoAnswer), // NXDOMAIN
        other => return Err(ProxyError::DnsRefused(other)),
    }

    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    let ancount = u16::from_be_bytes([msg[6], msg[7]]);
    if ancount == 0 {
        return Err(ProxyError::DnsNoAnswer);
    }

    let mut pos = 12;
    for _ in 0..qdcount {
        let (_, next) = decode_name(msg, pos)?;
        pos = next + 4; // QTYPE + QCLASS
    }

    for _ in 0..ancount {
        if pos >= msg.len() {
            break;
        }
        let (_, next) = decode_name(msg, pos)?;
        pos = next;

        if pos + 10 > msg.len() {
            return Err(ProxyError::DnsMalformed);
        }
        let rtype = u16::from_be_bytes([msg[pos], msg[pos + 1]]);
        let rclass = u16::from_be_bytes([msg[pos + 2], msg[pos + 3]]);
        let rdlength = u16::from_be_bytes([msg[pos + 8], msg[pos + 9]]) as usize;
        pos += 10;

        if rtype == 1 && rclass == 1 && rdlength == 4 {
            if pos + 4 > msg.len() {
                return Err(ProxyError::DnsMalformed);
            }
            return Ok(Ipv4Addr::new(
                msg[pos],
                msg[pos + 1],
                msg[pos + 2],
                msg[pos + 3],
            ));
        }
        pos += rdlength;
    }

    Err(ProxyError::DnsNoAnswer)
}
