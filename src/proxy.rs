use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::http::{self, HttpRequest, HttpResponse};
use crate::logger::{ConnectionLog, Logger};
use crate::registry::{ConnectionRegistry, ConnectionSnapshot, ConnectionStatus};
use crate::routing::RoutingEngine;
use crate::runway::Runway;
use crate::runway_manager::{split_target, RunwayManager};
use crate::tracker::TargetAccessibilityTracker;
use crate::validator::SuccessValidator;

const LISTEN_BACKLOG: u32 = 128;
const MAX_RETRIES: usize = 2;
const PROBE_CONCURRENCY: usize = 5;

// RFC 7230 Section 6.1 - connection options are hop-by-hop
const HOP_BY_HOP: [&str; 3] = ["host", "connection", "proxy-connection"];

pub struct ProxyServer {
    config: Config,
    runway_manager: Arc<RunwayManager>,
    routing_engine: Arc<RoutingEngine>,
    tracker: Arc<TargetAccessibilityTracker>,
    validator: Arc<SuccessValidator>,
    registry: Arc<ConnectionRegistry>,
    logger: Logger,
    shutdown: CancellationToken,
    running: AtomicBool,
    started_at: std::sync::atomic::AtomicU64,
}

impl ProxyServer {
    pub fn new(
        config: Config,
        runway_manager: Arc<RunwayManager>,
        routing_engine: Arc<RoutingEngine>,
        tracker: Arc<TargetAccessibilityTracker>,
        validator: Arc<SuccessValidator>,
        logger: Logger,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            runway_manager,
            routing_engine,
            tracker,
            validator,
            registry: Arc::new(ConnectionRegistry::new()),
            logger,
            shutdown,
            running: AtomicBool::new(false),
            started_at: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Binds the listen socket and spawns the accept loop. Returns the bound
    /// address. Bind or listen failures are fatal to the front-end.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.proxy_listen_host, self.config.proxy_listen_port
        )
        .parse()
        .map_err(|_| {
            ProxyError::ConfigMalformed(format!(
                "bad listen address {}:{}",
                self.config.proxy_listen_host, self.config.proxy_listen_port
            ))
        })?;

        let socket = TcpSocket::new_v4().map_err(ProxyError::SocketCreate)?;
        socket
            .set_reuseaddr(true)
            .map_err(ProxyError::SocketCreate)?;
        socket.bind(addr).map_err(|e| ProxyError::SocketBind {
            addr: addr.to_string(),
            source: e,
        })?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| ProxyError::SocketListen {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);
        self.started_at.store(epoch_secs(), Ordering::Relaxed);
        log::info!("Proxy server started on {}", local_addr);
        self.logger.log(
            crate::logger::LogLevel::Info,
            &format!("proxy listening on {}", local_addr),
        );

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.accept_loop(listener).await;
            server.running.store(false, Ordering::SeqCst);
        });

        Ok(local_addr)
    }

    async fn accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_connections));
        loop {
            // Stall accepts at the connection limit; the kernel backlog
            // absorbs bursts instead of accept-and-reject.
            let permit = match Arc::clone(&limit).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::error!("Error accepting connection: {}", e);
                        continue;
                    }
                },
            };

            let server = Arc::clone(self);
            tokio::spawn(async move {
                server.handle_connection(stream, peer).await;
                drop(permit);
            });
        }
        log::info!("Proxy accept loop stopped");
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn uptime_secs(&self) -> u64 {
        let started = self.started_at.load(Ordering::Relaxed);
        if started == 0 {
            0
        } else {
            epoch_secs().saturating_sub(started)
        }
    }

    pub fn get_active_connections(&self) -> usize {
        self.registry.active_count()
    }

    pub fn get_total_connections(&self) -> u64 {
        self.registry.total_connections()
    }

    pub fn get_total_bytes_sent(&self) -> u64 {
        self.registry.total_bytes_sent()
    }

    pub fn get_total_bytes_received(&self) -> u64 {
        self.registry.total_bytes_received()
    }

    pub fn get_active_connections_info(&self) -> Vec<ConnectionSnapshot> {
        self.registry.snapshot()
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let started = Instant::now();
        let conn_id = self.registry.register(&peer.ip().to_string(), peer.port());
        let mut conn_log = ConnectionLog {
            event: "connect".to_string(),
            client_ip: peer.ip().to_string(),
            client_port: peer.port(),
            ..Default::default()
        };

        // Protocol demux: SOCKS5 greets with 0x05, HTTP with an ASCII method.
        let demux_timeout = Duration::from_secs(self.config.network_timeout);
        let mut first = [0u8; 1];
        let peeked = match tokio::time::timeout(demux_timeout, stream.peek(&mut first)).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) | Err(_) => 0,
        };
        if peeked == 0 {
            self.finish_error(&conn_id, &mut conn_log, started, "closed before first byte");
            return;
        }

        if first[0] == 0x05 {
            // RFC 1928: no acceptable methods.
            let _ = stream.write_all(&[0x05, 0xFF]).await;
            self.finish_error(
                &conn_id,
                &mut conn_log,
                started,
                &ProxyError::HttpUnsupported("SOCKS5").to_string(),
            );
            return;
        }

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let network_timeout = Duration::from_secs(self.config.network_timeout);
        let request = match tokio::time::timeout(network_timeout, http::read_request(&mut reader))
            .await
        {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                let _ = write_all_timed(
                    &mut write_half,
                    &http::simple_response(400),
                    network_timeout,
                )
                .await;
                self.finish_error(
                    &conn_id,
                    &mut conn_log,
                    started,
                    &format!("bad request: {}", e),
                );
                return;
            }
            Err(_) => {
                self.finish_error(&conn_id, &mut conn_log, started, "client read timeout");
                return;
            }
        };

        conn_log.method = request.method.clone();
        conn_log.path = request.target.clone();

        if request.method.eq_ignore_ascii_case("CONNECT") {
            // RFC 7231 Section 4.3.6: the tunnel target comes from the Host
            // header, so its absence is the client's error, not ours.
            let Some(host_header) = request.headers.get("host") else {
                let _ = write_all_timed(
                    &mut write_half,
                    &http::simple_response(400),
                    network_timeout,
                )
                .await;
                conn_log.status_code = 400;
                self.finish_error(&conn_id, &mut conn_log, started, "no target host");
                return;
            };
            let (host, mut port) = split_target(host_header);
            if !host_header.contains(':') {
                port = 443;
            }
            conn_log.target_host = host.to_string();
            conn_log.target_port = port;

            // Tunnelling is out of scope.
            let _ = write_all_timed(
                &mut write_half,
                &http::simple_response(501),
                network_timeout,
            )
            .await;
            conn_log.status_code = 501;
            self.finish_error(
                &conn_id,
                &mut conn_log,
                started,
                &ProxyError::HttpUnsupported("CONNECT").to_string(),
            );
            return;
        }

        let (target_host, target_port) = match extract_target(&request) {
            Some(pair) => pair,
            None => {
                let _ = write_all_timed(
                    &mut write_half,
                    &http::simple_response(400),
                    network_timeout,
                )
                .await;
                conn_log.status_code = 400;
                self.finish_error(&conn_id, &mut conn_log, started, "no target host");
                return;
            }
        };

        conn_log.target_host = target_host.clone();
        conn_log.target_port = target_port;
        self.registry.update(&conn_id, |r| {
            r.target_host = target_host.clone();
            r.target_port = target_port;
            r.method = request.method.clone();
            r.path = request.target.clone();
            r.status = ConnectionStatus::Active;
        });

        let all_runways = self.runway_manager.get_all_runways();
        let mut runway = self.routing_engine.select_runway(&target_host, &all_runways);
        if runway.is_none() {
            log::debug!(
                "No known accessible runway for {}, probing all runways",
                target_host
            );
            runway = self
                .probe_all(&target_host, target_port, &all_runways)
                .await;
        }

        let mut runway = match runway {
            Some(r) => r,
            None => {
                log::warn!("No accessible runway found for {}", target_host);
                let _ = write_all_timed(
                    &mut write_half,
                    &http::simple_response(502),
                    network_timeout,
                )
                .await;
                conn_log.status_code = 502;
                self.finish_error(
                    &conn_id,
                    &mut conn_log,
                    started,
                    &ProxyError::NoRunwayAvailable(target_host.clone()).to_string(),
                );
                return;
            }
        };

        conn_log.runway_id = runway.id.clone();
        self.registry
            .update(&conn_id, |r| r.runway_id = runway.id.clone());

        for attempt in 0..MAX_RETRIES {
            let attempt_started = Instant::now();
            match self
                .forward_request(&request, &target_host, target_port, &runway)
                .await
            {
                Ok(response) => {
                    let (net_ok, user_ok) = self
                        .validator
                        .validate_http(response.status, &response.body);
                    // Tracker updates precede the client response write.
                    self.tracker.update(
                        &target_host,
                        &runway.id,
                        net_ok,
                        user_ok,
                        attempt_started.elapsed(),
                    );

                    if net_ok {
                        let bytes = http::serialize_response(&response);
                        let write_result =
                            write_all_timed(&mut write_half, &bytes, network_timeout).await;

                        let sent = bytes.len() as u64;
                        let received = request.body.len() as u64;
                        self.registry.add_transfer(sent, received);
                        self.registry.update(&conn_id, |r| {
                            r.bytes_sent = sent;
                            r.bytes_received = received;
                            r.status = match write_result {
                                Ok(_) => ConnectionStatus::Completed,
                                Err(_) => ConnectionStatus::Error,
                            };
                        });

                        conn_log.event = "disconnect".to_string();
                        conn_log.status_code = response.status;
                        conn_log.bytes_sent = sent;
                        conn_log.bytes_received = received;
                        conn_log.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                        self.logger.log_connection(&conn_log);
                        self.registry.remove(&conn_id);
                        return;
                    }

                    log::debug!(
                        "Upstream returned {} for {} via {} (attempt {})",
                        response.status,
                        target_host,
                        runway.id,
                        attempt + 1
                    );
                }
                Err(e) => {
                    self.tracker.update(
                        &target_host,
                        &runway.id,
                        false,
                        false,
                        attempt_started.elapsed(),
                    );
                    log::debug!(
                        "Forward attempt {} for {} via {} failed: {}",
                        attempt + 1,
                        target_host,
                        runway.id,
                        e
                    );
                    if !e.is_retryable() {
                        break;
                    }
                }
            }

            if attempt + 1 < MAX_RETRIES {
                match self.alternative_runway(&target_host, &runway.id) {
                    Some(alt) => {
                        log::debug!("Retrying {} via alternative runway {}", target_host, alt.id);
                        runway = alt;
                        conn_log.runway_id = runway.id.clone();
                        self.registry
                            .update(&conn_id, |r| r.runway_id = runway.id.clone());
                    }
                    None => break,
                }
            }
        }

        let _ = write_all_timed(
            &mut write_half,
            &http::simple_response(502),
            network_timeout,
        )
        .await;
        conn_log.status_code = 502;
        self.finish_error(&conn_id, &mut conn_log, started, "all runway attempts failed");
    }

    fn finish_error(
        &self,
        conn_id: &str,
        conn_log: &mut ConnectionLog,
        started: Instant,
        error: &str,
    ) {
        conn_log.event = "error".to_string();
        conn_log.error = error.to_string();
        conn_log.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.logger.log_connection(conn_log);
        self.registry.update(conn_id, |r| {
            r.status = ConnectionStatus::Error;
            r.error = Some(error.to_string());
        });
        self.registry.remove(conn_id);
    }

    /// Opens a connection along the runway and performs one exchange.
    /// HTTP-speaking upstream hops get an absolute-form request; everything
    /// else goes straight to the origin.
    async fn forward_request(
        &self,
        request: &HttpRequest,
        target_host: &str,
        target_port: u16,
        runway: &Runway,
    ) -> Result<HttpResponse> {
        let timeout = Duration::from_secs(self.config.network_timeout);

        let via_proxy = runway
            .upstream_proxy
            .as_ref()
            .filter(|p| p.speaks_http() && p.is_accessible());

        let dest = match via_proxy {
            Some(proxy) => {
                let ip = self
                    .runway_manager
                    .resolve_host(runway, &proxy.config.host)
                    .await?;
                SocketAddr::from((ip, proxy.config.port))
            }
            None => {
                let ip = self
                    .runway_manager
                    .resolve_host(runway, target_host)
                    .await?;
                SocketAddr::from((ip, target_port))
            }
        };

        let stream = self.runway_manager.open_stream(runway, dest, timeout).await?;
        let (read_half, mut write_half) = stream.into_split();

        let head = build_forward_head(request, target_host, target_port, via_proxy.is_some());
        write_all_timed(&mut write_half, head.as_bytes(), timeout).await?;
        if !request.body.is_empty() {
            write_all_timed(&mut write_half, &request.body, timeout).await?;
        }

        let mut reader = BufReader::new(read_half);
        match tokio::time::timeout(timeout, http::read_response(&mut reader)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e @ (ProxyError::Io(_) | ProxyError::Closed))) => Err(e),
            // Anything else means the origin spoke, but not HTTP we accept.
            Ok(Err(e)) => Err(ProxyError::UpstreamFailure(e.to_string())),
            Err(_) => Err(ProxyError::IoTimeout(timeout)),
        }
    }

    /// Probes every runway for the target, direct paths first, and returns
    /// the first one whose probe reports user-level success.
    async fn probe_all(
        &self,
        target_host: &str,
        target_port: u16,
        all_runways: &[Runway],
    ) -> Option<Runway> {
        let mut prioritized: Vec<&Runway> = all_runways.iter().filter(|r| r.is_direct).collect();
        prioritized.extend(all_runways.iter().filter(|r| !r.is_direct));

        let timeout = Duration::from_secs(self.config.accessibility_timeout);
        let probe_target = format!("{}:{}", target_host, target_port);

        for chunk in prioritized.chunks(PROBE_CONCURRENCY) {
            let probes = chunk.iter().map(|runway| {
                let manager = Arc::clone(&self.runway_manager);
                let probe_target = probe_target.clone();
                let runway = (*runway).clone();
                async move {
                    let outcome = manager
                        .test_runway_accessibility(&probe_target, &runway, timeout)
                        .await;
                    (runway, outcome)
                }
            });

            for probe in chunk.iter() {
                self.tracker.mark_testing(target_host, &probe.id);
            }

            let results = futures::future::join_all(probes).await;
            let mut winner = None;
            for (runway, (net_ok, user_ok, rtt)) in results {
                self.tracker
                    .update(target_host, &runway.id, net_ok, user_ok, rtt);
                if user_ok && winner.is_none() {
                    winner = Some(runway);
                }
            }
            if winner.is_some() {
                return winner;
            }
        }

        None
    }

    fn alternative_runway(&self, target: &str, current_id: &str) -> Option<Runway> {
        self.tracker
            .get_accessible_runways(target)
            .into_iter()
            .find(|id| id != current_id)
            .and_then(|id| self.runway_manager.get_runway(&id))
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn write_all_timed(
    writer: &mut OwnedWriteHalf,
    bytes: &[u8],
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, writer.write_all(bytes)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ProxyError::IoTimeout(timeout)),
    }
}

/// Target extraction per RFC 7230 Section 5.3-5.4: prefer the Host header,
/// fall back to an absolute-form request target. Port defaults to 80.
fn extract_target(request: &HttpRequest) -> Option<(String, u16)> {
    if let Some(host_header) = request.headers.get("host") {
        let (host, port) = split_target(host_header);
        if !host.is_empty() {
            return Some((host.to_string(), port));
        }
    }

    let rest = request.target.strip_prefix("http://")?;
    let authority = &rest[..rest.find('/').unwrap_or(rest.len())];
    if authority.is_empty() {
        return None;
    }
    let (host, port) = split_target(authority);
    Some((host.to_string(), port))
}

fn origin_form_path(target: &str) -> &str {
    if let Some(rest) = target.strip_prefix("http://") {
        match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "/",
        }
    } else if target.is_empty() {
        "/"
    } else {
        target
    }
}

/// Rewrites the request head for the next hop. Hop-by-hop headers are
/// dropped, framing headers are re-derived from the buffered body, and the
/// Host header is re-injected (port omitted for 80/443).
fn build_forward_head(
    request: &HttpRequest,
    target_host: &str,
    target_port: u16,
    absolute_form: bool,
) -> String {
    let path = origin_form_path(&request.target);
    let request_target = if absolute_form {
        format!("http://{}:{}{}", target_host, target_port, path)
    } else {
        path.to_string()
    };

    let mut head = format!(
        "{} {} {}\r\n",
        request.method, request_target, request.version
    );

    for (name, value) in &request.headers {
        if HOP_BY_HOP.contains(&name.as_str())
            || name == "content-length"
            || name == "transfer-encoding"
        {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }

    if target_port == 80 || target_port == 443 {
        head.push_str(&format!("host: {}\r\n", target_host));
    } else {
        head.push_str(&format!("host: {}:{}\r\n", target_host, target_port));
    }
    if !request.body.is_empty() || request.headers.contains_key("content-length") {
        head.push_str(&format!("content-length: {}\r\n", request.body.len()));
    }
    head.push_str("connection: close\r\n\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request(method: &str, target: &str, headers: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            body: Vec::new(),
        }
    }

    #[test]
    fn target_prefers_host_header() {
        let req = request("GET", "/index.html", &[("host", "example.com:8080")]);
        assert_eq!(
            extract_target(&req),
            Some(("example.com".to_string(), 8080))
        );
    }

    #[test]
    fn target_from_absolute_form() {
        let req = request("GET", "http://example.com/path", &[]);
        assert_eq!(extract_target(&req), Some(("example.com".to_string(), 80)));

        let req = request("GET", "http://example.com:8081", &[]);
        assert_eq!(
            extract_target(&req),
            Some(("example.com".to_string(), 8081))
        );
    }

    #[test]
    fn missing_target_is_none() {
        let req = request("GET", "/no-host", &[]);
        assert_eq!(extract_target(&req), None);
    }

    #[test]
    fn forward_head_strips_hop_by_hop_and_reinjects_host() {
        let mut req = request(
            "GET",
            "http://example.com/page?q=1",
            &[
                ("host", "ignored.example"),
                ("connection", "keep-alive"),
                ("proxy-connection", "keep-alive"),
                ("accept", "text/html"),
            ],
        );
        req.body = b"xy".to_vec();

        let head = build_forward_head(&req, "example.com", 80, false);
        assert!(head.starts_with("GET /page?q=1 HTTP/1.1\r\n"));
        assert!(head.contains("accept: text/html\r\n"));
        assert!(head.contains("host: example.com\r\n"));
        assert!(head.contains("content-length: 2\r\n"));
        assert!(!head.contains("ignored.example"));
        assert!(!head.contains("keep-alive"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn forward_head_keeps_port_when_nonstandard() {
        let req = request("GET", "/x", &[("host", "example.com:8080")]);
        let head = build_forward_head(&req, "example.com", 8080, false);
        assert!(head.contains("host: example.com:8080\r\n"));
    }

    #[test]
    fn forward_head_absolute_form_for_proxy_hop() {
        let req = request("GET", "/path", &[]);
        let head = build_forward_head(&req, "example.com", 80, true);
        assert!(head.starts_with("GET http://example.com:80/path HTTP/1.1\r\n"));
    }
}
