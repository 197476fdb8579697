use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::proxy::ProxyServer;
use crate::routing::RoutingEngine;
use crate::runway_manager::RunwayManager;
use crate::tracker::TargetAccessibilityTracker;

/// Read-only JSON status API on its own listener. Never on the request
/// serving hot path.
pub struct WebUi {
    config: Config,
    runway_manager: Arc<RunwayManager>,
    routing_engine: Arc<RoutingEngine>,
    tracker: Arc<TargetAccessibilityTracker>,
    proxy: Arc<ProxyServer>,
    shutdown: CancellationToken,
}

impl WebUi {
    pub fn new(
        config: Config,
        runway_manager: Arc<RunwayManager>,
        routing_engine: Arc<RoutingEngine>,
        tracker: Arc<TargetAccessibilityTracker>,
        proxy: Arc<ProxyServer>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            runway_manager,
            routing_engine,
            tracker,
            proxy,
            shutdown,
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<SocketAddr> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.webui_listen_host, self.config.webui_listen_port
        )
        .parse()
        .map_err(|_| {
            ProxyError::ConfigMalformed(format!(
                "bad webui address {}:{}",
                self.config.webui_listen_host, self.config.webui_listen_port
            ))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::SocketBind {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        log::info!("Status web UI listening on {}", local_addr);

        let ui = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    _ = ui.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("Web UI accept error: {}", e);
                            continue;
                        }
                    },
                };

                let io = TokioIo::new(stream);
                let ui = Arc::clone(&ui);
                tokio::spawn(async move {
                    let service = service_fn({
                        let ui = Arc::clone(&ui);
                        move |req| {
                            let ui = Arc::clone(&ui);
                            async move { ui.handle(req).await }
                        }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        log::debug!("Web UI connection error: {}", err);
                    }
                });
            }
        });

        Ok(local_addr)
    }

    async fn handle(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        if req.method() != Method::GET {
            return Ok(json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                json!({"error": "GET only"}),
            ));
        }

        let body = match req.uri().path() {
            "/api/status" => self.status_json(),
            "/api/runways" => self.runways_json(),
            "/api/targets" => self.targets_json(),
            "/api/connections" => self.connections_json(),
            "/api/interfaces" => self.interfaces_json(),
            _ => {
                return Ok(json_response(
                    StatusCode::NOT_FOUND,
                    json!({"error": "unknown endpoint"}),
                ))
            }
        };

        Ok(json_response(StatusCode::OK, body))
    }

    fn status_json(&self) -> serde_json::Value {
        json!({
            "status": if self.proxy.is_running() { "running" } else { "stopped" },
            "routing_mode": self.routing_engine.mode().as_str(),
            "runways_count": self.runway_manager.runway_count(),
            "targets_count": self.tracker.get_all_targets().len(),
            "active_connections": self.proxy.get_active_connections(),
            "total_connections": self.proxy.get_total_connections(),
            "total_bytes_sent": self.proxy.get_total_bytes_sent(),
            "total_bytes_received": self.proxy.get_total_bytes_received(),
            "uptime_secs": self.proxy.uptime_secs(),
        })
    }

    fn runways_json(&self) -> serde_json::Value {
        let runways: Vec<_> = self
            .runway_manager
            .get_all_runways()
            .iter()
            .map(|r| {
                json!({
                    "id": r.id,
                    "interface": r.interface,
                    "source_ip": r.source_ip.to_string(),
                    "is_direct": r.is_direct,
                    "upstream_proxy": r.upstream_proxy.as_ref().map(|p| p.url()),
                    "upstream_accessible": r.upstream_proxy.as_ref().map(|p| p.is_accessible()),
                    "dns_server": r.dns_server.endpoint(),
                })
            })
            .collect();
        let count = runways.len();
        json!({ "runways": runways, "count": count })
    }

    fn targets_json(&self) -> serde_json::Value {
        let mut targets = serde_json::Map::new();
        for target in self.tracker.get_all_targets() {
            let mut per_runway = serde_json::Map::new();
            for (runway_id, m) in self.tracker.get_target_metrics(&target) {
                per_runway.insert(
                    runway_id,
                    json!({
                        "state": format!("{:?}", m.state),
                        "success_rate": m.success_rate,
                        "avg_response_time": m.avg_response_time,
                        "total_attempts": m.total_attempts,
                        "network_success_count": m.network_success_count,
                        "user_success_count": m.user_success_count,
                        "partial_success_count": m.partial_success_count,
                        "failure_count": m.failure_count,
                        "consecutive_failures": m.consecutive_failures,
                        "recovery_count": m.recovery_count,
                        "last_success_time": m.last_success_time,
                        "last_failure_time": m.last_failure_time,
                    }),
                );
            }
            targets.insert(target, serde_json::Value::Object(per_runway));
        }
        json!({ "targets": targets })
    }

    fn interfaces_json(&self) -> serde_json::Value {
        let interfaces: Vec<_> = self
            .runway_manager
            .get_interfaces()
            .iter()
            .map(|i| {
                json!({
                    "name": i.name,
                    "ipv4": i.ipv4.to_string(),
                    "network": i.network.map(|n| n.to_string()),
                    "last_seen_secs_ago": i.last_seen.elapsed().as_secs(),
                })
            })
            .collect();
        json!({ "interfaces": interfaces })
    }

    fn connections_json(&self) -> serde_json::Value {
        let connections = self.proxy.get_active_connections_info();
        let count = connections.len();
        json!({
            "connections": connections,
            "count": count,
        })
    }
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}
