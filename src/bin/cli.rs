use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use flightpath::*;
use serde_json::json;

#[derive(Parser)]
#[command(name = "flightpath")]
#[command(about = "Flightpath proxy management tool")]
struct Cli {
    /// Output in JSON format
    #[arg(long)]
    json: bool,

    #[arg(long, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current status
    Status,
    /// List all runways
    Runways,
    /// Show target accessibility matrix
    Targets,
    /// Show performance statistics
    Stats,
    /// Regenerate the configuration view
    Reload,
    /// Switch routing mode (latency/first_accessible/round_robin)
    Mode { mode: String },
    /// Test target accessibility, optionally against one runway
    Test {
        target: String,
        runway_id: Option<String>,
    },
}

struct Context {
    config: Config,
    runway_manager: Arc<RunwayManager>,
    routing_engine: Arc<RoutingEngine>,
    tracker: Arc<TargetAccessibilityTracker>,
}

fn build_context(config_path: &str) -> Context {
    let config = Config::load(config_path);

    let dns_servers: Vec<Arc<DnsServer>> = config
        .dns_servers
        .iter()
        .cloned()
        .map(|cfg| Arc::new(DnsServer::new(cfg)))
        .collect();
    let upstream_proxies: Vec<Arc<UpstreamProxy>> = config
        .upstream_proxies
        .iter()
        .cloned()
        .map(|cfg| Arc::new(UpstreamProxy::new(cfg)))
        .collect();

    let dns_resolver = Arc::new(DnsResolver::new(dns_servers.clone(), config.dns_timeout));
    let interfaces = Arc::new(InterfaceInventory::new());
    let runway_manager = Arc::new(RunwayManager::new(
        config.interfaces.clone(),
        upstream_proxies,
        dns_servers,
        dns_resolver,
        interfaces,
    ));
    runway_manager.discover_runways();

    let tracker = Arc::new(TargetAccessibilityTracker::new(
        config.success_rate_window,
        config.success_rate_threshold,
    ));
    let routing_engine = Arc::new(RoutingEngine::new(
        Arc::clone(&tracker),
        config.routing_mode(),
    ));

    Context {
        config,
        runway_manager,
        routing_engine,
        tracker,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp
                | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let ctx = build_context(&cli.config);

    match cli.command {
        Commands::Status => {
            let status = json!({
                "routing_mode": ctx.routing_engine.mode().as_str(),
                "runways_count": ctx.runway_manager.runway_count(),
                "targets_count": ctx.tracker.get_all_targets().len(),
                "proxy_listen": format!(
                    "{}:{}",
                    ctx.config.proxy_listen_host, ctx.config.proxy_listen_port
                ),
            });
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Routing Mode: {}", ctx.routing_engine.mode().as_str());
                println!("Runways: {}", ctx.runway_manager.runway_count());
                println!("Targets: {}", ctx.tracker.get_all_targets().len());
            }
        }
        Commands::Runways => {
            let all_runways = ctx.runway_manager.get_all_runways();
            if cli.json {
                let runways: Vec<_> = all_runways
                    .iter()
                    .map(|r| {
                        json!({
                            "id": r.id,
                            "interface": r.interface,
                            "source_ip": r.source_ip.to_string(),
                            "is_direct": r.is_direct,
                            "upstream_proxy": r.upstream_proxy.as_ref().map(|p| p.url()),
                            "dns_server": r.dns_server.endpoint(),
                        })
                    })
                    .collect();
                let count = runways.len();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "runways": runways,
                        "count": count,
                    }))?
                );
            } else {
                for r in &all_runways {
                    println!(
                        "{}: {} via {} (direct: {})",
                        r.id,
                        r.interface,
                        r.dns_server.endpoint(),
                        r.is_direct
                    );
                }
            }
        }
        Commands::Targets => {
            let targets = ctx.tracker.get_all_targets();
            let mut targets_data = serde_json::Map::new();
            for target in targets {
                let metrics = ctx.tracker.get_target_metrics(&target);
                let mut per_runway = serde_json::Map::new();
                for (runway_id, m) in metrics {
                    per_runway.insert(
                        runway_id,
                        json!({
                            "state": format!("{:?}", m.state),
                            "success_rate": m.success_rate,
                            "avg_response_time": m.avg_response_time,
                            "total_attempts": m.total_attempts,
                            "user_success_count": m.user_success_count,
                            "failure_count": m.failure_count,
                        }),
                    );
                }
                targets_data.insert(target, serde_json::Value::Object(per_runway));
            }

            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "targets": targets_data }))?
                );
            } else {
                for (target, info) in targets_data {
                    let runway_count = info.as_object().map(|o| o.len()).unwrap_or(0);
                    println!("{}: {} runways", target, runway_count);
                }
            }
        }
        Commands::Stats => {
            let targets = ctx.tracker.get_all_targets();
            let total_runways = ctx.runway_manager.runway_count();
            let mut targets_data = serde_json::Map::new();

            for target in &targets {
                let metrics = ctx.tracker.get_target_metrics(target);
                let accessible = metrics
                    .values()
                    .filter(|m| m.state == RunwayState::Accessible)
                    .count();
                let partial = metrics
                    .values()
                    .filter(|m| m.state == RunwayState::PartiallyAccessible)
                    .count();
                let inaccessible = metrics
                    .values()
                    .filter(|m| m.state == RunwayState::Inaccessible)
                    .count();
                let total_attempts: u64 = metrics.values().map(|m| m.total_attempts).sum();
                let total_successes: u64 = metrics.values().map(|m| m.user_success_count).sum();

                targets_data.insert(
                    target.clone(),
                    json!({
                        "accessible_runways": accessible,
                        "partially_accessible_runways": partial,
                        "inaccessible_runways": inaccessible,
                        "total_attempts": total_attempts,
                        "total_successes": total_successes,
                    }),
                );
            }

            let output = json!({
                "total_targets": targets.len(),
                "total_runways": total_runways,
                "targets": targets_data,
            });
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("Total Targets: {}", targets.len());
                println!("Total Runways: {}", total_runways);
            }
        }
        Commands::Mode { mode } => {
            let Some(routing_mode) = RoutingMode::parse(&mode.to_lowercase()) else {
                eprintln!(
                    "Error: invalid routing mode '{}'. Valid modes: latency, first_accessible, round_robin",
                    mode
                );
                std::process::exit(1);
            };
            ctx.routing_engine.set_mode(routing_mode);
            if cli.json {
                println!("{}", json!({ "routing_mode": routing_mode.as_str() }));
            } else {
                println!("Routing mode changed to {}", routing_mode.as_str());
            }
        }
        Commands::Test { target, runway_id } => {
            let timeout = Duration::from_secs(ctx.config.accessibility_timeout);
            let runways = match runway_id {
                Some(id) => match ctx.runway_manager.get_runway(&id) {
                    Some(runway) => vec![runway],
                    None => {
                        eprintln!("Error: runway {} not found", id);
                        std::process::exit(1);
                    }
                },
                None => ctx.runway_manager.get_all_runways(),
            };

            let mut results = Vec::new();
            for runway in &runways {
                let (net_ok, user_ok, rtt) = ctx
                    .runway_manager
                    .test_runway_accessibility(&target, runway, timeout)
                    .await;
                ctx.tracker.update(&target, &runway.id, net_ok, user_ok, rtt);
                results.push(json!({
                    "runway_id": runway.id,
                    "network_success": net_ok,
                    "user_success": user_ok,
                    "response_time": rtt.as_secs_f64(),
                }));
            }

            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "target": target,
                        "results": results,
                    }))?
                );
            } else {
                for r in &results {
                    println!(
                        "{}: net={}, user={}, time={:.3}s",
                        r["runway_id"].as_str().unwrap_or("?"),
                        r["network_success"],
                        r["user_success"],
                        r["response_time"].as_f64().unwrap_or(0.0)
                    );
                }
            }
        }
        Commands::Reload => {
            // Stateless tool: reloading is re-reading the file and reporting
            // what would apply.
            let reloaded = Config::load(&cli.config);
            if cli.json {
                println!(
                    "{}",
                    json!({
                        "reloaded": true,
                        "routing_mode": reloaded.routing_mode,
                        "dns_servers": reloaded.dns_servers.len(),
                        "upstream_proxies": reloaded.upstream_proxies.len(),
                    })
                );
            } else {
                println!("Configuration reloaded from {}", cli.config);
            }
        }
    }

    Ok(())
}
