use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use flightpath::*;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "flightpathd")]
#[command(about = "Multi-path HTTP forward proxy daemon")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: String,
}

fn init_stderr_logging(level: &str) {
    let filter = match level.to_ascii_uppercase().as_str() {
        "DEBUG" => log::LevelFilter::Debug,
        "INFO" => log::LevelFilter::Info,
        "WARN" => log::LevelFilter::Warn,
        "ERROR" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::from_default_env()
        .filter_level(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config);
    init_stderr_logging(&config.log_level);

    log::info!("Initializing flightpath service...");
    let logger = Logger::new(
        &config.log_file,
        config.log_max_bytes,
        config.log_backup_count,
    );
    let shutdown = CancellationToken::new();

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
        Arc::clone(&dns_resolver),
        interfaces,
    ));

    let runways = runway_manager.discover_runways();
    log::info!("Discovered {} runways", runways.len());
    if runways.is_empty() {
        log::warn!("No runways available; check interfaces and dns_servers in config");
    }

    let tracker = Arc::new(TargetAccessibilityTracker::new(
        config.success_rate_window,
        config.success_rate_threshold,
    ));
    let validator = Arc::new(SuccessValidator::new());
    let routing_engine = Arc::new(RoutingEngine::new(
        Arc::clone(&tracker),
        config.routing_mode(),
    ));

    let proxy = Arc::new(ProxyServer::new(
        config.clone(),
        Arc::clone(&runway_manager),
        Arc::clone(&routing_engine),
        Arc::clone(&tracker),
        Arc::clone(&validator),
        logger.clone(),
        shutdown.clone(),
    ));
    proxy.start().await?;

    if config.webui_enabled {
        let webui = Arc::new(WebUi::new(
            config.clone(),
            Arc::clone(&runway_manager),
            Arc::clone(&routing_engine),
            Arc::clone(&tracker),
            Arc::clone(&proxy),
            shutdown.clone(),
        ));
        webui.start().await?;
    }

    let health_monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&runway_manager),
        Arc::clone(&tracker),
        config.health_check_interval,
        config.accessibility_timeout,
        shutdown.clone(),
    ));
    let health_handle = {
        let monitor = Arc::clone(&health_monitor);
        tokio::spawn(async move { monitor.run().await })
    };

    log::info!("flightpath service started");
    logger.log(LogLevel::Info, "service started");

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down...");
    shutdown.cancel();
    proxy.stop();
    let _ = health_handle.await;
    logger.log(LogLevel::Info, "service stopped");
    log::info!("flightpath service stopped");

    Ok(())
}
