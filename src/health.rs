use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::runway::RunwayState;
use crate::runway_manager::RunwayManager;
use crate::tracker::TargetAccessibilityTracker;

const MAX_TARGETS_PER_CYCLE: usize = 10;
const MAX_INACCESSIBLE_PROBES: usize = 5;
const MAX_PARTIAL_PROBES: usize = 3;

/// Background cycle that re-probes failed and partially accessible pairs.
/// Known-accessible pairs are left to the request path.
pub struct HealthMonitor {
    runway_manager: Arc<RunwayManager>,
    tracker: Arc<TargetAccessibilityTracker>,
    interval: Duration,
    probe_timeout: Duration,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        runway_manager: Arc<RunwayManager>,
        tracker: Arc<TargetAccessibilityTracker>,
        interval_secs: u64,
        probe_timeout_secs: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runway_manager,
            tracker,
            interval: Duration::from_secs(interval_secs),
            probe_timeout: Duration::from_secs(probe_timeout_secs),
            shutdown,
        }
    }

    pub async fn run(&self) {
        log::info!("Health monitor started (interval: {:?})", self.interval);
        loop {
            self.cycle().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        log::info!("Health monitor stopped");
    }

    async fn cycle(&self) {
        self.runway_manager.refresh_interfaces();
        // Pick up runways for any interface that appeared since last cycle.
        self.runway_manager.discover_runways();

        let targets = self.tracker.get_all_targets();
        if targets.is_empty() {
            return;
        }

        // Bounded per cycle to avoid probe stampedes.
        for target in targets.into_iter().take(MAX_TARGETS_PER_CYCLE) {
            let metrics = self.tracker.get_target_metrics(&target);

            let inaccessible = metrics
                .iter()
                .filter(|(_, m)| m.state == RunwayState::Inaccessible)
                .map(|(id, _)| id.clone())
                .take(MAX_INACCESSIBLE_PROBES);
            let partial = metrics
                .iter()
                .filter(|(_, m)| m.state == RunwayState::PartiallyAccessible)
                .map(|(id, _)| id.clone())
                .take(MAX_PARTIAL_PROBES);
            let to_probe: Vec<String> = inaccessible.chain(partial).collect();

            for runway_id in to_probe {
                if self.shutdown.is_cancelled() {
                    return;
                }
                let Some(runway) = self.runway_manager.get_runway(&runway_id) else {
                    continue;
                };
                self.tracker.mark_testing(&target, &runway_id);
                let (net_ok, user_ok, rtt) = self
                    .runway_manager
                    .test_runway_accessibility(&target, &runway, self.probe_timeout)
                    .await;
                self.tracker.update(&target, &runway_id, net_ok, user_ok, rtt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsServerConfig;
    use crate::dns::DnsResolver;
    use crate::interfaces::InterfaceInventory;
    use crate::runway::DnsServer;

    fn build() -> (Arc<RunwayManager>, Arc<TargetAccessibilityTracker>, HealthMonitor) {
        let servers = vec![Arc::new(DnsServer::new(DnsServerConfig {
            host: "1.1.1.1".to_string(),
            port: 53,
            name: String::new(),
        }))];
        let resolver = Arc::new(DnsResolver::new(servers.clone(), 0.2));
        let manager = Arc::new(RunwayManager::new(
            vec!["auto".to_string()],
            vec![],
            servers,
            resolver,
            Arc::new(InterfaceInventory::new()),
        ));
        let tracker = Arc::new(TargetAccessibilityTracker::new(10, 0.5));
        let monitor = HealthMonitor::new(
            Arc::clone(&manager),
            Arc::clone(&tracker),
            60,
            1,
            CancellationToken::new(),
        );
        (manager, tracker, monitor)
    }

    #[tokio::test]
    async fn cycle_reprobes_inaccessible_pairs_and_skips_accessible() {
        let (manager, tracker, monitor) = build();
        let runways = manager.discover_runways();
        let Some(lo) = runways.iter().find(|r| r.source_ip.is_loopback()) else {
            return;
        };

        // One pair driven inaccessible, one healthy.
        for _ in 0..4 {
            tracker.update("192.0.2.10", &lo.id, false, false, Duration::ZERO);
        }
        tracker.update("203.0.113.7", &lo.id, true, true, Duration::from_millis(10));

        let failed_before = tracker
            .get_metrics("192.0.2.10", &lo.id)
            .unwrap()
            .total_attempts;
        let healthy_before = tracker
            .get_metrics("203.0.113.7", &lo.id)
            .unwrap()
            .total_attempts;

        monitor.cycle().await;

        // The failed pair was probed (another attempt recorded)...
        assert!(
            tracker
                .get_metrics("192.0.2.10", &lo.id)
                .unwrap()
                .total_attempts
                > failed_before
        );
        // ...while the accessible pair was left alone.
        assert_eq!(
            tracker
                .get_metrics("203.0.113.7", &lo.id)
                .unwrap()
                .total_attempts,
            healthy_before
        );
    }

    #[tokio::test]
    async fn run_exits_promptly_on_shutdown() {
        let (_, _, monitor) = build();
        monitor.shutdown.cancel();
        // Must return rather than sleep out the full interval.
        tokio::time::timeout(Duration::from_secs(5), monitor.run())
            .await
            .expect("health loop did not exit on cancel");
    }
}
