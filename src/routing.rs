use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::runway::Runway;
use crate::tracker::TargetAccessibilityTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    Latency,
    FirstAccessible,
    RoundRobin,
}

impl RoutingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "latency" => Some(Self::Latency),
            "first_accessible" => Some(Self::FirstAccessible),
            "round_robin" => Some(Self::RoundRobin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::FirstAccessible => "first_accessible",
            Self::RoundRobin => "round_robin",
        }
    }
}

/// Picks a runway for a target out of the tracker's accessible subset.
/// The mode is runtime-mutable and takes effect on the very next selection.
pub struct RoutingEngine {
    tracker: Arc<TargetAccessibilityTracker>,
    mode: RwLock<RoutingMode>,
    round_robin_cursor: Mutex<HashMap<String, usize>>,
}

impl RoutingEngine {
    pub fn new(tracker: Arc<TargetAccessibilityTracker>, mode: RoutingMode) -> Self {
        Self {
            tracker,
            mode: RwLock::new(mode),
            round_robin_cursor: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_mode(&self, mode: RoutingMode) {
        *self.mode.write() = mode;
        log::info!("Routing mode changed to {}", mode.as_str());
    }

    pub fn mode(&self) -> RoutingMode {
        *self.mode.read()
    }

    pub fn select_runway(&self, target: &str, runways: &[Runway]) -> Option<Runway> {
        let accessible_ids = self.tracker.get_accessible_runways(target);

        let candidates: Vec<&Runway> = runways
            .iter()
            .filter(|r| accessible_ids.contains(&r.id))
            .collect();

        if candidates.is_empty() {
            // The round-robin cursor only survives while the set is non-empty.
            self.round_robin_cursor.lock().remove(target);
            return None;
        }

        match self.mode() {
            RoutingMode::Latency => self.select_by_latency(target, &candidates),
            RoutingMode::FirstAccessible => Some(candidates[0].clone()),
            RoutingMode::RoundRobin => self.select_round_robin(target, &candidates),
        }
    }

    fn select_by_latency(&self, target: &str, candidates: &[&Runway]) -> Option<Runway> {
        let mut best: Option<(&Runway, f64)> = None;

        for runway in candidates {
            if let Some(metrics) = self.tracker.get_metrics(target, &runway.id) {
                if metrics.avg_response_time > 0.0 {
                    let better = best
                        .as_ref()
                        .map(|(_, avg)| metrics.avg_response_time < *avg)
                        .unwrap_or(true);
                    if better {
                        best = Some((runway, metrics.avg_response_time));
                    }
                }
            }
        }

        best.map(|(r, _)| r.clone())
            .or_else(|| candidates.first().map(|r| (*r).clone()))
    }

    fn select_round_robin(&self, target: &str, candidates: &[&Runway]) -> Option<Runway> {
        let mut cursors = self.round_robin_cursor.lock();
        let cursor = cursors.entry(target.to_string()).or_insert(0);
        let selected = candidates[*cursor % candidates.len()].clone();
        *cursor = (*cursor + 1) % candidates.len();
        Some(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsServerConfig;
    use crate::runway::DnsServer;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn runway(id: &str) -> Runway {
        let dns = Arc::new(DnsServer::new(DnsServerConfig {
            host: "1.1.1.1".to_string(),
            port: 53,
            name: String::new(),
        }));
        Runway::new(
            id.to_string(),
            "eth0".to_string(),
            Ipv4Addr::new(10, 0, 0, 1),
            None,
            dns,
        )
    }

    fn engine_with(
        mode: RoutingMode,
    ) -> (Arc<TargetAccessibilityTracker>, RoutingEngine) {
        let tracker = Arc::new(TargetAccessibilityTracker::new(10, 0.5));
        let engine = RoutingEngine::new(Arc::clone(&tracker), mode);
        (tracker, engine)
    }

    #[test]
    fn no_accessible_runways_selects_none() {
        let (_, engine) = engine_with(RoutingMode::FirstAccessible);
        let runways = vec![runway("r1"), runway("r2")];
        assert!(engine.select_runway("example.com", &runways).is_none());
    }

    #[test]
    fn round_robin_is_exact_over_a_stable_set() {
        let (tracker, engine) = engine_with(RoutingMode::RoundRobin);
        let runways = vec![runway("r1"), runway("r2"), runway("r3")];
        for r in &runways {
            tracker.update("example.com", &r.id, true, true, Duration::from_millis(50));
        }

        let picks: Vec<String> = (0..9)
            .map(|_| engine.select_runway("example.com", &runways).unwrap().id)
            .collect();
        assert_eq!(
            picks,
            vec!["r1", "r2", "r3", "r1", "r2", "r3", "r1", "r2", "r3"]
        );
    }

    #[test]
    fn round_robin_cursor_resets_when_set_empties() {
        let (tracker, engine) = engine_with(RoutingMode::RoundRobin);
        let runways = vec![runway("r1"), runway("r2")];
        for r in &runways {
            tracker.update("h", &r.id, true, true, Duration::from_millis(50));
        }
        assert_eq!(engine.select_runway("h", &runways).unwrap().id, "r1");

        // Drive both pairs inaccessible; the set becomes empty.
        for r in &runways {
            for _ in 0..4 {
                tracker.update("h", &r.id, false, false, Duration::ZERO);
            }
        }
        assert!(engine.select_runway("h", &runways).is_none());

        // Recover both; the rotation starts over at the front.
        for r in &runways {
            tracker.update("h", &r.id, true, true, Duration::from_millis(50));
        }
        assert_eq!(engine.select_runway("h", &runways).unwrap().id, "r1");
    }

    #[test]
    fn latency_mode_prefers_lowest_average() {
        let (tracker, engine) = engine_with(RoutingMode::Latency);
        let runways = vec![runway("slow"), runway("fast")];
        tracker.update("h", "slow", true, true, Duration::from_secs(2));
        tracker.update("h", "fast", true, true, Duration::from_millis(80));
        assert_eq!(engine.select_runway("h", &runways).unwrap().id, "fast");
    }

    #[test]
    fn latency_mode_falls_back_to_first_accessible_without_samples() {
        let (tracker, engine) = engine_with(RoutingMode::Latency);
        let runways = vec![runway("r1"), runway("r2")];
        // Zero-duration successes leave the EMA at zero.
        tracker.update("h", "r1", true, true, Duration::ZERO);
        tracker.update("h", "r2", true, true, Duration::ZERO);
        assert_eq!(engine.select_runway("h", &runways).unwrap().id, "r1");
    }

    #[test]
    fn mode_switch_applies_on_next_selection() {
        let (tracker, engine) = engine_with(RoutingMode::FirstAccessible);
        let runways = vec![runway("r1"), runway("r2")];
        for r in &runways {
            tracker.update("h", &r.id, true, true, Duration::from_millis(50));
        }
        assert_eq!(engine.select_runway("h", &runways).unwrap().id, "r1");
        assert_eq!(engine.select_runway("h", &runways).unwrap().id, "r1");

        engine.set_mode(RoutingMode::RoundRobin);
        assert_eq!(engine.mode(), RoutingMode::RoundRobin);
        assert_eq!(engine.select_runway("h", &runways).unwrap().id, "r1");
        assert_eq!(engine.select_runway("h", &runways).unwrap().id, "r2");
    }
}
