use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::runway::RunwayState;

const EMA_ALPHA: f64 = 0.3;
const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone)]
pub struct TargetMetrics {
    pub target: String,
    pub runway_id: String,
    pub state: RunwayState,
    pub network_success_count: u64,
    pub user_success_count: u64,
    pub failure_count: u64,
    pub partial_success_count: u64,
    pub total_attempts: u64,
    pub avg_response_time: f64,
    pub last_success_time: Option<u64>,
    pub last_failure_time: Option<u64>,
    pub consecutive_failures: u32,
    pub recovery_count: u64,
    pub success_rate: f64,
    pub recent_attempts: VecDeque<bool>,
}

impl TargetMetrics {
    fn new(target: String, runway_id: String) -> Self {
        Self {
            target,
            runway_id,
            state: RunwayState::Unknown,
            network_success_count: 0,
            user_success_count: 0,
            failure_count: 0,
            partial_success_count: 0,
            total_attempts: 0,
            avg_response_time: 0.0,
            last_success_time: None,
            last_failure_time: None,
            consecutive_failures: 0,
            recovery_count: 0,
            success_rate: 0.0,
            recent_attempts: VecDeque::new(),
        }
    }

    fn update_success_rate(&mut self) {
        if self.recent_attempts.is_empty() {
            self.success_rate = 0.0;
            return;
        }
        let successes = self.recent_attempts.iter().filter(|&&bit| bit).count();
        self.success_rate = successes as f64 / self.recent_attempts.len() as f64;
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Sliding-window success model per (target, runway). The outer map is
/// sharded by target, so all mutations for one target serialise on its shard.
pub struct TargetAccessibilityTracker {
    metrics: DashMap<String, HashMap<String, TargetMetrics>>,
    success_rate_window: usize,
    success_rate_threshold: f64,
}

impl TargetAccessibilityTracker {
    pub fn new(success_rate_window: usize, success_rate_threshold: f64) -> Self {
        Self {
            metrics: DashMap::new(),
            success_rate_window,
            success_rate_threshold,
        }
    }

    pub fn update(
        &self,
        target: &str,
        runway_id: &str,
        network_success: bool,
        user_success: bool,
        response_time: Duration,
    ) {
        let mut target_map = self.metrics.entry(target.to_string()).or_default();
        let metrics = target_map
            .entry(runway_id.to_string())
            .or_insert_with(|| TargetMetrics::new(target.to_string(), runway_id.to_string()));

        let prev_state = metrics.state;
        metrics.total_attempts += 1;

        metrics.recent_attempts.push_back(user_success);
        while metrics.recent_attempts.len() > self.success_rate_window {
            metrics.recent_attempts.pop_front();
        }

        if network_success && user_success {
            metrics.network_success_count += 1;
            metrics.user_success_count += 1;
            metrics.state = RunwayState::Accessible;
            metrics.last_success_time = Some(epoch_secs());
            metrics.consecutive_failures = 0;

            let sample = response_time.as_secs_f64();
            metrics.avg_response_time = if metrics.avg_response_time == 0.0 {
                sample
            } else {
                metrics.avg_response_time * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA
            };

            if prev_state == RunwayState::Inaccessible {
                metrics.recovery_count += 1;
                log::info!("Recovery detected: {} via {}", target, runway_id);
            }
        } else if network_success {
            // Transport worked but the content looks gated.
            metrics.network_success_count += 1;
            metrics.partial_success_count += 1;
            metrics.state = RunwayState::PartiallyAccessible;
        } else {
            metrics.failure_count += 1;
            metrics.last_failure_time = Some(epoch_secs());
            metrics.consecutive_failures += 1;
            if metrics.consecutive_failures > CONSECUTIVE_FAILURE_LIMIT {
                metrics.state = RunwayState::Inaccessible;
            }
        }

        metrics.update_success_rate();
    }

    /// Flags a pair as under probe until the probe reports a definitive
    /// outcome through `update`.
    pub fn mark_testing(&self, target: &str, runway_id: &str) {
        let mut target_map = self.metrics.entry(target.to_string()).or_default();
        let metrics = target_map
            .entry(runway_id.to_string())
            .or_insert_with(|| TargetMetrics::new(target.to_string(), runway_id.to_string()));
        metrics.state = RunwayState::Testing;
    }

    pub fn get_accessible_runways(&self, target: &str) -> Vec<String> {
        match self.metrics.get(target) {
            Some(target_map) => target_map
                .iter()
                .filter_map(|(runway_id, metrics)| match metrics.state {
                    RunwayState::Accessible => Some(runway_id.clone()),
                    RunwayState::PartiallyAccessible
                        if metrics.success_rate >= self.success_rate_threshold =>
                    {
                        Some(runway_id.clone())
                    }
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn get_metrics(&self, target: &str, runway_id: &str) -> Option<TargetMetrics> {
        self.metrics.get(target)?.get(runway_id).cloned()
    }

    pub fn get_all_targets(&self) -> Vec<String> {
        self.metrics.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get_target_metrics(&self, target: &str) -> HashMap<String, TargetMetrics> {
        self.metrics
            .get(target)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> TargetAccessibilityTracker {
        TargetAccessibilityTracker::new(10, 0.5)
    }

    const RT: Duration = Duration::from_millis(100);

    #[test]
    fn fourth_consecutive_failure_becomes_inaccessible() {
        let t = tracker();
        for i in 1..=3 {
            t.update("example.com", "r1", false, false, RT);
            let m = t.get_metrics("example.com", "r1").unwrap();
            assert_eq!(m.consecutive_failures, i);
            assert_ne!(m.state, RunwayState::Inaccessible);
        }
        t.update("example.com", "r1", false, false, RT);
        let m = t.get_metrics("example.com", "r1").unwrap();
        assert_eq!(m.consecutive_failures, 4);
        assert_eq!(m.state, RunwayState::Inaccessible);
    }

    #[test]
    fn recovery_counted_once_per_inaccessible_episode() {
        let t = tracker();
        for _ in 0..4 {
            t.update("example.com", "r1", false, false, RT);
        }
        t.update("example.com", "r1", true, true, RT);
        let m = t.get_metrics("example.com", "r1").unwrap();
        assert_eq!(m.state, RunwayState::Accessible);
        assert_eq!(m.recovery_count, 1);
        assert_eq!(m.consecutive_failures, 0);

        t.update("example.com", "r1", true, true, RT);
        assert_eq!(t.get_metrics("example.com", "r1").unwrap().recovery_count, 1);
    }

    #[test]
    fn partial_outcome_does_not_touch_consecutive_failures() {
        let t = tracker();
        t.update("example.com", "r1", false, false, RT);
        t.update("example.com", "r1", true, false, RT);
        let m = t.get_metrics("example.com", "r1").unwrap();
        assert_eq!(m.state, RunwayState::PartiallyAccessible);
        assert_eq!(m.consecutive_failures, 1);
        assert_eq!(m.partial_success_count, 1);
    }

    #[test]
    fn window_evicts_oldest_and_never_exceeds_n() {
        let t = TargetAccessibilityTracker::new(3, 0.5);
        t.update("h", "r", true, true, RT);
        t.update("h", "r", true, true, RT);
        t.update("h", "r", true, false, RT);
        t.update("h", "r", true, false, RT);
        t.update("h", "r", true, false, RT);
        let m = t.get_metrics("h", "r").unwrap();
        assert_eq!(m.recent_attempts.len(), 3);
        assert_eq!(m.recent_attempts, VecDeque::from(vec![false, false, false]));
        assert_eq!(m.success_rate, 0.0);
    }

    #[test]
    fn accessible_set_honours_partial_threshold() {
        let t = TargetAccessibilityTracker::new(4, 0.5);
        // r1 fully accessible.
        t.update("h", "r1", true, true, RT);
        // r2 partial with a 50% window: qualifies at threshold 0.5.
        t.update("h", "r2", true, true, RT);
        t.update("h", "r2", true, false, RT);
        // r3 partial with a 0% window: excluded.
        t.update("h", "r3", true, false, RT);
        // r4 untouched: not even present.

        let mut accessible = t.get_accessible_runways("h");
        accessible.sort();
        assert_eq!(accessible, vec!["r1".to_string(), "r2".to_string()]);
    }

    #[test]
    fn counter_invariants_hold_under_mixed_outcomes() {
        let t = tracker();
        let outcomes = [
            (true, true),
            (true, false),
            (false, false),
            (true, true),
            (false, false),
            (true, false),
        ];
        for (net, user) in outcomes {
            t.update("h", "r", net, user, RT);
        }
        let m = t.get_metrics("h", "r").unwrap();
        assert!(m.user_success_count <= m.network_success_count);
        assert!(m.network_success_count <= m.total_attempts);
        assert_eq!(m.total_attempts, outcomes.len() as u64);
        assert_eq!(
            m.partial_success_count,
            m.network_success_count - m.user_success_count
        );
        assert!(m.success_rate >= 0.0 && m.success_rate <= 1.0);
    }

    #[test]
    fn ema_initialises_then_blends() {
        let t = tracker();
        t.update("h", "r", true, true, Duration::from_secs(1));
        assert_eq!(t.get_metrics("h", "r").unwrap().avg_response_time, 1.0);
        t.update("h", "r", true, true, Duration::from_secs(2));
        let avg = t.get_metrics("h", "r").unwrap().avg_response_time;
        assert!((avg - (0.7 + 0.6)).abs() < 1e-9);
    }

    #[test]
    fn testing_pairs_are_not_accessible() {
        let t = tracker();
        t.update("h", "r", true, true, RT);
        t.mark_testing("h", "r");
        assert!(t.get_accessible_runways("h").is_empty());
        t.update("h", "r", true, true, RT);
        assert_eq!(t.get_accessible_runways("h"), vec!["r".to_string()]);
    }
}
