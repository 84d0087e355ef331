//! Rolling per-provider performance window.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Samples kept in the rolling window.
    pub window_size: usize,
    /// Trailing samples that must contain a success for the provider to be
    /// considered reachable.
    pub recent_window: usize,
    pub healthy_threshold: f64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            recent_window: 5,
            healthy_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    response_time: f64,
    cost: Decimal,
    error: bool,
    at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub status: ProviderHealth,
    pub avg_response_time: f64,
    pub success_rate: f64,
    pub sample_count: usize,
    pub total_cost: Decimal,
    /// Seconds since the newest error still in the window.
    pub last_error_age: Option<f64>,
}

#[derive(Debug)]
pub struct HealthMonitor {
    provider_name: String,
    config: HealthMonitorConfig,
    samples: VecDeque<Sample>,
    sum_response_time: f64,
    sum_cost: Decimal,
    errors: usize,
    // consecutive errors at the tail of the window
    trailing_errors: usize,
}

impl HealthMonitor {
    pub fn new(provider_name: String, config: HealthMonitorConfig) -> Self {
        let window_size = config.window_size.max(1);
        Self {
            provider_name,
            config: HealthMonitorConfig { window_size, ..config },
            samples: VecDeque::with_capacity(window_size),
            sum_response_time: 0.0,
            sum_cost: Decimal::ZERO,
            errors: 0,
            trailing_errors: 0,
        }
    }

    pub fn record_performance(&mut self, response_time: f64, cost: Decimal, error: bool) {
        if self.samples.len() == self.config.window_size {
            if let Some(old) = self.samples.pop_front() {
                self.sum_response_time -= old.response_time;
                self.sum_cost -= old.cost;
                if old.error {
                    self.errors -= 1;
                }
            }
        }

        let response_time = response_time.max(0.0);
        self.samples.push_back(Sample {
            response_time,
            cost,
            error,
            at: Instant::now(),
        });
        self.sum_response_time += response_time;
        self.sum_cost += cost;
        if error {
            self.errors += 1;
            self.trailing_errors = (self.trailing_errors + 1).min(self.samples.len());
        } else {
            self.trailing_errors = 0;
        }

        debug!("Health sample for {}: {:.3}s error={} ({} samples)",
               self.provider_name, response_time, error, self.samples.len());
    }

    pub fn success_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        1.0 - self.errors as f64 / self.samples.len() as f64
    }

    pub fn avg_response_time(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        // running sums can drift a hair below zero after many evictions
        (self.sum_response_time / self.samples.len() as f64).max(0.0)
    }

    pub fn last_error_age(&self) -> Option<f64> {
        self.samples
            .iter()
            .rev()
            .find(|sample| sample.error)
            .map(|sample| sample.at.elapsed().as_secs_f64())
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        let count = self.samples.len();
        let success_rate = self.success_rate();
        let recent = self.config.recent_window.max(1).min(count.max(1));

        let status = if count == 0 {
            ProviderHealth::Healthy
        } else if self.trailing_errors >= recent {
            ProviderHealth::Unavailable
        } else if success_rate >= self.config.healthy_threshold {
            ProviderHealth::Healthy
        } else {
            ProviderHealth::Degraded
        };

        HealthSummary {
            status,
            avg_response_time: self.avg_response_time(),
            success_rate,
            sample_count: count,
            total_cost: self.sum_cost,
            last_error_age: self.last_error_age(),
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum_response_time = 0.0;
        self.sum_cost = Decimal::ZERO;
        self.errors = 0;
        self.trailing_errors = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(window: usize, recent: usize) -> HealthMonitor {
        HealthMonitor::new(
            "test".to_string(),
            HealthMonitorConfig {
                window_size: window,
                recent_window: recent,
                healthy_threshold: 0.9,
            },
        )
    }

    #[test]
    fn test_empty_window_is_healthy() {
        let summary = monitor(10, 3).get_health_summary();
        assert_eq!(summary.status, ProviderHealth::Healthy);
        assert_eq!(summary.success_rate, 1.0);
        assert_eq!(summary.sample_count, 0);
        assert_eq!(summary.last_error_age, None);
    }

    #[test]
    fn test_last_error_age_tracks_newest_error() {
        let mut m = monitor(3, 2);
        m.record_performance(1.0, Decimal::ZERO, false);
        assert_eq!(m.last_error_age(), None);

        m.record_performance(1.0, Decimal::ZERO, true);
        m.record_performance(1.0, Decimal::ZERO, false);
        let age = m.get_health_summary().last_error_age.unwrap();
        assert!((0.0..5.0).contains(&age));

        // the error ages out of the window
        m.record_performance(1.0, Decimal::ZERO, false);
        m.record_performance(1.0, Decimal::ZERO, false);
        assert_eq!(m.get_health_summary().last_error_age, None);
    }

    #[test]
    fn test_degraded_then_unavailable() {
        let mut m = monitor(10, 3);
        for _ in 0..8 {
            m.record_performance(1.0, Decimal::ZERO, false);
        }
        m.record_performance(1.0, Decimal::ZERO, true);
        assert_eq!(m.get_health_summary().status, ProviderHealth::Degraded);

        m.record_performance(1.0, Decimal::ZERO, true);
        m.record_performance(1.0, Decimal::ZERO, true);
        assert_eq!(m.get_health_summary().status, ProviderHealth::Unavailable);

        m.record_performance(1.0, Decimal::ZERO, false);
        assert_eq!(m.get_health_summary().status, ProviderHealth::Degraded);
    }

    #[test]
    fn test_window_eviction_keeps_sums() {
        let mut m = monitor(3, 2);
        m.record_performance(10.0, Decimal::new(5, 1), true);
        m.record_performance(1.0, Decimal::ZERO, false);
        m.record_performance(2.0, Decimal::ZERO, false);
        m.record_performance(3.0, Decimal::ZERO, false);

        let summary = m.get_health_summary();
        assert_eq!(summary.sample_count, 3);
        assert!((summary.avg_response_time - 2.0).abs() < 1e-9);
        assert_eq!(summary.success_rate, 1.0);
        assert_eq!(summary.total_cost, Decimal::ZERO);
        assert_eq!(summary.status, ProviderHealth::Healthy);
    }

    #[test]
    fn test_reset() {
        let mut m = monitor(5, 2);
        m.record_performance(1.0, Decimal::ONE, true);
        m.reset();
        assert_eq!(m.get_health_summary().sample_count, 0);
    }
}
