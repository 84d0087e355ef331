use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind};

const WINDOW: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct RateLimits {
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u32>,
    pub daily_budget: Option<Decimal>,
    pub cost_per_request: Decimal,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: Some(60),
            tokens_per_minute: Some(32000),
            daily_budget: None,
            cost_per_request: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    RateLimitExceeded,
    BudgetExceeded,
}

impl RateLimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitReason::RateLimitExceeded => "rate_limit_exceeded",
            RateLimitReason::BudgetExceeded => "budget_exceeded",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RateLimitReason::RateLimitExceeded => ErrorKind::RateLimitExceeded,
            RateLimitReason::BudgetExceeded => ErrorKind::BudgetExceeded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reason: Option<RateLimitReason>,
}

impl RateLimitDecision {
    fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    fn deny(reason: RateLimitReason) -> Self {
        Self { allowed: false, reason: Some(reason) }
    }

    pub fn reason_str(&self) -> &'static str {
        self.reason.map(|r| r.as_str()).unwrap_or("")
    }

    pub fn into_error(self, provider: &str) -> Option<Error> {
        match self.reason? {
            RateLimitReason::RateLimitExceeded => {
                Some(Error::rate_limited(provider, "local request/token window exhausted"))
            }
            RateLimitReason::BudgetExceeded => Some(Error::BudgetExceeded {
                provider: provider.to_string(),
            }),
        }
    }
}

/// Outcome of one completed attempt, fed back after the adapter returns.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub estimated_tokens: u32,
    pub tokens_used: u32,
    pub cost: Decimal,
    pub response_time: f64,
    pub error: bool,
}

/// Per-provider admission control over a sliding one-minute window and a
/// daily spend budget. Callers serialize access (the manager keeps one per
/// provider behind a mutex).
#[derive(Debug)]
pub struct RateLimiter {
    provider_name: String,
    limits: RateLimits,
    request_log: VecDeque<Instant>,
    token_log: VecDeque<(Instant, u32)>,
    window_tokens: u64,
    reserved_tokens: u64,
    daily_cost: Decimal,
    day_started: Instant,
    total_requests: u64,
    total_errors: u64,
    total_tokens: u64,
    total_cost: Decimal,
    total_response_time: f64,
    consecutive_rate_limit_hits: u32,
}

impl RateLimiter {
    pub fn new(provider_name: String, limits: RateLimits) -> Self {
        info!("Creating rate limiter for {} ({:?} rpm, {:?} tpm, budget {:?})",
              provider_name, limits.requests_per_minute, limits.tokens_per_minute, limits.daily_budget);

        Self {
            provider_name,
            limits,
            request_log: VecDeque::new(),
            token_log: VecDeque::new(),
            window_tokens: 0,
            reserved_tokens: 0,
            daily_cost: Decimal::ZERO,
            day_started: Instant::now(),
            total_requests: 0,
            total_errors: 0,
            total_tokens: 0,
            total_cost: Decimal::ZERO,
            total_response_time: 0.0,
            consecutive_rate_limit_hits: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&at) = self.request_log.front() {
            if now.duration_since(at) < WINDOW {
                break;
            }
            self.request_log.pop_front();
        }
        while let Some(&(at, tokens)) = self.token_log.front() {
            if now.duration_since(at) < WINDOW {
                break;
            }
            self.window_tokens -= tokens as u64;
            self.token_log.pop_front();
        }
        if now.duration_since(self.day_started) >= DAY {
            debug!("Reset daily spend for {}", self.provider_name);
            self.daily_cost = Decimal::ZERO;
            self.day_started = now;
        }
    }

    /// Whether a request estimated at `estimated_tokens` fits right now.
    pub fn check(&mut self, estimated_tokens: u32) -> RateLimitDecision {
        let now = Instant::now();
        self.prune(now);

        if let Some(budget) = self.limits.daily_budget {
            if self.daily_cost + self.limits.cost_per_request > budget {
                return RateLimitDecision::deny(RateLimitReason::BudgetExceeded);
            }
        }

        if let Some(rpm) = self.limits.requests_per_minute {
            if self.request_log.len() as u64 >= rpm as u64 {
                return RateLimitDecision::deny(RateLimitReason::RateLimitExceeded);
            }
        }

        if let Some(tpm) = self.limits.tokens_per_minute {
            let projected = self.window_tokens + self.reserved_tokens + estimated_tokens as u64;
            // a single oversized request is still admitted into an idle window
            let idle = self.window_tokens + self.reserved_tokens == 0;
            if projected > tpm as u64 && !idle {
                return RateLimitDecision::deny(RateLimitReason::RateLimitExceeded);
            }
        }

        RateLimitDecision::allow()
    }

    /// Check and, when allowed, count the request against the window.
    pub fn reserve(&mut self, estimated_tokens: u32) -> RateLimitDecision {
        let decision = self.check(estimated_tokens);
        if decision.allowed {
            self.request_log.push_back(Instant::now());
            self.reserved_tokens += estimated_tokens as u64;
            self.consecutive_rate_limit_hits = 0;
        } else {
            self.consecutive_rate_limit_hits += 1;
            warn!("Rate limit hit for {}: {} (consecutive hits: {})",
                  self.provider_name, decision.reason_str(), self.consecutive_rate_limit_hits);
        }
        decision
    }

    /// Returns the tokens reserved by a call that was abandoned before it
    /// finished. The request itself stays counted against the window.
    pub fn release(&mut self, estimated_tokens: u32) {
        self.reserved_tokens = self.reserved_tokens.saturating_sub(estimated_tokens as u64);
        debug!("Released {} reserved tokens for {}", estimated_tokens, self.provider_name);
    }

    pub fn record(&mut self, usage: &UsageRecord) {
        let now = Instant::now();
        self.prune(now);

        self.reserved_tokens = self.reserved_tokens.saturating_sub(usage.estimated_tokens as u64);
        if usage.tokens_used > 0 {
            self.token_log.push_back((now, usage.tokens_used));
            self.window_tokens += usage.tokens_used as u64;
        }

        self.daily_cost += usage.cost;
        self.total_requests += 1;
        self.total_tokens += usage.tokens_used as u64;
        self.total_cost += usage.cost;
        self.total_response_time += usage.response_time.max(0.0);
        if usage.error {
            self.total_errors += 1;
        }

        debug!("Recorded usage for {}: {} tokens, cost {}, {:.3}s, error={}",
               self.provider_name, usage.tokens_used, usage.cost, usage.response_time, usage.error);
    }

    pub fn total_cost(&self) -> Decimal {
        self.total_cost
    }

    pub fn daily_cost(&self) -> Decimal {
        self.daily_cost
    }

    pub fn status(&mut self) -> RateLimiterStatus {
        self.prune(Instant::now());

        RateLimiterStatus {
            provider_name: self.provider_name.clone(),
            requests_in_window: self.request_log.len() as u32,
            requests_per_minute: self.limits.requests_per_minute,
            tokens_in_window: self.window_tokens + self.reserved_tokens,
            tokens_per_minute: self.limits.tokens_per_minute,
            daily_cost: self.daily_cost,
            daily_budget: self.limits.daily_budget,
            total_requests: self.total_requests,
            total_errors: self.total_errors,
            total_tokens: self.total_tokens,
            total_cost: self.total_cost,
            average_response_time: if self.total_requests > 0 {
                self.total_response_time / self.total_requests as f64
            } else {
                0.0
            },
            consecutive_rate_limit_hits: self.consecutive_rate_limit_hits,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStatus {
    pub provider_name: String,
    pub requests_in_window: u32,
    pub requests_per_minute: Option<u32>,
    pub tokens_in_window: u64,
    pub tokens_per_minute: Option<u32>,
    pub daily_cost: Decimal,
    pub daily_budget: Option<Decimal>,
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub average_response_time: f64,
    pub consecutive_rate_limit_hits: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rpm: u32, tpm: u32) -> RateLimits {
        RateLimits {
            requests_per_minute: Some(rpm),
            tokens_per_minute: Some(tpm),
            daily_budget: None,
            cost_per_request: Decimal::ZERO,
        }
    }

    fn usage(estimated: u32, used: u32, cost: Decimal) -> UsageRecord {
        UsageRecord {
            estimated_tokens: estimated,
            tokens_used: used,
            cost,
            response_time: 0.5,
            error: false,
        }
    }

    #[test]
    fn test_first_call_is_admitted() {
        let mut limiter = RateLimiter::new("test".to_string(), limits(1, 10));
        // larger than the whole token budget, but nothing is in the window yet
        assert!(limiter.check(500).allowed);
        assert!(limiter.reserve(500).allowed);
    }

    #[test]
    fn test_request_window_exhaustion() {
        let mut limiter = RateLimiter::new("test".to_string(), limits(2, 100_000));

        assert!(limiter.reserve(10).allowed);
        assert!(limiter.reserve(10).allowed);

        let decision = limiter.reserve(10);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(RateLimitReason::RateLimitExceeded));
        assert_eq!(decision.reason_str(), "rate_limit_exceeded");
        assert_eq!(limiter.status().consecutive_rate_limit_hits, 1);
    }

    #[test]
    fn test_token_window_counts_reservations_and_usage() {
        let mut limiter = RateLimiter::new("test".to_string(), limits(100, 1000));

        assert!(limiter.reserve(600).allowed);
        // reservation still pending
        assert!(!limiter.check(600).allowed);

        limiter.record(&usage(600, 300, Decimal::ZERO));
        assert!(limiter.check(600).allowed);
        assert!(!limiter.check(701).allowed);
    }

    #[test]
    fn test_release_returns_abandoned_reservation() {
        let mut limiter = RateLimiter::new("test".to_string(), limits(100, 1000));

        assert!(limiter.reserve(600).allowed);
        limiter.release(600);
        assert_eq!(limiter.status().tokens_in_window, 0);
        assert_eq!(limiter.status().requests_in_window, 1);
        assert_eq!(limiter.status().total_requests, 0);
        assert!(limiter.check(900).allowed);
    }

    #[test]
    fn test_daily_budget() {
        let mut limiter = RateLimiter::new(
            "test".to_string(),
            RateLimits {
                requests_per_minute: None,
                tokens_per_minute: None,
                daily_budget: Some(Decimal::new(10, 2)),
                cost_per_request: Decimal::new(4, 2),
            },
        );

        assert!(limiter.reserve(0).allowed);
        limiter.record(&usage(0, 0, Decimal::new(4, 2)));
        assert!(limiter.reserve(0).allowed);
        limiter.record(&usage(0, 0, Decimal::new(4, 2)));

        // 0.08 spent, 0.04 projected, budget 0.10
        let decision = limiter.check(0);
        assert_eq!(decision.reason, Some(RateLimitReason::BudgetExceeded));
        assert_eq!(limiter.daily_cost(), Decimal::new(8, 2));
        assert_eq!(
            decision.into_error("test").map(|e| e.kind()),
            Some(ErrorKind::BudgetExceeded)
        );
    }

    #[test]
    fn test_record_accumulates_totals() {
        let mut limiter = RateLimiter::new("test".to_string(), RateLimits::default());
        limiter.record(&usage(10, 20, Decimal::new(1, 2)));
        limiter.record(&UsageRecord { error: true, ..usage(10, 0, Decimal::ZERO) });

        let status = limiter.status();
        assert_eq!(status.total_requests, 2);
        assert_eq!(status.total_errors, 1);
        assert_eq!(status.total_tokens, 20);
        assert_eq!(status.total_cost, Decimal::new(1, 2));
        assert!((status.average_response_time - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_unlimited() {
        let mut limiter = RateLimiter::new(
            "test".to_string(),
            RateLimits {
                requests_per_minute: None,
                tokens_per_minute: None,
                daily_budget: None,
                cost_per_request: Decimal::ZERO,
            },
        );
        for _ in 0..1000 {
            assert!(limiter.reserve(10_000).allowed);
        }
    }
}
