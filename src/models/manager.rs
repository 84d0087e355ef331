use arc_swap::ArcSwap;
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::models::cache::{request_fingerprint, CacheConfig, CacheStats, ResponseCache};
use crate::models::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::models::health::{HealthMonitor, HealthMonitorConfig, HealthSummary};
use crate::models::provider::{AnalysisRequest, AnalysisResponse, HealthStatus, ProviderAdapter};
use crate::models::rate_limiter::{RateLimitDecision, RateLimiter, RateLimiterStatus, RateLimits, UsageRecord};
use crate::models::selection::{
    AdaptiveWeights, ProviderSnapshot, SelectionContext, SelectionStrategy, StrategyTable,
};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub strategy: SelectionStrategy,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health: HealthMonitorConfig,
    pub weights: AdaptiveWeights,
    /// Extra invocations allowed after the first provider fails.
    pub max_fallback_attempts: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::Priority,
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health: HealthMonitorConfig::default(),
            weights: AdaptiveWeights::default(),
            max_fallback_attempts: 1,
        }
    }
}

/// Static per-provider settings the manager needs for routing.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub weight: f64,
    pub timeout: Duration,
    /// Zero disables periodic health checks.
    pub health_check_interval: Duration,
    pub limits: RateLimits,
}

impl ProviderSettings {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            priority,
            weight: 1.0,
            timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(300),
            limits: RateLimits::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct HealthCheckRecord {
    checked_at: Instant,
    status: HealthStatus,
}

/// Runtime state for one configured provider. Owned by the manager only.
struct ProviderSlot {
    settings: ProviderSettings,
    adapter: Arc<dyn ProviderAdapter>,
    enabled: AtomicBool,
    breaker: CircuitBreaker,
    limiter: Mutex<RateLimiter>,
    health: Mutex<HealthMonitor>,
    in_flight: AtomicU32,
    last_health_check: Mutex<Option<HealthCheckRecord>>,
    health_check_running: AtomicBool,
}

impl ProviderSlot {
    fn new(settings: ProviderSettings, adapter: Arc<dyn ProviderAdapter>, config: &ManagerConfig) -> Self {
        let name = settings.name.clone();
        Self {
            enabled: AtomicBool::new(settings.enabled),
            breaker: CircuitBreaker::with_config(name.clone(), &config.circuit_breaker),
            limiter: Mutex::new(RateLimiter::new(name.clone(), settings.limits.clone())),
            health: Mutex::new(HealthMonitor::new(name, config.health.clone())),
            in_flight: AtomicU32::new(0),
            last_health_check: Mutex::new(None),
            health_check_running: AtomicBool::new(false),
            settings,
            adapter,
        }
    }

    fn name(&self) -> &str {
        &self.settings.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn passed_health_check(&self) -> bool {
        self.last_health_check
            .lock()
            .as_ref()
            .map(|record| record.status.is_healthy)
            .unwrap_or(true)
    }

    fn health_check_due(&self) -> bool {
        let interval = self.settings.health_check_interval;
        if interval.is_zero() {
            return false;
        }
        match self.last_health_check.lock().as_ref() {
            Some(record) => record.checked_at.elapsed() >= interval,
            None => true,
        }
    }

    fn snapshot(&self) -> ProviderSnapshot {
        let health = self.health.lock();
        ProviderSnapshot {
            name: self.settings.name.clone(),
            priority: self.settings.priority,
            weight: self.settings.weight,
            avg_response_time: health.avg_response_time(),
            success_rate: health.success_rate(),
            cost_per_request: self.settings.limits.cost_per_request,
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }

    fn reset_runtime_state(&self) {
        self.breaker.force_close();
        self.health.lock().reset();
        *self.limiter.lock() = RateLimiter::new(self.settings.name.clone(), self.settings.limits.clone());
        *self.last_health_check.lock() = None;
        debug!("Reset runtime state for {}", self.settings.name);
    }
}

struct InFlightGuard<'a>(&'a AtomicU32);

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds a breaker admission and the limiter reservation of one call until
/// its outcome is recorded. A call that ends without an outcome, including a
/// request future dropped by its caller, hands its half-open trial and its
/// reserved tokens back.
struct DispatchGuard<'a> {
    slot: &'a ProviderSlot,
    admission: Admission,
    reserved_tokens: Option<u32>,
    settled: bool,
}

impl<'a> DispatchGuard<'a> {
    fn new(slot: &'a ProviderSlot, admission: Admission) -> Self {
        Self {
            slot,
            admission,
            reserved_tokens: None,
            settled: false,
        }
    }

    fn reserve(&mut self, estimated_tokens: u32) -> RateLimitDecision {
        let decision = self.slot.limiter.lock().reserve(estimated_tokens);
        if decision.allowed {
            self.reserved_tokens = Some(estimated_tokens);
        }
        decision
    }

    fn succeeded(mut self, usage: &UsageRecord) {
        self.slot.breaker.record_success(self.admission);
        self.slot.limiter.lock().record(usage);
        self.settled = true;
    }

    /// `counts` is false when the request, not the provider, was at fault.
    fn failed(mut self, usage: &UsageRecord, counts: bool) {
        if counts {
            self.slot.breaker.record_failure(self.admission);
        } else if self.admission == Admission::Trial {
            self.slot.breaker.release_trial();
        }
        self.slot.limiter.lock().record(usage);
        self.settled = true;
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.admission == Admission::Trial {
            self.slot.breaker.release_trial();
        }
        if let Some(tokens) = self.reserved_tokens {
            self.slot.limiter.lock().release(tokens);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatusReport {
    pub name: String,
    pub enabled: bool,
    pub available: bool,
    pub priority: i32,
    pub weight: f64,
    pub circuit: CircuitBreakerStats,
    pub health: HealthSummary,
    pub active_requests: u32,
    pub rate_limiter: RateLimiterStatus,
    pub last_health_check: Option<HealthStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderCost {
    pub total_cost: Decimal,
    pub daily_cost: Decimal,
    pub daily_budget: Option<Decimal>,
    pub total_requests: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CostSummary {
    pub providers: BTreeMap<String, ProviderCost>,
    pub total_cost: Decimal,
    pub total_requests: u64,
}

/// Central selection, dispatch and fallback orchestration across providers.
pub struct ProviderManager {
    slots: BTreeMap<String, Arc<ProviderSlot>>,
    cache: Arc<ResponseCache>,
    strategy: ArcSwap<SelectionStrategy>,
    table: StrategyTable,
    config: ManagerConfig,
    rotation: AtomicUsize,
}

impl ProviderManager {
    pub fn new(config: ManagerConfig) -> Self {
        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        Self::with_cache(config, cache)
    }

    /// Build a manager around an existing cache, so its lifetime can be
    /// shared with or controlled by the caller.
    pub fn with_cache(config: ManagerConfig, cache: Arc<ResponseCache>) -> Self {
        info!("Creating provider manager with {} strategy", config.strategy);

        Self {
            slots: BTreeMap::new(),
            cache,
            strategy: ArcSwap::from_pointee(config.strategy),
            table: StrategyTable::default(),
            config,
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn add_provider(&mut self, settings: ProviderSettings, adapter: Arc<dyn ProviderAdapter>) -> Result<()> {
        if self.slots.contains_key(&settings.name) {
            return Err(Error::validation(format!("Provider {} registered twice", settings.name)));
        }
        debug!("Adding provider to manager: {} (priority {})", settings.name, settings.priority);

        let name = settings.name.clone();
        let slot = ProviderSlot::new(settings, adapter, &self.config);
        self.slots.insert(name, Arc::new(slot));
        Ok(())
    }

    pub fn strategy_table_mut(&mut self) -> &mut StrategyTable {
        &mut self.table
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn strategy(&self) -> SelectionStrategy {
        **self.strategy.load()
    }

    pub fn set_strategy(&self, strategy: SelectionStrategy) {
        info!("Switching selection strategy to {}", strategy);
        self.strategy.store(Arc::new(strategy));
    }

    /// Enabling a disabled provider starts it from a clean runtime state.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| Error::validation(format!("Unknown provider: {}", name)))?;

        let was_enabled = slot.enabled.swap(enabled, Ordering::AcqRel);
        if enabled && !was_enabled {
            slot.reset_runtime_state();
            info!("Enabled provider {}", name);
        } else if !enabled && was_enabled {
            info!("Disabled provider {}", name);
        }
        Ok(())
    }

    /// Initializes every enabled adapter; providers that fail are disabled.
    /// Returns the number of providers ready to serve.
    pub async fn initialize_all(&self) -> usize {
        let slots: Vec<_> = self.slots.values().filter(|s| s.is_enabled()).cloned().collect();
        let results = join_all(slots.iter().map(|slot| async move {
            let result = timeout(slot.settings.timeout, slot.adapter.initialize()).await;
            (slot, result)
        }))
        .await;

        let mut ready = 0;
        for (slot, result) in results {
            match result {
                Ok(Ok(true)) => {
                    ready += 1;
                    info!("Provider {} initialized", slot.name());
                }
                Ok(Ok(false)) => {
                    warn!("Provider {} reported it is not ready, disabling", slot.name());
                    slot.enabled.store(false, Ordering::Release);
                }
                Ok(Err(e)) => {
                    warn!("Provider {} failed to initialize: {}, disabling", slot.name(), e);
                    slot.enabled.store(false, Ordering::Release);
                }
                Err(_) => {
                    warn!("Provider {} timed out during initialization, disabling", slot.name());
                    slot.enabled.store(false, Ordering::Release);
                }
            }
        }
        ready
    }

    pub async fn shutdown_all(&self) {
        join_all(self.slots.values().map(|slot| slot.adapter.shutdown())).await;
        self.cache.clear();
        info!("Provider manager shut down");
    }

    /// Runs health checks that are due, concurrently. Providers already
    /// being checked by another task keep their last known result.
    pub async fn refresh_health(&self) {
        let due: Vec<_> = self
            .slots
            .values()
            .filter(|slot| slot.is_enabled() && slot.health_check_due())
            .filter(|slot| {
                slot.health_check_running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .cloned()
            .collect();

        if due.is_empty() {
            return;
        }

        join_all(due.iter().map(|slot| async move {
            let status = match timeout(slot.settings.timeout, slot.adapter.health_check()).await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => HealthStatus::unhealthy(e.to_string()),
                Err(_) => HealthStatus::unhealthy("health check timed out"),
            };
            if !status.is_healthy {
                warn!("Health check failed for {}: {:?}", slot.name(), status.error_message);
            }
            *slot.last_health_check.lock() = Some(HealthCheckRecord {
                checked_at: Instant::now(),
                status,
            });
            slot.health_check_running.store(false, Ordering::Release);
        }))
        .await;
    }

    fn available_slots(&self) -> Vec<Arc<ProviderSlot>> {
        self.slots
            .values()
            .filter(|slot| {
                let available = slot.is_enabled() && slot.breaker.is_available() && slot.passed_health_check();
                if !available {
                    debug!("Provider {} unavailable (enabled={}, breaker={:?})",
                           slot.name(), slot.is_enabled(), slot.breaker.get_state().label());
                }
                available
            })
            .cloned()
            .collect()
    }

    /// Available providers best-first under the active strategy, with an
    /// explicit request target moved to the front.
    pub fn selection_order(&self, request: &AnalysisRequest) -> Vec<String> {
        let rotation = self.rotation.load(Ordering::Acquire);
        self.ordered_slots(request, rotation)
            .iter()
            .map(|slot| slot.name().to_string())
            .collect()
    }

    fn ordered_slots(&self, request: &AnalysisRequest, rotation: usize) -> Vec<Arc<ProviderSlot>> {
        let available = self.available_slots();
        let snapshots = available.iter().map(|slot| slot.snapshot()).collect();
        let context = SelectionContext {
            rotation,
            weights: &self.config.weights,
        };
        let mut order = self.table.order(self.strategy(), snapshots, &context);

        if let Some(target) = &request.target {
            if let Some(pos) = order.iter().position(|name| *name == target.provider) {
                let preferred = order.remove(pos);
                order.insert(0, preferred);
            } else {
                debug!("Requested provider {} is not available, using {} order",
                       target.provider, self.strategy());
            }
        }

        order
            .into_iter()
            .filter_map(|name| available.iter().find(|slot| slot.name() == name).cloned())
            .collect()
    }

    /// Serves one request. Never fails: errors come back as a response with
    /// `error` set.
    pub async fn process_request(&self, request: &AnalysisRequest) -> AnalysisResponse {
        let started = Instant::now();

        let request = match request.resolve_image().await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Rejecting request {}: {}", request.id, e);
                return self.error_response(&request.id, &e, started, 0);
            }
        };

        let key = request_fingerprint(&request);
        if let Some(mut cached) = self.cache.get(&key) {
            debug!("Cache hit for request {} ({})", request.id, cached.provider);
            cached.request_id = request.id.clone();
            cached.metadata.cached = true;
            return cached;
        }

        self.refresh_health().await;

        let rotation = self.rotation.fetch_add(1, Ordering::AcqRel);
        let mut remaining = self.ordered_slots(&request, rotation);
        if remaining.is_empty() {
            warn!("No providers available for request {}", request.id);
            return self.error_response(&request.id, &Error::NoProvidersAvailable, started, 0);
        }

        let max_invocations = 1 + self.config.max_fallback_attempts;
        let estimated_tokens = request.estimated_tokens();
        let mut invocations: u32 = 0;
        let mut tried: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        let mut skip_error: Option<Error> = None;

        while !remaining.is_empty() && (invocations as usize) < max_invocations {
            let slot = remaining.remove(0);

            let Some(admission) = slot.breaker.try_acquire() else {
                debug!("Skipping {}: circuit breaker rejected the call", slot.name());
                continue;
            };
            let mut dispatch = DispatchGuard::new(&slot, admission);

            let decision = dispatch.reserve(estimated_tokens);
            if !decision.allowed {
                info!("Skipping {}: {}", slot.name(), decision.reason_str());
                skip_error = decision.into_error(slot.name());
                continue;
            }

            invocations += 1;
            tried.push(slot.name().to_string());
            if invocations > 1 {
                info!("Falling back to {} for request {} (attempt {}/{})",
                      slot.name(), request.id, invocations, max_invocations);
            }

            match self.invoke(&slot, &request, estimated_tokens, dispatch).await {
                Ok(mut response) => {
                    response.metadata.attempts = invocations;
                    response.metadata.fallback_used = invocations > 1;
                    self.cache.put(key, response.clone());
                    info!("Request {} served by {} in {:.2}s",
                          request.id, response.provider, started.elapsed().as_secs_f64());
                    return response;
                }
                Err(e) if !e.is_retryable() => {
                    warn!("Non-retryable failure from {} for request {}: {}", slot.name(), request.id, e);
                    return self.error_response(&request.id, &e, started, invocations);
                }
                Err(e) => {
                    warn!("Provider {} failed for request {}: {}", slot.name(), request.id, e);
                    failures.push(format!("{}: {}", slot.name(), e));
                    // after the first failure the chain continues in priority order
                    remaining.sort_by(|a, b| {
                        a.settings
                            .priority
                            .cmp(&b.settings.priority)
                            .then_with(|| a.name().cmp(b.name()))
                    });
                }
            }
        }

        let err = if invocations == 0 {
            skip_error.unwrap_or(Error::NoProvidersAvailable)
        } else {
            Error::AllProvidersFailed(failures.join("; "))
        };
        error!("Request {} failed after trying {:?}: {}", request.id, tried, err);
        self.error_response(&request.id, &err, started, invocations)
    }

    async fn invoke(
        &self,
        slot: &ProviderSlot,
        request: &AnalysisRequest,
        estimated_tokens: u32,
        dispatch: DispatchGuard<'_>,
    ) -> Result<AnalysisResponse> {
        let _in_flight = InFlightGuard::new(&slot.in_flight);
        let started = Instant::now();
        let limit = slot.settings.timeout;

        let call = AssertUnwindSafe(slot.adapter.process(request)).catch_unwind();
        let result = match timeout(limit, call).await {
            Err(_) => Err(Error::Timeout {
                provider: slot.name().to_string(),
                seconds: limit.as_secs(),
            }),
            Ok(Err(panic)) => Err(Error::internal(format!(
                "provider {} panicked: {}",
                slot.name(),
                panic_message(panic.as_ref())
            ))),
            Ok(Ok(result)) => result,
        };
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(mut response) => {
                if response.response_time <= 0.0 {
                    response.response_time = elapsed;
                }
                if response.provider.is_empty() {
                    response.provider = slot.name().to_string();
                }
                let tokens_used = match response.total_tokens() {
                    0 => estimated_tokens,
                    n => n,
                };

                slot.health.lock().record_performance(elapsed, response.cost, false);
                dispatch.succeeded(&UsageRecord {
                    estimated_tokens,
                    tokens_used,
                    cost: response.cost,
                    response_time: elapsed,
                    error: false,
                });
                Ok(response)
            }
            Err(e) => {
                // an invalid request says nothing about the provider
                let counts = e.kind() != ErrorKind::InvalidInput;
                if counts {
                    slot.health.lock().record_performance(elapsed, Decimal::ZERO, true);
                }
                dispatch.failed(
                    &UsageRecord {
                        estimated_tokens,
                        tokens_used: 0,
                        cost: Decimal::ZERO,
                        response_time: elapsed,
                        error: true,
                    },
                    counts,
                );
                Err(e)
            }
        }
    }

    fn error_response(&self, request_id: &str, err: &Error, started: Instant, attempts: u32) -> AnalysisResponse {
        let mut response = AnalysisResponse::failure(request_id, "none", err);
        response.response_time = started.elapsed().as_secs_f64();
        response.metadata.attempts = attempts;
        response.metadata.fallback_used = attempts > 1;
        response
    }

    pub fn get_provider_status(&self) -> Vec<ProviderStatusReport> {
        self.slots
            .values()
            .map(|slot| {
                let enabled = slot.is_enabled();
                ProviderStatusReport {
                    name: slot.name().to_string(),
                    enabled,
                    available: enabled && slot.breaker.is_available() && slot.passed_health_check(),
                    priority: slot.settings.priority,
                    weight: slot.settings.weight,
                    circuit: slot.breaker.get_stats(),
                    health: slot.health.lock().get_health_summary(),
                    active_requests: slot.in_flight.load(Ordering::Acquire),
                    rate_limiter: slot.limiter.lock().status(),
                    last_health_check: slot.last_health_check.lock().as_ref().map(|r| r.status.clone()),
                }
            })
            .collect()
    }

    pub fn get_cost_summary(&self) -> CostSummary {
        let mut summary = CostSummary::default();
        for slot in self.slots.values() {
            let status = slot.limiter.lock().status();
            summary.total_cost += status.total_cost;
            summary.total_requests += status.total_requests;
            summary.providers.insert(
                slot.name().to_string(),
                ProviderCost {
                    total_cost: status.total_cost,
                    daily_cost: status.daily_cost,
                    daily_budget: status.daily_budget,
                    total_requests: status.total_requests,
                    total_tokens: status.total_tokens,
                },
            );
        }
        summary
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
