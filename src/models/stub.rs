//! Scripted adapters for exercising routing without a network.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::models::provider::{
    AnalysisRequest, AnalysisResponse, HealthStatus, ProviderAdapter, TokenUsage,
};

#[derive(Debug, Clone)]
pub enum StubBehavior {
    Succeed { text: String, confidence: f64 },
    Fail(ErrorKind),
    Panic,
    Delay(Duration),
}

impl StubBehavior {
    pub fn ok(text: &str) -> Self {
        StubBehavior::Succeed {
            text: text.to_string(),
            confidence: 0.9,
        }
    }

    pub fn confident(text: &str, confidence: f64) -> Self {
        StubBehavior::Succeed {
            text: text.to_string(),
            confidence,
        }
    }
}

pub struct StubAdapter {
    name: String,
    script: Mutex<VecDeque<StubBehavior>>,
    fallback: Mutex<StubBehavior>,
    calls: AtomicUsize,
    healthy: AtomicBool,
    init_ok: AtomicBool,
    prepared_models: Mutex<Vec<String>>,
    seen_models: Mutex<Vec<Option<String>>>,
}

impl StubAdapter {
    pub fn new(name: &str, fallback: StubBehavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            init_ok: AtomicBool::new(true),
            prepared_models: Mutex::new(Vec::new()),
            seen_models: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding(name: &str) -> Arc<Self> {
        Self::new(name, StubBehavior::ok(&format!("{} says tidy up", name)))
    }

    pub fn failing(name: &str, kind: ErrorKind) -> Arc<Self> {
        Self::new(name, StubBehavior::Fail(kind))
    }

    /// Queue behaviors consumed before the fallback behavior applies.
    pub fn push(&self, behavior: StubBehavior) {
        self.script.lock().push_back(behavior);
    }

    pub fn set_behavior(&self, behavior: StubBehavior) {
        *self.fallback.lock() = behavior;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_init_ok(&self, ok: bool) {
        self.init_ok.store(ok, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prepared_models(&self) -> Vec<String> {
        self.prepared_models.lock().clone()
    }

    pub fn seen_models(&self) -> Vec<Option<String>> {
        self.seen_models.lock().clone()
    }

    fn next_behavior(&self) -> StubBehavior {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone())
    }
}

pub fn error_for(kind: ErrorKind, provider: &str) -> Error {
    match kind {
        ErrorKind::Authentication => Error::authentication(provider, "invalid api key"),
        ErrorKind::RateLimitExceeded => Error::rate_limited(provider, "429 from upstream"),
        ErrorKind::BudgetExceeded => Error::BudgetExceeded {
            provider: provider.to_string(),
        },
        ErrorKind::Timeout => Error::Timeout {
            provider: provider.to_string(),
            seconds: 1,
        },
        ErrorKind::InvalidInput => Error::invalid_input("malformed image"),
        ErrorKind::NoProvidersAvailable => Error::NoProvidersAvailable,
        ErrorKind::AllProvidersFailed => Error::AllProvidersFailed(provider.to_string()),
        ErrorKind::Transient => Error::model_provider("503 service unavailable"),
        ErrorKind::Internal => Error::internal("unexpected state"),
    }
}

#[async_trait]
impl ProviderAdapter for StubAdapter {
    async fn initialize(&self) -> Result<bool> {
        Ok(self.init_ok.load(Ordering::SeqCst))
    }

    async fn process(&self, request: &AnalysisRequest) -> Result<AnalysisResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_models
            .lock()
            .push(request.target.as_ref().and_then(|t| t.model.clone()));

        let mut behavior = self.next_behavior();
        if let StubBehavior::Delay(delay) = behavior {
            tokio::time::sleep(delay).await;
            behavior = StubBehavior::ok("slow but fine");
        }

        match behavior {
            StubBehavior::Succeed { text, confidence } => {
                let usage = TokenUsage::estimated(request, &text);
                Ok(AnalysisResponse::success(&request.id, &self.name, "stub-model", text)
                    .with_confidence(confidence)
                    .with_cost(Decimal::new(1, 3))
                    .with_usage(usage, true))
            }
            StubBehavior::Fail(kind) => Err(error_for(kind, &self.name)),
            StubBehavior::Panic => panic!("stub adapter {} blew up", self.name),
            StubBehavior::Delay(_) => unreachable!("delay resolved above"),
        }
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(HealthStatus::healthy(1))
        } else {
            Ok(HealthStatus::unhealthy("stub marked unhealthy"))
        }
    }

    async fn shutdown(&self) {}

    fn get_provider_name(&self) -> &str {
        &self.name
    }

    async fn prepare_model(&self, model: &str) -> Result<bool> {
        self.prepared_models.lock().push(model.to_string());
        Ok(true)
    }
}
