use futures_util::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::app::config::{AppConfig, LocalSettings, RoutingSettings};
use crate::coordinator::types::{
    AnalysisResult, AttemptRecord, Backend, CoordinatorCosts, CoordinatorStatus, LocalStats, LocalStatus,
    Priority, SceneEnhancer,
};
use crate::error::{Error, ErrorKind, Result};
use crate::models::build_adapter;
use crate::models::manager::{panic_message, ProviderManager};
use crate::models::provider::{AnalysisRequest, AnalysisResponse, ProviderAdapter, ProviderTarget};

struct LocalBackend {
    adapter: Arc<dyn ProviderAdapter>,
    initialized: AtomicBool,
    stats: Mutex<LocalStats>,
}

impl LocalBackend {
    fn name(&self) -> &str {
        self.adapter.get_provider_name()
    }
}

/// Routes each request between the local backend and the cloud providers.
pub struct Coordinator {
    manager: Arc<ProviderManager>,
    local: Option<LocalBackend>,
    local_settings: LocalSettings,
    routing: RoutingSettings,
    enhancer: Option<Arc<dyn SceneEnhancer>>,
}

impl Coordinator {
    /// Wires up a coordinator around an already populated manager. The local
    /// adapter, if any, is initialized here and left disabled when that fails.
    pub async fn initialize(
        config: &AppConfig,
        manager: Arc<ProviderManager>,
        local: Option<Arc<dyn ProviderAdapter>>,
    ) -> Self {
        let local_settings = config.local.clone();
        let local = match local {
            Some(adapter) if local_settings.enabled => {
                let ready = match timeout(local_timeout(&local_settings), adapter.initialize()).await {
                    Ok(Ok(ready)) => ready,
                    Ok(Err(e)) => {
                        warn!("Local backend {} failed to initialize: {}", adapter.get_provider_name(), e);
                        false
                    }
                    Err(_) => {
                        warn!("Local backend {} timed out during initialization", adapter.get_provider_name());
                        false
                    }
                };
                if ready {
                    info!("Local backend {} ready", adapter.get_provider_name());
                } else {
                    warn!("Local backend {} disabled, requests go to the cloud", adapter.get_provider_name());
                }
                Some(LocalBackend {
                    adapter,
                    initialized: AtomicBool::new(ready),
                    stats: Mutex::new(LocalStats::default()),
                })
            }
            Some(adapter) => {
                debug!("Local backend {} configured but disabled", adapter.get_provider_name());
                None
            }
            None => None,
        };

        Self {
            manager,
            local,
            local_settings,
            routing: config.routing.clone(),
            enhancer: None,
        }
    }

    /// Builds every configured adapter, initializes them and returns a ready
    /// coordinator.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let mut manager = ProviderManager::new(config.to_manager_config());
        for provider in &config.providers {
            let adapter = build_adapter(provider)?;
            manager.add_provider(provider.to_settings(), adapter)?;
        }
        let ready = manager.initialize_all().await;
        info!("{} of {} cloud providers ready", ready, config.providers.len());

        let local = if config.local.enabled {
            Some(build_adapter(&config.local_provider_config())?)
        } else {
            None
        };

        Ok(Self::initialize(config, Arc::new(manager), local).await)
    }

    pub fn with_enhancer(mut self, enhancer: Arc<dyn SceneEnhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    pub fn manager(&self) -> &Arc<ProviderManager> {
        &self.manager
    }

    /// Answers one request. Never fails and never lets a panic escape.
    pub async fn process(&self, request: &AnalysisRequest) -> AnalysisResult {
        let started = Instant::now();
        let priority = Priority::from_request(request);

        let mut result = match AssertUnwindSafe(self.run(request, priority)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Request {} panicked in the coordinator: {}", request.id, message);
                AnalysisResult::failure(
                    &request.id,
                    priority,
                    format!("Internal error: {}", message),
                    ErrorKind::Internal,
                    Vec::new(),
                )
            }
        };
        result.processing_time = started.elapsed().as_secs_f64();
        result
    }

    async fn run(&self, request: &AnalysisRequest, priority: Priority) -> AnalysisResult {
        let request = match request.resolve_image().await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Rejecting request {}: {}", request.id, e);
                return AnalysisResult::failure(&request.id, priority, e.to_string(), e.kind(), Vec::new());
            }
        };
        let privacy_mode = request.context_flag("privacy_mode").unwrap_or(false);
        let mut attempts = Vec::new();

        if let Some(local) = self.usable_local(&request) {
            match self.attempt_local(local, &request).await {
                Ok(response) => {
                    let threshold = self.local_settings.confidence_threshold;
                    let accepted = response.confidence >= threshold;
                    attempts.push(AttemptRecord::from_response(Backend::Local, &response, accepted));

                    {
                        let mut stats = local.stats.lock();
                        if accepted {
                            stats.accepted += 1;
                        } else {
                            stats.low_confidence += 1;
                        }
                    }

                    if accepted {
                        return self.finish(&request, priority, Backend::Local, &response, attempts).await;
                    }
                    info!(
                        "Local confidence {:.2} below threshold {:.2} for request {}, rerouting",
                        response.confidence, threshold, request.id
                    );
                }
                Err((e, model)) => {
                    local.stats.lock().failures += 1;
                    warn!("Local backend failed for request {}: {}", request.id, e);
                    attempts.push(AttemptRecord::failed(Backend::Local, local.name(), model.as_deref(), &e));
                    if e.kind() == ErrorKind::InvalidInput {
                        return AnalysisResult::failure(&request.id, priority, e.to_string(), e.kind(), attempts);
                    }
                }
            }
        }

        if privacy_mode {
            let message = if attempts.is_empty() {
                "Privacy mode is on and no local backend is available"
            } else {
                "Privacy mode is on and the local backend gave no acceptable answer"
            };
            warn!("Request {}: {}", request.id, message);
            return AnalysisResult::failure(
                &request.id,
                priority,
                message,
                ErrorKind::NoProvidersAvailable,
                attempts,
            );
        }

        let cloud_request = match &request.target {
            Some(_) => request.clone(),
            None => request.with_target(self.routing.target_for(priority.as_str())),
        };
        debug!(
            "Routing request {} to the cloud with {} priority ({:?})",
            request.id,
            priority,
            cloud_request.target.as_ref().map(|t| t.provider.as_str())
        );

        let response = self.manager.process_request(&cloud_request).await;
        attempts.push(AttemptRecord::from_response(Backend::Cloud, &response, !response.is_error()));
        if response.is_error() {
            let message = response.error.clone().unwrap_or_else(|| "Unknown error".to_string());
            let kind = response.error_kind.unwrap_or(ErrorKind::Internal);
            return AnalysisResult::failure(&request.id, priority, message, kind, attempts);
        }

        self.finish(&request, priority, Backend::Cloud, &response, attempts).await
    }

    fn usable_local(&self, request: &AnalysisRequest) -> Option<&LocalBackend> {
        let local = self.local.as_ref()?;
        if !local.initialized.load(Ordering::Acquire) {
            return None;
        }
        if request.context_flag("prefer_local") == Some(false) {
            debug!("Request {} opted out of local processing", request.id);
            return None;
        }
        Some(local)
    }

    async fn attempt_local(
        &self,
        local: &LocalBackend,
        request: &AnalysisRequest,
    ) -> std::result::Result<AnalysisResponse, (Error, Option<String>)> {
        local.stats.lock().requests += 1;
        let model = self.local_settings.model_for(request.capability).map(str::to_string);

        if let Some(model) = &model {
            match local.adapter.prepare_model(model).await {
                Ok(true) => {}
                Ok(false) => {
                    let e = Error::model_provider(format!("Local model {} is not available", model));
                    return Err((e, Some(model.clone())));
                }
                Err(e) => return Err((e, Some(model.clone()))),
            }
        }

        let local_request = request.with_target(Some(ProviderTarget {
            provider: local.name().to_string(),
            model: model.clone(),
        }));
        let limit = local_timeout(&self.local_settings);
        let call = AssertUnwindSafe(local.adapter.process(&local_request)).catch_unwind();

        match timeout(limit, call).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(e))) => Err((e, model)),
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!("Local backend {} panicked: {}", local.name(), message);
                Err((Error::internal(format!("local backend panicked: {}", message)), model))
            }
            Err(_) => Err((
                Error::Timeout {
                    provider: local.name().to_string(),
                    seconds: limit.as_secs(),
                },
                model,
            )),
        }
    }

    async fn finish(
        &self,
        request: &AnalysisRequest,
        priority: Priority,
        backend: Backend,
        response: &AnalysisResponse,
        attempts: Vec<AttemptRecord>,
    ) -> AnalysisResult {
        let mut result = AnalysisResult::success(priority, backend, response, attempts);

        if let Some(enhancer) = &self.enhancer {
            match AssertUnwindSafe(enhancer.enhance(request, response)).catch_unwind().await {
                Ok(Ok(scene)) => result.apply(scene),
                Ok(Err(e)) => warn!("Scene enhancement failed for request {}: {}", request.id, e),
                Err(panic) => error!(
                    "Scene enhancement panicked for request {}: {}",
                    request.id,
                    panic_message(panic.as_ref())
                ),
            }
        }

        info!(
            "Request {} served by {} ({:?}) in {} attempt(s)",
            request.id,
            response.provider,
            backend,
            result.attempts.len()
        );
        result
    }

    pub fn get_provider_status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            strategy: self.manager.strategy(),
            cache: self.manager.cache_stats(),
            local: self.local.as_ref().map(|local| LocalStatus {
                name: local.name().to_string(),
                enabled: self.local_settings.enabled,
                initialized: local.initialized.load(Ordering::Acquire),
                confidence_threshold: self.local_settings.confidence_threshold,
                preferred_models: self.local_settings.preferred_models.values().cloned().collect(),
                stats: local.stats.lock().clone(),
            }),
            providers: self.manager.get_provider_status(),
        }
    }

    pub fn get_cost_summary(&self) -> CoordinatorCosts {
        let cloud = self.manager.get_cost_summary();
        CoordinatorCosts {
            total_cost: cloud.total_cost,
            local: self.local.as_ref().map(|local| local.stats.lock().clone()),
            cloud,
        }
    }

    pub async fn shutdown(&self) {
        if let Some(local) = &self.local {
            local.adapter.shutdown().await;
            local.initialized.store(false, Ordering::Release);
        }
        self.manager.shutdown_all().await;
    }
}

fn local_timeout(settings: &LocalSettings) -> Duration {
    Duration::from_secs(settings.timeout_seconds)
}
