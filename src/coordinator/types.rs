use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, ErrorKind, Result};
use crate::models::cache::CacheStats;
use crate::models::manager::{CostSummary, ProviderStatusReport};
use crate::models::provider::{AnalysisRequest, AnalysisResponse};
use crate::models::selection::SelectionStrategy;

/// Routing label carried in the request context under `priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Manual,
    Scheduled,
    Complex,
    #[default]
    Default,
}

impl Priority {
    pub fn from_request(request: &AnalysisRequest) -> Self {
        request
            .context
            .get("priority")
            .map(|label| Self::from_label(label))
            .unwrap_or_default()
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "manual" => Priority::Manual,
            "scheduled" => Priority::Scheduled,
            "complex" => Priority::Complex,
            _ => Priority::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Manual => "manual",
            Priority::Scheduled => "scheduled",
            Priority::Complex => "complex",
            Priority::Default => "default",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Local,
    Cloud,
}

/// One backend consulted while answering a request.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub backend: Backend,
    pub provider: String,
    pub model: Option<String>,
    pub success: bool,
    pub accepted: bool,
    pub confidence: Option<f64>,
    pub was_cached: bool,
    pub error: Option<String>,
}

impl AttemptRecord {
    pub(crate) fn from_response(backend: Backend, response: &AnalysisResponse, accepted: bool) -> Self {
        Self {
            backend,
            provider: response.provider.clone(),
            model: (!response.model.is_empty()).then(|| response.model.clone()),
            success: !response.is_error(),
            accepted,
            confidence: (!response.is_error()).then_some(response.confidence),
            was_cached: response.metadata.cached,
            error: response.error.clone(),
        }
    }

    pub(crate) fn failed(backend: Backend, provider: &str, model: Option<&str>, error: &Error) -> Self {
        Self {
            backend,
            provider: provider.to_string(),
            model: model.map(str::to_string),
            success: false,
            accepted: false,
            confidence: None,
            was_cached: false,
            error: Some(error.to_string()),
        }
    }
}

/// Structured scene details produced by a [`SceneEnhancer`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneInsights {
    pub cleanliness_score: Option<u8>,
    pub objects: Vec<String>,
    pub tasks: Vec<String>,
    pub insights: Vec<String>,
}

/// Optional post-processing step that turns a model answer into scene details.
#[async_trait]
pub trait SceneEnhancer: Send + Sync {
    async fn enhance(&self, request: &AnalysisRequest, response: &AnalysisResponse) -> Result<SceneInsights>;
}

/// Final answer handed back to callers. Failures are reported in-band.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub request_id: String,
    pub error: bool,
    pub message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub priority: Priority,
    pub backend: Option<Backend>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub text: String,
    pub confidence: f64,
    pub cost: Decimal,
    pub cached: bool,
    pub processing_time: f64,
    pub cleanliness_score: u8,
    pub objects: Vec<String>,
    pub tasks: Vec<String>,
    pub insights: Vec<String>,
    pub attempts: Vec<AttemptRecord>,
}

impl AnalysisResult {
    pub(crate) fn success(
        priority: Priority,
        backend: Backend,
        response: &AnalysisResponse,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            request_id: response.request_id.clone(),
            error: false,
            message: None,
            error_kind: None,
            priority,
            backend: Some(backend),
            provider: Some(response.provider.clone()),
            model: Some(response.model.clone()),
            text: response.text.clone(),
            confidence: response.confidence,
            cost: response.cost,
            cached: response.metadata.cached,
            processing_time: 0.0,
            cleanliness_score: 0,
            objects: Vec::new(),
            tasks: Vec::new(),
            insights: Vec::new(),
            attempts,
        }
    }

    pub(crate) fn failure(
        request_id: &str,
        priority: Priority,
        message: impl Into<String>,
        kind: ErrorKind,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            error: true,
            message: Some(message.into()),
            error_kind: Some(kind),
            priority,
            backend: None,
            provider: None,
            model: None,
            text: String::new(),
            confidence: 0.0,
            cost: Decimal::ZERO,
            cached: false,
            processing_time: 0.0,
            cleanliness_score: 0,
            objects: Vec::new(),
            tasks: Vec::new(),
            insights: Vec::new(),
            attempts,
        }
    }

    pub(crate) fn apply(&mut self, scene: SceneInsights) {
        self.cleanliness_score = scene.cleanliness_score.unwrap_or(0).min(100);
        self.objects = scene.objects;
        self.tasks = scene.tasks;
        self.insights = scene.insights;
    }
}

/// Counters for the local backend since startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalStats {
    pub requests: u64,
    pub accepted: u64,
    pub low_confidence: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalStatus {
    pub name: String,
    pub enabled: bool,
    pub initialized: bool,
    pub confidence_threshold: f64,
    pub preferred_models: Vec<String>,
    pub stats: LocalStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub strategy: SelectionStrategy,
    pub cache: CacheStats,
    pub local: Option<LocalStatus>,
    pub providers: Vec<ProviderStatusReport>,
}

/// Cloud spend plus local usage. Local inference carries no cost.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorCosts {
    pub cloud: CostSummary,
    pub local: Option<LocalStats>,
    pub total_cost: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_labels() {
        assert_eq!(Priority::from_label("Manual"), Priority::Manual);
        assert_eq!(Priority::from_label(" complex "), Priority::Complex);
        assert_eq!(Priority::from_label("urgent"), Priority::Default);

        let request = AnalysisRequest::text_generation("x").with_context("priority", "scheduled");
        assert_eq!(Priority::from_request(&request), Priority::Scheduled);
        assert_eq!(
            Priority::from_request(&AnalysisRequest::text_generation("x")),
            Priority::Default
        );
    }

    #[test]
    fn test_failure_result_is_empty() {
        let result = AnalysisResult::failure("req-1", Priority::Manual, "boom", ErrorKind::Internal, Vec::new());
        assert!(result.error);
        assert_eq!(result.cleanliness_score, 0);
        assert!(result.tasks.is_empty());
        assert!(result.objects.is_empty());
        assert_eq!(result.cost, Decimal::ZERO);
    }

    #[test]
    fn test_scene_score_is_capped() {
        let response = AnalysisResponse::success("req-1", "gemini", "gemini-1.5-flash", "ok");
        let mut result = AnalysisResult::success(Priority::Default, Backend::Cloud, &response, Vec::new());
        result.apply(SceneInsights {
            cleanliness_score: Some(140),
            tasks: vec!["vacuum".to_string()],
            ..SceneInsights::default()
        });
        assert_eq!(result.cleanliness_score, 100);
        assert_eq!(result.tasks, vec!["vacuum".to_string()]);
    }
}
