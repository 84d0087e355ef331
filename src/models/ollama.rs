//! Local backend served by Ollama. Free to call, so cost is always zero.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::app::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::http::{join_url, HttpBackend};
use crate::models::provider::{
    extract_confidence, AnalysisRequest, AnalysisResponse, HealthStatus, ProviderAdapter, TokenUsage,
};

pub struct OllamaAdapter {
    name: String,
    http: HttpBackend,
    base_url: String,
    model: String,
    default_confidence: f64,
    // models known to be present on the server
    loaded_models: RwLock<HashSet<String>>,
}

impl OllamaAdapter {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            http: HttpBackend::new(config.name.clone(), config.timeout(), config.max_retries)?,
            base_url: config.endpoint(),
            model: config.model.clone(),
            default_confidence: config.default_confidence,
            loaded_models: RwLock::new(HashSet::new()),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = join_url(&self.base_url, "api/tags");
        let tags: OllamaTags = self.http.get_json(&url, &HeaderMap::new()).await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn build_request(&self, request: &AnalysisRequest, model: &str) -> OllamaGenerateRequest {
        OllamaGenerateRequest {
            model: model.to_string(),
            prompt: request.prompt.clone(),
            images: request
                .image_bytes()
                .map(|bytes| vec![STANDARD.encode(bytes)])
                .unwrap_or_default(),
            stream: false,
        }
    }
}

/// `llava` and `llava:latest` name the same model.
fn same_model(installed: &str, wanted: &str) -> bool {
    let normalize = |name: &str| {
        if name.contains(':') {
            name.to_string()
        } else {
            format!("{}:latest", name)
        }
    };
    normalize(installed) == normalize(wanted)
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn initialize(&self) -> Result<bool> {
        match self.list_models().await {
            Ok(models) => {
                info!("Ollama at {} is reachable with {} models", self.base_url, models.len());
                self.loaded_models.write().extend(models);
                Ok(true)
            }
            Err(e) => {
                warn!("Ollama at {} is not reachable: {}", self.base_url, e);
                Ok(false)
            }
        }
    }

    async fn process(&self, request: &AnalysisRequest) -> Result<AnalysisResponse> {
        let start_time = Instant::now();
        let model = request
            .model_for(&self.name)
            .map(str::to_string)
            .unwrap_or_else(|| self.model.clone());

        let url = join_url(&self.base_url, "api/generate");
        let body = self.build_request(request, &model);
        debug!("Sending request to Ollama: model={}, images={}", model, body.images.len());

        let response: OllamaGenerateResponse = self.http.post_json(&url, &HeaderMap::new(), &body).await?;
        if let Some(error) = response.error {
            return Err(Error::model_provider(format!("Ollama error: {}", error)));
        }

        let text = response.response;
        let (usage, estimated) = match (response.prompt_eval_count, response.eval_count) {
            (Some(input), Some(output)) => (TokenUsage::new(input, output), false),
            _ => (TokenUsage::estimated(request, &text), true),
        };
        let confidence = extract_confidence(&text).unwrap_or(self.default_confidence);

        let mut result = AnalysisResponse::success(&request.id, &self.name, model, text)
            .with_confidence(confidence)
            .with_cost(Decimal::ZERO)
            .with_usage(usage, estimated);
        result.response_time = start_time.elapsed().as_secs_f64();
        result.metadata.finish_reason = response.done_reason;
        Ok(result)
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let url = join_url(&self.base_url, "api/tags");
        Ok(self.http.probe(&url, &HeaderMap::new()).await)
    }

    async fn shutdown(&self) {
        self.loaded_models.write().clear();
        debug!("Ollama provider {} shut down", self.name);
    }

    fn get_provider_name(&self) -> &str {
        &self.name
    }

    /// Pulls `model` unless the server already has it.
    async fn prepare_model(&self, model: &str) -> Result<bool> {
        if self.loaded_models.read().iter().any(|m| same_model(m, model)) {
            return Ok(true);
        }

        let installed = self.list_models().await?;
        let present = installed.iter().any(|m| same_model(m, model));
        self.loaded_models.write().extend(installed);
        if present {
            return Ok(true);
        }

        info!("Pulling model {} into Ollama", model);
        let url = join_url(&self.base_url, "api/pull");
        let pull = OllamaPullRequest {
            name: model.to_string(),
            stream: false,
        };
        let status: OllamaPullStatus = self.http.post_json(&url, &HeaderMap::new(), &pull).await?;

        if status.status == "success" {
            self.loaded_models.write().insert(model.to_string());
            info!("Model {} is ready", model);
            Ok(true)
        } else {
            warn!("Pulling model {} ended with status {}", model, status.status);
            Ok(false)
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaPullRequest {
    name: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaPullStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}
