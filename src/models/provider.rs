use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};

/// Rough token estimate used when a backend omits usage counts.
pub const CHARS_PER_TOKEN: usize = 4;
/// Flat token charge for one image attachment.
pub const IMAGE_TOKEN_ESTIMATE: u32 = 258;

/// Uniform contract every backend implements. The manager owns all
/// runtime state; adapters only translate requests and errors.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn initialize(&self) -> Result<bool>;
    async fn process(&self, request: &AnalysisRequest) -> Result<AnalysisResponse>;
    async fn health_check(&self) -> Result<HealthStatus>;
    async fn shutdown(&self);
    fn get_provider_name(&self) -> &str;

    /// Make sure `model` can serve requests. Cloud backends have nothing to do.
    async fn prepare_model(&self, _model: &str) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ImageAnalysis,
    TextGeneration,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ImageAnalysis => "image_analysis",
            Capability::TextGeneration => "text_generation",
        }
    }
}

#[derive(Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            ImageSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

/// Pins a request to one provider, optionally with a model override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTarget {
    pub provider: String,
    pub model: Option<String>,
}

impl ProviderTarget {
    /// Parses the `provider:model` form used in configuration.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        match value.split_once(':') {
            Some((provider, model)) if !provider.is_empty() => Some(Self {
                provider: provider.to_string(),
                model: (!model.is_empty()).then(|| model.to_string()),
            }),
            Some(_) => None,
            None => Some(Self {
                provider: value.to_string(),
                model: None,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub id: String,
    pub prompt: String,
    pub image: Option<ImageSource>,
    pub context: HashMap<String, String>,
    pub capability: Capability,
    pub target: Option<ProviderTarget>,
}

impl AnalysisRequest {
    pub fn new(prompt: impl Into<String>, capability: Capability) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            image: None,
            context: HashMap::new(),
            capability,
            target: None,
        }
    }

    pub fn image_analysis(prompt: impl Into<String>) -> Self {
        Self::new(prompt, Capability::ImageAnalysis)
    }

    pub fn text_generation(prompt: impl Into<String>) -> Self {
        Self::new(prompt, Capability::TextGeneration)
    }

    pub fn with_image_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.image = Some(ImageSource::Path(path.into()));
        self
    }

    pub fn with_image_bytes(mut self, bytes: impl Into<Arc<[u8]>>) -> Self {
        self.image = Some(ImageSource::Bytes(bytes.into()));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Copy of this request pinned to `target`. The id is kept so responses
    /// still point back at the caller's request.
    pub fn with_target(&self, target: Option<ProviderTarget>) -> Self {
        let mut copy = self.clone();
        copy.target = target;
        copy
    }

    /// Model override carried by the target, when the target names `provider`.
    pub fn model_for(&self, provider: &str) -> Option<&str> {
        self.target
            .as_ref()
            .filter(|t| t.provider == provider)
            .and_then(|t| t.model.as_deref())
    }

    pub fn context_flag(&self, key: &str) -> Option<bool> {
        self.context.get(key).map(|v| {
            matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
        })
    }

    /// Copy of this request with the image loaded into memory.
    pub async fn resolve_image(&self) -> Result<Self> {
        let bytes: Option<Arc<[u8]>> = match &self.image {
            None => None,
            Some(ImageSource::Bytes(bytes)) => Some(bytes.clone()),
            Some(ImageSource::Path(path)) => {
                let data = tokio::fs::read(path).await.map_err(|e| {
                    Error::invalid_input(format!("unreadable image {}: {}", path.display(), e))
                })?;
                Some(data.into())
            }
        };

        if let Some(bytes) = &bytes {
            if bytes.is_empty() {
                return Err(Error::invalid_input("image is empty"));
            }
        } else if self.capability == Capability::ImageAnalysis {
            return Err(Error::invalid_input("image analysis requested without an image"));
        }

        let mut copy = self.clone();
        copy.image = bytes.map(ImageSource::Bytes);
        Ok(copy)
    }

    /// Image bytes, if the request has been resolved.
    pub fn image_bytes(&self) -> Option<&[u8]> {
        match &self.image {
            Some(ImageSource::Bytes(bytes)) => Some(bytes.as_ref()),
            _ => None,
        }
    }

    pub fn estimated_tokens(&self) -> u32 {
        let image_tokens = if self.image.is_some() { IMAGE_TOKEN_ESTIMATE } else { 0 };
        estimate_tokens(&self.prompt) + image_tokens
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Usage estimated from text length for backends that report nothing.
    pub fn estimated(request: &AnalysisRequest, output: &str) -> Self {
        Self::new(request.estimated_tokens(), estimate_tokens(output))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub usage: Option<TokenUsage>,
    pub cached: bool,
    pub fallback_used: bool,
    pub attempts: u32,
    pub usage_estimated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub request_id: String,
    pub text: String,
    pub provider: String,
    pub model: String,
    pub confidence: f64,
    pub cost: Decimal,
    pub response_time: f64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub metadata: ResponseMetadata,
}

impl AnalysisResponse {
    pub fn success(
        request_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            text: text.into(),
            provider: provider.into(),
            model: model.into(),
            confidence: 0.0,
            cost: Decimal::ZERO,
            response_time: 0.0,
            error: None,
            error_kind: None,
            created_at: Utc::now(),
            metadata: ResponseMetadata::default(),
        }
    }

    /// Synthetic response standing in for a failed request.
    pub fn failure(request_id: impl Into<String>, provider: impl Into<String>, error: &Error) -> Self {
        let mut response = Self::success(request_id, provider, "", "");
        response.error = Some(error.to_string());
        response.error_kind = Some(error.kind());
        response
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage, estimated: bool) -> Self {
        self.metadata.usage = Some(usage);
        self.metadata.usage_estimated = estimated;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn total_tokens(&self) -> u32 {
        self.metadata.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingInfo {
    pub input_price_per_1k_tokens: Decimal,
    pub output_price_per_1k_tokens: Decimal,
}

impl PricingInfo {
    pub fn calculate_cost(&self, usage: &TokenUsage) -> Decimal {
        let input_cost = Decimal::from(usage.input_tokens) * self.input_price_per_1k_tokens / Decimal::from(1000);
        let output_cost = Decimal::from(usage.output_tokens) * self.output_price_per_1k_tokens / Decimal::from(1000);
        input_cost + output_cost
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl HealthStatus {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            is_healthy: true,
            last_check: Utc::now(),
            response_time_ms: Some(response_time_ms),
            error_message: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            is_healthy: false,
            last_check: Utc::now(),
            response_time_ms: None,
            error_message: Some(error.into()),
        }
    }
}

/// 1 token ~= 4 characters, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN) as u32
}

/// Picks up a `confidence` field when the model answered with a JSON object.
pub fn extract_confidence(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let confidence = value.get("confidence")?.as_f64()?;
    // some models answer on a 0-100 scale
    let confidence = if confidence > 1.0 { confidence / 100.0 } else { confidence };
    Some(confidence.clamp(0.0, 1.0))
}

/// Sniffs the image container from its magic bytes.
pub fn detect_mime_type(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);

        let request = AnalysisRequest::image_analysis("abcdefgh").with_image_bytes(vec![1u8, 2, 3]);
        assert_eq!(request.estimated_tokens(), 2 + IMAGE_TOKEN_ESTIMATE);
    }

    #[test]
    fn test_provider_target_parse() {
        let target = ProviderTarget::parse("gemini:gemini-1.5-pro").unwrap();
        assert_eq!(target.provider, "gemini");
        assert_eq!(target.model.as_deref(), Some("gemini-1.5-pro"));

        let target = ProviderTarget::parse("anthropic").unwrap();
        assert_eq!(target.model, None);

        assert!(ProviderTarget::parse("").is_none());
        assert!(ProviderTarget::parse(":model").is_none());
    }

    #[test]
    fn test_extract_confidence() {
        assert_eq!(extract_confidence(r#"{"confidence": 0.42, "tasks": []}"#), Some(0.42));
        assert_eq!(extract_confidence("```json\n{\"confidence\": 85}\n```"), Some(0.85));
        assert_eq!(extract_confidence("The room looks tidy."), None);
    }

    #[test]
    fn test_detect_mime_type() {
        assert_eq!(detect_mime_type(&[0x89, b'P', b'N', b'G', 0x0D]), "image/png");
        assert_eq!(detect_mime_type(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(detect_mime_type(b"nonsense"), "image/jpeg");
    }

    #[test]
    fn test_model_override_only_for_named_provider() {
        let request = AnalysisRequest::text_generation("hi")
            .with_target(ProviderTarget::parse("gemini:gemini-1.5-pro"));
        assert_eq!(request.model_for("gemini"), Some("gemini-1.5-pro"));
        assert_eq!(request.model_for("anthropic"), None);
    }

    #[test]
    fn test_context_flag() {
        let request = AnalysisRequest::text_generation("hi")
            .with_context("privacy_mode", "TRUE")
            .with_context("prefer_local", "0");
        assert_eq!(request.context_flag("privacy_mode"), Some(true));
        assert_eq!(request.context_flag("prefer_local"), Some(false));
        assert_eq!(request.context_flag("missing"), None);
    }

    #[tokio::test]
    async fn test_resolve_image_errors() {
        let missing = AnalysisRequest::image_analysis("x").with_image_path("/definitely/not/here.jpg");
        let err = missing.resolve_image().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let no_image = AnalysisRequest::image_analysis("x");
        assert!(no_image.resolve_image().await.is_err());

        let text = AnalysisRequest::text_generation("x");
        assert!(text.resolve_image().await.unwrap().image.is_none());
    }
}
