use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

use crate::app::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::http::{encode_image, join_url, HttpBackend};
use crate::models::provider::{
    extract_confidence, AnalysisRequest, AnalysisResponse, HealthStatus, PricingInfo, ProviderAdapter,
    TokenUsage,
};

pub struct GeminiAdapter {
    name: String,
    http: HttpBackend,
    api_key: Option<String>,
    base_url: String,
    model: String,
    pricing_override: Option<PricingInfo>,
    default_confidence: f64,
}

impl GeminiAdapter {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            http: HttpBackend::new(config.name.clone(), config.timeout(), config.max_retries)?,
            api_key: config.api_key(),
            base_url: config.endpoint(),
            model: config.model.clone(),
            pricing_override: config.pricing_override(),
            default_confidence: config.default_confidence,
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::authentication(&self.name, "No API key configured"))?;
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(key)
            .map_err(|e| Error::authentication(&self.name, format!("Invalid API key format: {}", e)))?;
        headers.insert("x-goog-api-key", value);
        Ok(headers)
    }

    fn build_request(&self, request: &AnalysisRequest) -> GeminiRequest {
        let mut parts = vec![GeminiPart::Text {
            text: request.prompt.clone(),
        }];
        if let Some(bytes) = request.image_bytes() {
            let (mime_type, data) = encode_image(bytes);
            parts.push(GeminiPart::InlineData {
                inline_data: GeminiBlob {
                    mime_type: mime_type.to_string(),
                    data,
                },
            });
        }

        GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts,
            }],
            generation_config: Some(GeminiGenerationConfig {
                temperature: Some(0.2),
                max_output_tokens: Some(2048),
            }),
        }
    }

    fn pricing(&self, model: &str) -> PricingInfo {
        if let Some(pricing) = &self.pricing_override {
            return pricing.clone();
        }
        // USD per 1k tokens
        let (input, output) = match model {
            m if m.starts_with("gemini-1.5-pro") => (Decimal::new(125, 5), Decimal::new(5, 3)),
            m if m.starts_with("gemini-1.5-flash") => (Decimal::new(75, 6), Decimal::new(3, 4)),
            m if m.starts_with("gemini-pro") => (Decimal::new(5, 4), Decimal::new(15, 4)),
            _ => {
                warn!("Unknown model for cost calculation: {}", model);
                (Decimal::ZERO, Decimal::ZERO)
            }
        };
        PricingInfo {
            input_price_per_1k_tokens: input,
            output_price_per_1k_tokens: output,
        }
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    async fn initialize(&self) -> Result<bool> {
        if self.api_key.is_none() {
            warn!("Gemini provider {} has no API key", self.name);
            return Ok(false);
        }
        debug!("Gemini provider {} ready with model {}", self.name, self.model);
        Ok(true)
    }

    async fn process(&self, request: &AnalysisRequest) -> Result<AnalysisResponse> {
        let start_time = Instant::now();
        let model = request
            .model_for(&self.name)
            .map(str::to_string)
            .unwrap_or_else(|| self.model.clone());

        let url = join_url(&self.base_url, &format!("models/{}:generateContent", model));
        let body = self.build_request(request);
        let response: GeminiResponse = self.http.post_json(&url, &self.headers()?, &body).await?;

        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::model_provider("No candidates in Gemini response"))?;
        let text = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let (usage, estimated) = match response.usage_metadata {
            Some(u) => (TokenUsage::new(u.prompt_token_count, u.candidates_token_count), false),
            None => (TokenUsage::estimated(request, &text), true),
        };
        let cost = self.pricing(&model).calculate_cost(&usage);
        let confidence = extract_confidence(&text).unwrap_or(self.default_confidence);

        debug!("Received successful response from Gemini API ({} tokens)", usage.total_tokens);

        let mut response = AnalysisResponse::success(&request.id, &self.name, model, text)
            .with_confidence(confidence)
            .with_cost(cost)
            .with_usage(usage, estimated);
        response.response_time = start_time.elapsed().as_secs_f64();
        response.metadata.finish_reason = candidate.finish_reason;
        Ok(response)
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let url = join_url(&self.base_url, "models");
        Ok(self.http.probe(&url, &self.headers()?).await)
    }

    async fn shutdown(&self) {
        debug!("Gemini provider {} shut down", self.name);
    }

    fn get_provider_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: GeminiBlob },
}

#[derive(Debug, Clone, Serialize)]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::ProviderKind;
    use crate::error::ErrorKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(endpoint: &str) -> GeminiAdapter {
        let mut config = ProviderConfig::new("gemini", ProviderKind::Gemini, "gemini-1.5-flash");
        config.api_key = Some("test-key".to_string());
        config.endpoint = Some(endpoint.to_string());
        config.max_retries = 0;
        GeminiAdapter::new(&config).unwrap()
    }

    fn photo() -> AnalysisRequest {
        AnalysisRequest::image_analysis("List cleaning tasks")
            .with_image_bytes(vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3])
    }

    #[test]
    fn test_request_carries_inline_image() {
        let adapter = adapter("http://unused");
        let body = serde_json::to_value(adapter.build_request(&photo())).unwrap();

        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["text"], "List cleaning tasks");
        assert_eq!(parts[1]["inline_data"]["mime_type"], "image/jpeg");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn test_cost_calculation() {
        let adapter = adapter("http://unused");
        let usage = TokenUsage::new(1000, 1000);
        let cost = adapter.pricing("gemini-1.5-flash").calculate_cost(&usage);
        assert_eq!(cost, Decimal::new(375, 6));
        assert_eq!(adapter.pricing("mystery-model").calculate_cost(&usage), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_process_parses_usage_and_confidence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "{\"confidence\": 0.83, \"tasks\": [\"vacuum\"]}"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 300, "candidatesTokenCount": 20, "totalTokenCount": 320}
            })))
            .mount(&server)
            .await;

        let response = adapter(&server.uri()).process(&photo()).await.unwrap();
        assert_eq!(response.provider, "gemini");
        assert_eq!(response.model, "gemini-1.5-flash");
        assert_eq!(response.confidence, 0.83);
        assert_eq!(response.total_tokens(), 320);
        assert!(!response.metadata.usage_estimated);
        assert_eq!(response.metadata.finish_reason.as_deref(), Some("STOP"));
        assert!(response.cost > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_auth_failure_maps_to_authentication() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("API key not valid"))
            .mount(&server)
            .await;

        let err = adapter(&server.uri()).process(&photo()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_missing_key_disables_provider() {
        let mut config = ProviderConfig::new("gemini", ProviderKind::Gemini, "gemini-1.5-flash");
        config.api_key_env = Some("AICLEANER_GEMINI_KEY_NOT_SET".to_string());
        let adapter = GeminiAdapter::new(&config).unwrap();
        assert!(!adapter.initialize().await.unwrap());
    }
}
