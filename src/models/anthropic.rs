use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
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

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 2048;

pub struct AnthropicAdapter {
    name: String,
    http: HttpBackend,
    api_key: Option<String>,
    base_url: String,
    model: String,
    pricing_override: Option<PricingInfo>,
    default_confidence: f64,
}

impl AnthropicAdapter {
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

    fn create_headers(&self) -> Result<HeaderMap> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::authentication(&self.name, "No API key configured"))?;

        let mut headers = HeaderMap::new();
        let key_value = HeaderValue::from_str(key)
            .map_err(|e| Error::authentication(&self.name, format!("Invalid API key format: {}", e)))?;
        headers.insert("x-api-key", key_value);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn build_request(&self, request: &AnalysisRequest, model: &str) -> AnthropicRequest {
        let mut content = Vec::new();
        // images go before the question, as the messages API recommends
        if let Some(bytes) = request.image_bytes() {
            let (media_type, data) = encode_image(bytes);
            content.push(AnthropicContent::Image {
                source: AnthropicImageSource {
                    source_type: "base64".to_string(),
                    media_type: media_type.to_string(),
                    data,
                },
            });
        }
        content.push(AnthropicContent::Text {
            text: request.prompt.clone(),
        });

        AnthropicRequest {
            model: model.to_string(),
            max_tokens: MAX_TOKENS,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content,
            }],
        }
    }

    fn pricing(&self, model: &str) -> PricingInfo {
        if let Some(pricing) = &self.pricing_override {
            return pricing.clone();
        }
        // USD per 1k tokens
        let (input, output) = match model {
            m if m.contains("opus") => (Decimal::new(15, 3), Decimal::new(75, 3)),
            m if m.contains("sonnet") => (Decimal::new(3, 3), Decimal::new(15, 3)),
            m if m.contains("haiku") => (Decimal::new(25, 5), Decimal::new(125, 5)),
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
impl ProviderAdapter for AnthropicAdapter {
    async fn initialize(&self) -> Result<bool> {
        if self.api_key.is_none() {
            warn!("Anthropic provider {} has no API key", self.name);
            return Ok(false);
        }
        Ok(true)
    }

    async fn process(&self, request: &AnalysisRequest) -> Result<AnalysisResponse> {
        let start_time = Instant::now();
        let model = request
            .model_for(&self.name)
            .map(str::to_string)
            .unwrap_or_else(|| self.model.clone());

        let url = join_url(&self.base_url, "v1/messages");
        let body = self.build_request(request, &model);
        debug!("Sending request to Anthropic: model={}", model);

        let response: AnthropicResponse = self.http.post_json(&url, &self.create_headers()?, &body).await?;

        let text = response
            .content
            .iter()
            .filter_map(|block| match block {
                AnthropicResponseContent::Text { text } => Some(text.as_str()),
                AnthropicResponseContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(Error::model_provider("No text content in Anthropic response"));
        }

        let (usage, estimated) = match response.usage {
            Some(u) => (TokenUsage::new(u.input_tokens, u.output_tokens), false),
            None => (TokenUsage::estimated(request, &text), true),
        };
        let cost = self.pricing(&model).calculate_cost(&usage);
        let confidence = extract_confidence(&text).unwrap_or(self.default_confidence);

        let mut result = AnalysisResponse::success(&request.id, &self.name, response.model.unwrap_or(model), text)
            .with_confidence(confidence)
            .with_cost(cost)
            .with_usage(usage, estimated);
        result.response_time = start_time.elapsed().as_secs_f64();
        result.metadata.finish_reason = response.stop_reason;
        Ok(result)
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let url = join_url(&self.base_url, "v1/models");
        Ok(self.http.probe(&url, &self.create_headers()?).await)
    }

    async fn shutdown(&self) {
        debug!("Anthropic provider {} shut down", self.name);
    }

    fn get_provider_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum AnthropicContent {
    Text { text: String },
    Image { source: AnthropicImageSource },
}

#[derive(Debug, Serialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicResponseContent>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseContent {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
