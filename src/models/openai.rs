use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
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

pub struct OpenAIAdapter {
    name: String,
    http: HttpBackend,
    api_key: Option<String>,
    base_url: String,
    model: String,
    pricing_override: Option<PricingInfo>,
    default_confidence: f64,
}

impl OpenAIAdapter {
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
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|e| Error::authentication(&self.name, format!("Invalid API key format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn build_request(&self, request: &AnalysisRequest, model: &str) -> OpenAIRequest {
        let mut content = vec![OpenAIContentPart::Text {
            text: request.prompt.clone(),
        }];
        if let Some(bytes) = request.image_bytes() {
            let (mime_type, data) = encode_image(bytes);
            content.push(OpenAIContentPart::ImageUrl {
                image_url: OpenAIImageUrl {
                    url: format!("data:{};base64,{}", mime_type, data),
                },
            });
        }

        OpenAIRequest {
            model: model.to_string(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content,
            }],
            max_tokens: Some(2048),
            temperature: Some(0.2),
        }
    }

    fn pricing(&self, model: &str) -> PricingInfo {
        if let Some(pricing) = &self.pricing_override {
            return pricing.clone();
        }
        // USD per 1k tokens
        let (input, output) = match model {
            m if m.starts_with("gpt-4o-mini") => (Decimal::new(15, 5), Decimal::new(6, 4)),
            m if m.starts_with("gpt-4o") => (Decimal::new(25, 4), Decimal::new(1, 2)),
            m if m.starts_with("gpt-4-turbo") || m.starts_with("gpt-4-vision") => {
                (Decimal::new(1, 2), Decimal::new(3, 2))
            }
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
impl ProviderAdapter for OpenAIAdapter {
    async fn initialize(&self) -> Result<bool> {
        if self.api_key.is_none() {
            warn!("OpenAI provider {} has no API key", self.name);
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

        let url = join_url(&self.base_url, "v1/chat/completions");
        let body = self.build_request(request, &model);
        debug!("Sending request to OpenAI: model={}", model);

        let response: OpenAIResponse = self.http.post_json(&url, &self.create_headers()?, &body).await?;
        debug!("Received response from OpenAI: id={}", response.id);

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::model_provider("No choices in response"))?;
        let text = choice.message.content.unwrap_or_default();

        let (usage, estimated) = match response.usage {
            Some(u) => (TokenUsage::new(u.prompt_tokens, u.completion_tokens), false),
            None => (TokenUsage::estimated(request, &text), true),
        };
        let cost = self.pricing(&model).calculate_cost(&usage);
        let confidence = extract_confidence(&text).unwrap_or(self.default_confidence);

        let mut result = AnalysisResponse::success(&request.id, &self.name, response.model, text)
            .with_confidence(confidence)
            .with_cost(cost)
            .with_usage(usage, estimated);
        result.response_time = start_time.elapsed().as_secs_f64();
        result.metadata.finish_reason = choice.finish_reason;
        Ok(result)
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let url = join_url(&self.base_url, "v1/models");
        Ok(self.http.probe(&url, &self.create_headers()?).await)
    }

    async fn shutdown(&self) {
        debug!("OpenAI provider {} shut down", self.name);
    }

    fn get_provider_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: Vec<OpenAIContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAIContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAIImageUrl },
}

#[derive(Debug, Serialize)]
struct OpenAIImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    id: String,
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
