pub mod provider;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod health;
pub mod cache;
pub mod selection;
pub mod manager;
pub mod http;
pub mod gemini;
pub mod anthropic;
pub mod openai;
pub mod ollama;

#[cfg(test)]
pub mod stub;

use std::sync::Arc;

use crate::app::config::{ProviderConfig, ProviderKind};
use crate::error::Result;

pub use provider::{
    AnalysisRequest, AnalysisResponse, Capability, HealthStatus, ImageSource, PricingInfo,
    ProviderAdapter, ProviderTarget, ResponseMetadata, TokenUsage,
};
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
pub use cache::{CacheStats, ResponseCache};
pub use manager::{CostSummary, ManagerConfig, ProviderManager, ProviderSettings, ProviderStatusReport};
pub use selection::SelectionStrategy;
pub use gemini::GeminiAdapter;
pub use anthropic::AnthropicAdapter;
pub use openai::OpenAIAdapter;
pub use ollama::OllamaAdapter;

pub fn build_adapter(config: &ProviderConfig) -> Result<Arc<dyn ProviderAdapter>> {
    let adapter: Arc<dyn ProviderAdapter> = match config.kind {
        ProviderKind::Gemini => Arc::new(GeminiAdapter::new(config)?),
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(config)?),
        ProviderKind::OpenAI => Arc::new(OpenAIAdapter::new(config)?),
        ProviderKind::Ollama => Arc::new(OllamaAdapter::new(config)?),
    };
    Ok(adapter)
}
