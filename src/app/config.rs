use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};
use validator::Validate;

use crate::error::{Error, Result};
use crate::models::cache::CacheConfig;
use crate::models::circuit_breaker::CircuitBreakerConfig;
use crate::models::health::HealthMonitorConfig;
use crate::models::manager::{ManagerConfig, ProviderSettings};
use crate::models::provider::{Capability, PricingInfo, ProviderTarget};
use crate::models::rate_limiter::RateLimits;
use crate::models::selection::{AdaptiveWeights, SelectionStrategy};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    pub providers: Vec<ProviderConfig>,
    #[validate(nested)]
    pub manager: ManagerSettings,
    #[validate(nested)]
    pub local: LocalSettings,
    pub routing: RoutingSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    Anthropic,
    OpenAI,
    Ollama,
}

impl ProviderKind {
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::OpenAI => "https://api.openai.com",
            ProviderKind::Ollama => "http://localhost:11434",
        }
    }

    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Gemini => Some("GEMINI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::OpenAI => Some("OPENAI_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProviderConfig {
    #[validate(length(min = 1, message = "Provider name cannot be empty"))]
    pub name: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    /// Lower number = preferred.
    pub priority: i32,
    #[validate(range(min = 0.0, message = "Weight cannot be negative"))]
    pub weight: f64,
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is unset.
    pub api_key_env: Option<String>,
    pub endpoint: Option<String>,
    #[validate(length(min = 1, message = "Default model cannot be empty"))]
    pub model: String,
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u32>,
    pub daily_budget: Option<Decimal>,
    pub cost_per_request: Decimal,
    pub input_price_per_1k: Option<Decimal>,
    pub output_price_per_1k: Option<Decimal>,
    #[validate(range(min = 1, max = 600))]
    pub timeout_seconds: u64,
    #[validate(range(max = 10))]
    pub max_retries: u32,
    /// Zero disables periodic health checks.
    pub health_check_interval_seconds: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub default_confidence: f64,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            priority: 1,
            weight: 1.0,
            api_key: None,
            api_key_env: None,
            endpoint: None,
            model: model.into(),
            requests_per_minute: Some(60),
            tokens_per_minute: Some(32000),
            daily_budget: None,
            cost_per_request: Decimal::ZERO,
            input_price_per_1k: None,
            output_price_per_1k: None,
            timeout_seconds: 30,
            max_retries: 2,
            health_check_interval_seconds: 300,
            default_confidence: 0.8,
        }
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| self.kind.default_endpoint().to_string())
    }

    /// Explicit key first, then the configured or conventional env var.
    pub fn api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        let var = self.api_key_env.as_deref().or_else(|| self.kind.api_key_env())?;
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Configured prices override the adapter's built-in price list.
    pub fn pricing_override(&self) -> Option<PricingInfo> {
        match (self.input_price_per_1k, self.output_price_per_1k) {
            (None, None) => None,
            (input, output) => Some(PricingInfo {
                input_price_per_1k_tokens: input.unwrap_or(Decimal::ZERO),
                output_price_per_1k_tokens: output.unwrap_or(Decimal::ZERO),
            }),
        }
    }

    pub fn to_rate_limits(&self) -> RateLimits {
        RateLimits {
            requests_per_minute: self.requests_per_minute,
            tokens_per_minute: self.tokens_per_minute,
            daily_budget: self.daily_budget,
            cost_per_request: self.cost_per_request,
        }
    }

    pub fn to_settings(&self) -> ProviderSettings {
        ProviderSettings {
            name: self.name.clone(),
            enabled: self.enabled,
            priority: self.priority,
            weight: self.weight,
            timeout: self.timeout(),
            health_check_interval: Duration::from_secs(self.health_check_interval_seconds),
            limits: self.to_rate_limits(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::new("gemini", ProviderKind::Gemini, "gemini-1.5-flash")
    }
}

/// Configured spend limits and prices of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderBudget {
    pub name: String,
    pub priority: i32,
    pub daily_budget: Option<Decimal>,
    pub cost_per_request: Decimal,
    pub input_price_per_1k: Option<Decimal>,
    pub output_price_per_1k: Option<Decimal>,
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ManagerSettings {
    pub strategy: SelectionStrategy,
    pub cache_enabled: bool,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    #[validate(range(min = 1, message = "Failure threshold must be at least 1"))]
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
    #[validate(range(min = 1))]
    pub health_window_size: usize,
    #[validate(range(min = 1))]
    pub health_recent_window: usize,
    #[validate(range(min = 0.0, max = 1.0))]
    pub healthy_threshold: f64,
    #[validate(range(max = 5))]
    pub max_fallback_attempts: usize,
    pub weights: AdaptiveWeights,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::Adaptive,
            cache_enabled: true,
            cache_ttl_seconds: 300,
            cache_max_entries: 1000,
            failure_threshold: 5,
            recovery_timeout_seconds: 60,
            health_window_size: 50,
            health_recent_window: 5,
            healthy_threshold: 0.9,
            max_fallback_attempts: 1,
            weights: AdaptiveWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LocalSettings {
    pub enabled: bool,
    #[validate(length(min = 1))]
    pub endpoint: String,
    #[validate(range(min = 1, max = 3600))]
    pub timeout_seconds: u64,
    #[validate(range(max = 10))]
    pub max_retries: u32,
    /// Local results below this confidence are discarded in favour of the cloud.
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub default_confidence: f64,
    /// Capability name (`image_analysis`, `text_generation`) -> model.
    pub preferred_models: BTreeMap<String, String>,
}

impl LocalSettings {
    pub fn model_for(&self, capability: Capability) -> Option<&str> {
        self.preferred_models.get(capability.as_str()).map(String::as_str)
    }
}

impl Default for LocalSettings {
    fn default() -> Self {
        let mut preferred_models = BTreeMap::new();
        preferred_models.insert(Capability::ImageAnalysis.as_str().to_string(), "llava:13b".to_string());
        preferred_models.insert(Capability::TextGeneration.as_str().to_string(), "mistral:7b".to_string());

        Self {
            enabled: false,
            endpoint: ProviderKind::Ollama.default_endpoint().to_string(),
            timeout_seconds: 120,
            max_retries: 1,
            confidence_threshold: 0.6,
            default_confidence: 0.7,
            preferred_models,
        }
    }
}

/// Priority label (`manual`, `scheduled`, `complex`, `default`) -> cloud
/// target in `provider:model` form. Labels without an entry leave provider
/// choice to the selection strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    pub priority_models: BTreeMap<String, String>,
}

impl RoutingSettings {
    /// Target for `label`, falling back to a configured `default` entry.
    pub fn target_for(&self, label: &str) -> Option<ProviderTarget> {
        self.priority_models
            .get(label)
            .or_else(|| self.priority_models.get("default"))
            .and_then(|target| ProviderTarget::parse(target))
    }
}

impl Default for RoutingSettings {
    fn default() -> Self {
        let mut priority_models = BTreeMap::new();
        priority_models.insert("manual".to_string(), "gemini:gemini-1.5-pro".to_string());
        priority_models.insert("scheduled".to_string(), "gemini:gemini-1.5-flash".to_string());
        priority_models.insert("complex".to_string(), "anthropic:claude-3-5-sonnet-20241022".to_string());
        Self { priority_models }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let gemini = ProviderConfig {
            priority: 1,
            daily_budget: Some(Decimal::new(5, 0)),
            cost_per_request: Decimal::new(1, 3),
            ..ProviderConfig::new("gemini", ProviderKind::Gemini, "gemini-1.5-flash")
        };

        let anthropic = ProviderConfig {
            priority: 2,
            requests_per_minute: Some(50),
            tokens_per_minute: Some(40000),
            daily_budget: Some(Decimal::new(5, 0)),
            cost_per_request: Decimal::new(8, 3),
            timeout_seconds: 60,
            ..ProviderConfig::new("anthropic", ProviderKind::Anthropic, "claude-3-5-sonnet-20241022")
        };

        let openai = ProviderConfig {
            priority: 3,
            tokens_per_minute: Some(30000),
            daily_budget: Some(Decimal::new(5, 0)),
            cost_per_request: Decimal::new(1, 2),
            timeout_seconds: 60,
            ..ProviderConfig::new("openai", ProviderKind::OpenAI, "gpt-4o")
        };

        Self {
            providers: vec![gemini, anthropic, openai],
            manager: ManagerSettings::default(),
            local: LocalSettings::default(),
            routing: RoutingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Reads `path`, writing the defaults there first when it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Config file not found, creating default configuration at {:?}", path);
            let default_config = Self::default();
            default_config.save(path).await?;
            return Ok(default_config);
        }

        info!("Loading configuration from: {:?}", path);

        let config_content = fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&config_content)?;

        config.validate_all()?;

        info!("Configuration loaded successfully ({} providers)", config.providers.len());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let config_content = toml::to_string_pretty(self)?;
        fs::write(path, config_content).await?;

        info!("Configuration saved successfully");
        Ok(())
    }

    /// Field rules from the derives plus the checks that span fields.
    pub fn validate_all(&self) -> Result<()> {
        self.validate()?;

        let mut names = HashSet::new();
        for provider in &self.providers {
            provider.validate()?;

            if !names.insert(provider.name.as_str()) {
                return Err(Error::validation(format!("Provider {} is configured twice", provider.name)));
            }
            if provider.kind == ProviderKind::Ollama {
                continue;
            }
            if provider.enabled && provider.api_key().is_none() {
                warn!("Provider {} is enabled but has no API key; it will be disabled at startup", provider.name);
            }
        }

        if self.local.enabled && self.local.model_for(Capability::ImageAnalysis).is_none() {
            return Err(Error::validation("Local backend is enabled but has no image_analysis model"));
        }

        for (label, target) in &self.routing.priority_models {
            if ProviderTarget::parse(target).is_none() {
                return Err(Error::validation(format!(
                    "Routing entry {} has an invalid target: {:?}",
                    label, target
                )));
            }
        }

        let weights = &self.manager.weights;
        if [weights.response_time, weights.success_rate, weights.cost, weights.load]
            .iter()
            .any(|w| *w < 0.0)
        {
            return Err(Error::validation("Adaptive weights cannot be negative"));
        }

        Ok(())
    }

    pub fn get_enabled_providers(&self) -> Vec<&ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled).collect()
    }

    pub fn get_providers_by_priority(&self) -> Vec<&ProviderConfig> {
        let mut providers = self.get_enabled_providers();
        providers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        providers
    }

    /// Budgets and prices of the enabled providers, best priority first.
    pub fn budget_report(&self) -> Vec<ProviderBudget> {
        self.get_providers_by_priority()
            .into_iter()
            .map(|p| ProviderBudget {
                name: p.name.clone(),
                priority: p.priority,
                daily_budget: p.daily_budget,
                cost_per_request: p.cost_per_request,
                input_price_per_1k: p.input_price_per_1k,
                output_price_per_1k: p.output_price_per_1k,
                requests_per_minute: p.requests_per_minute,
                tokens_per_minute: p.tokens_per_minute,
            })
            .collect()
    }

    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.manager.cache_enabled,
            ttl: Duration::from_secs(self.manager.cache_ttl_seconds),
            max_entries: self.manager.cache_max_entries,
        }
    }

    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.manager.failure_threshold,
            recovery_timeout: Duration::from_secs(self.manager.recovery_timeout_seconds),
        }
    }

    pub fn to_health_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            window_size: self.manager.health_window_size,
            recent_window: self.manager.health_recent_window,
            healthy_threshold: self.manager.healthy_threshold,
        }
    }

    pub fn to_manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            strategy: self.manager.strategy,
            cache: self.to_cache_config(),
            circuit_breaker: self.to_breaker_config(),
            health: self.to_health_config(),
            weights: self.manager.weights.clone(),
            max_fallback_attempts: self.manager.max_fallback_attempts,
        }
    }

    /// The local backend expressed as a provider entry for the adapter factory.
    pub fn local_provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            endpoint: Some(self.local.endpoint.clone()),
            timeout_seconds: self.local.timeout_seconds,
            max_retries: self.local.max_retries,
            requests_per_minute: None,
            tokens_per_minute: None,
            default_confidence: self.local.default_confidence,
            ..ProviderConfig::new(
                "local",
                ProviderKind::Ollama,
                self.local.model_for(Capability::ImageAnalysis).unwrap_or("llava:13b"),
            )
        }
    }

    pub fn routing_target(&self, label: &str) -> Option<ProviderTarget> {
        self.routing.target_for(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate_all().is_ok());
        assert_eq!(config.providers.len(), 3);
        assert_eq!(config.manager.strategy, SelectionStrategy::Adaptive);
        assert_eq!(config.manager.failure_threshold, 5);
        assert_eq!(config.local.confidence_threshold, 0.6);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.manager.failure_threshold = 0;
        assert!(config.validate_all().is_err());

        let mut config = AppConfig::default();
        config.providers[0].default_confidence = 1.5;
        assert!(config.validate_all().is_err());

        let mut config = AppConfig::default();
        config.providers[1].name = "gemini".to_string();
        assert!(config.validate_all().is_err());

        let mut config = AppConfig::default();
        config.routing.priority_models.insert("manual".to_string(), ":broken".to_string());
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn test_priority_sorting() {
        let mut config = AppConfig::default();
        config.providers[0].priority = 9;

        let names: Vec<_> = config
            .get_providers_by_priority()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["anthropic", "openai", "gemini"]);
    }

    #[test]
    fn test_budget_report_lists_enabled_providers() {
        let mut config = AppConfig::default();
        config.providers[2].enabled = false;
        config.providers[1].input_price_per_1k = Some(Decimal::new(3, 3));

        let report = config.budget_report();
        let names: Vec<_> = report.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["gemini", "anthropic"]);
        assert_eq!(report[0].daily_budget, Some(Decimal::new(5, 0)));
        assert_eq!(report[1].input_price_per_1k, Some(Decimal::new(3, 3)));
        assert_eq!(report[1].output_price_per_1k, None);
    }

    #[test]
    fn test_config_conversion() {
        let config = AppConfig::default();

        let manager = config.to_manager_config();
        assert_eq!(manager.circuit_breaker.failure_threshold, 5);
        assert_eq!(manager.cache.ttl, Duration::from_secs(300));
        assert_eq!(manager.max_fallback_attempts, 1);

        let settings = config.providers[1].to_settings();
        assert_eq!(settings.name, "anthropic");
        assert_eq!(settings.limits.requests_per_minute, Some(50));
        assert_eq!(settings.timeout, Duration::from_secs(60));

        let target = config.routing_target("complex").unwrap();
        assert_eq!(target.provider, "anthropic");
        assert!(config.routing_target("default").is_none());
        assert!(config.routing_target("unknown-label").is_none());

        let mut pinned = config.clone();
        pinned
            .routing
            .priority_models
            .insert("default".to_string(), "openai:gpt-4o-mini".to_string());
        let fallback = pinned.routing_target("unknown-label").unwrap();
        assert_eq!(fallback.provider, "openai");
        assert_eq!(fallback.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn test_api_key_resolution() {
        let mut provider = ProviderConfig::new("custom", ProviderKind::OpenAI, "gpt-4o");
        provider.api_key_env = Some("AICLEANER_TEST_KEY_THAT_IS_NOT_SET".to_string());
        assert!(provider.api_key().is_none());

        provider.api_key = Some("sk-test".to_string());
        assert_eq!(provider.api_key().as_deref(), Some("sk-test"));
    }

    #[tokio::test]
    async fn test_load_writes_defaults_then_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = AppConfig::load(&path).await.unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(loaded.providers.len(), created.providers.len());
        assert_eq!(loaded.providers[0].daily_budget, Some(Decimal::new(5, 0)));
        assert_eq!(loaded.routing.priority_models, created.routing.priority_models);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[manager]
strategy = "round_robin"

[[providers]]
name = "home-ollama"
kind = "ollama"
model = "llava:7b"
endpoint = "http://192.168.1.20:11434"
"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.manager.strategy, SelectionStrategy::RoundRobin);
        assert_eq!(config.manager.cache_ttl_seconds, 300);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].kind, ProviderKind::Ollama);
        assert_eq!(config.providers[0].endpoint(), "http://192.168.1.20:11434");
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[manager]\nfailure_threshold = 0\n").unwrap();

        let err = AppConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
