use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::coordinator::Priority;
use crate::models::provider::{AnalysisRequest, Capability, ProviderTarget};

#[derive(Parser)]
#[command(name = "aicleaner")]
#[command(about = "Routes room-cleaning analysis requests across local and cloud AI providers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze an image or answer a text prompt
    Analyze {
        /// Prompt sent to the model
        prompt: String,

        /// Image to analyze
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Routing priority label
        #[arg(short, long, value_enum, default_value = "default")]
        priority: PriorityArg,

        /// Pin the request to a provider, optionally with a model (provider:model)
        #[arg(short, long)]
        target: Option<String>,

        /// Never send the request to a cloud provider
        #[arg(long)]
        privacy: bool,

        /// Skip the local backend
        #[arg(long)]
        no_local: bool,
    },

    /// Show provider, breaker and cache status
    Status,

    /// Show configured budgets and prices per provider
    Costs,

    /// Validate the configuration file
    CheckConfig,

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Manual,
    Scheduled,
    Complex,
    Default,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Manual => Priority::Manual,
            PriorityArg::Scheduled => Priority::Scheduled,
            PriorityArg::Complex => Priority::Complex,
            PriorityArg::Default => Priority::Default,
        }
    }
}

/// Builds the request for `analyze` from its arguments.
pub fn build_request(
    prompt: &str,
    image: Option<&PathBuf>,
    priority: PriorityArg,
    target: Option<&str>,
    privacy: bool,
    no_local: bool,
) -> AnalysisRequest {
    let capability = if image.is_some() {
        Capability::ImageAnalysis
    } else {
        Capability::TextGeneration
    };

    let mut request = AnalysisRequest::new(prompt, capability)
        .with_context("priority", Priority::from(priority).as_str());
    if let Some(path) = image {
        request = request.with_image_path(path.clone());
    }
    if privacy {
        request = request.with_context("privacy_mode", "true");
    }
    if no_local {
        request = request.with_context("prefer_local", "false");
    }
    if let Some(pinned) = target {
        request = request.with_target(ProviderTarget::parse(pinned));
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_analyze() {
        let cli = Cli::parse_from([
            "aicleaner",
            "--debug",
            "analyze",
            "What should I clean?",
            "--image",
            "kitchen.jpg",
            "--priority",
            "complex",
            "--privacy",
        ]);
        assert!(cli.debug);
        match cli.command {
            Commands::Analyze {
                prompt,
                image,
                priority,
                privacy,
                no_local,
                ..
            } => {
                assert_eq!(prompt, "What should I clean?");
                assert_eq!(image, Some(PathBuf::from("kitchen.jpg")));
                assert_eq!(priority, PriorityArg::Complex);
                assert!(privacy);
                assert!(!no_local);
            }
            _ => panic!("expected analyze"),
        }
    }

    #[test]
    fn test_build_request_sets_context() {
        let image = PathBuf::from("room.png");
        let request = build_request(
            "Rate it",
            Some(&image),
            PriorityArg::Manual,
            Some("anthropic:claude-3-haiku-20240307"),
            false,
            true,
        );
        assert_eq!(request.capability, Capability::ImageAnalysis);
        assert_eq!(request.context.get("priority").map(String::as_str), Some("manual"));
        assert_eq!(request.context_flag("prefer_local"), Some(false));
        assert_eq!(request.context_flag("privacy_mode"), None);
        assert_eq!(request.model_for("anthropic"), Some("claude-3-haiku-20240307"));

        let text = build_request("Plan my week", None, PriorityArg::Default, None, false, false);
        assert_eq!(text.capability, Capability::TextGeneration);
        assert!(text.target.is_none());
    }
}
