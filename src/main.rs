use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use aicleaner::app::AppConfig;
use aicleaner::cli::{build_request, Cli, Commands};
use aicleaner::coordinator::Coordinator;
use aicleaner::platform::AppPaths;

fn init_logging(paths: &AppPaths, debug: bool) -> anyhow::Result<WorkerGuard> {
    let level = if debug { "aicleaner=debug" } else { "aicleaner=info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let file_appender = tracing_appender::rolling::daily(paths.logs_dir(), "aicleaner.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(guard)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct ConfigReport<'a> {
    path: &'a Path,
    valid: bool,
    enabled_providers: Vec<&'a str>,
    local_enabled: bool,
    strategy: String,
}

async fn run(cli: Cli, paths: AppPaths) -> anyhow::Result<ExitCode> {
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());

    match cli.command {
        Commands::InitConfig { force } => {
            if config_path.exists() && !force {
                bail!("{} already exists, pass --force to overwrite", config_path.display());
            }
            AppConfig::default().save(&config_path).await?;
            println!("Wrote default configuration to {}", config_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckConfig => {
            let config = AppConfig::load(&config_path)
                .await
                .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;
            print_json(&ConfigReport {
                path: &config_path,
                valid: true,
                enabled_providers: config.get_providers_by_priority().into_iter().map(|p| p.name.as_str()).collect(),
                local_enabled: config.local.enabled,
                strategy: config.manager.strategy.to_string(),
            })?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Analyze {
            prompt,
            image,
            priority,
            target,
            privacy,
            no_local,
        } => {
            let config = AppConfig::load(&config_path).await?;
            let coordinator = Coordinator::from_config(&config).await?;

            let request = build_request(&prompt, image.as_ref(), priority, target.as_deref(), privacy, no_local);
            info!("Analyzing request {}", request.id);
            let result = coordinator.process(&request).await;
            print_json(&result)?;

            coordinator.shutdown().await;
            Ok(if result.error { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
        Commands::Status => {
            let config = AppConfig::load(&config_path).await?;
            let coordinator = Coordinator::from_config(&config).await?;
            coordinator.manager().refresh_health().await;
            print_json(&coordinator.get_provider_status())?;
            coordinator.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Costs => {
            let config = AppConfig::load(&config_path).await?;
            print_json(&config.budget_report())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match AppPaths::new().and_then(|paths| paths.ensure_dirs_exist().map(|_| paths)) {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("Failed to prepare application directories: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _guard = match init_logging(&paths, cli.debug) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Starting AICleaner {}", env!("CARGO_PKG_VERSION"));

    match run(cli, paths).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
