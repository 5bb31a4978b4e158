use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use sipvoice::{app::AppStateBuilder, config::Config, version};
use std::fs::OpenOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    author,
    version = version::get_short_version(),
    about = "Answers phone calls with an AI voice agent over SIP/RTP or provider webhooks",
    long_about = version::get_version_info()
)]
struct Cli {
    /// Path to the configuration file
    #[clap(long, global = true, help = "Path to the configuration file (TOML format)")]
    conf: Option<String>,
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and exit without starting the server
    CheckConfig,
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received CTRL+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let config = if let Some(ref path) = cli.conf {
        println!("Loading config from: {}", path);
        Config::load(path).expect("Failed to load config")
    } else {
        println!("Loading default config");
        Config::default()
    };

    if matches!(cli.command, Some(Commands::CheckConfig)) {
        let issues = config.validate();
        if issues.is_empty() {
            println!("Configuration is valid.");
            return Ok(());
        }
        eprintln!("Configuration validation failed:");
        for issue in issues {
            eprintln!("- {}: {}", issue.field, issue.message);
        }
        std::process::exit(1);
    }

    println!("Start at {}", Utc::now());
    println!("{}", version::get_version_info());

    let mut env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(directive) = config
        .log_level
        .as_deref()
        .and_then(|level| level.parse::<tracing_subscriber::filter::Directive>().ok())
    {
        env_filter = env_filter.add_directive(directive);
    }

    let mut _guard = None;
    if let Some(ref log_file) = config.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .expect("Failed to open log file");
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        _guard = Some(guard);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .ok();
    }

    let token = CancellationToken::new();
    let state = AppStateBuilder::new()
        .with_config(config)
        .with_cancel_token(token.clone())
        .build()
        .expect("Failed to build app state");

    info!("Starting sipvoice on {}", state.config.http_addr);
    tokio::spawn(shutdown_signal(token));
    sipvoice::app::run(state).await
}
