use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vigia::config::{Config, ConfigError};
use vigia::Vigia;

#[derive(Parser)]
#[command(name = "vigia")]
#[command(about = "Connection, bootstrap and replication health manager for MongoDB replica sets")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Vigia Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, bootstrap and run health checks until interrupted
    Run {
        /// Path to configuration file (defaults plus MONGODB_* variables when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run topology, replication and metrics checks once and print JSON
    Check {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_vigia(config).await?,
        Commands::Check { config } => run_check(config).await?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let mut config = match &path {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    config
        .apply_env()
        .context("Invalid MONGODB_* environment overrides")?;
    Ok(config)
}

async fn run_vigia(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.clone())?;
    init_logging(&config)?;

    if let Some(path) = &config_path {
        info!("Configuration loaded from: {:?}", path);
    }
    info!(
        "Primary {}:{}, secondary {}:{}, database {}",
        config.store.primary_host,
        config.store.primary_port,
        config.store.secondary_host,
        config.store.secondary_port,
        config.store.database
    );

    let vigia = Arc::new(Vigia::new(config)?);
    if let Err(e) = vigia.start().await {
        error!("Startup failed [{}]: {}", e.severity(), e);
        return Err(e.into());
    }

    let monitor = Arc::clone(&vigia);
    tokio::select! {
        _ = monitor.run_health_checks() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    vigia.shutdown().await;
    Ok(())
}

async fn run_check(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging(&config)?;

    let vigia = Vigia::new(config)?;
    vigia.start().await?;

    let manager = vigia.manager();
    let report = vigia.monitor().check().await;
    let metrics = manager.metrics().await;
    let state = manager.bootstrap_state().await;

    let output = serde_json::json!({
        "health": report,
        "metrics": metrics,
        "bootstrap": state,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    vigia.shutdown().await;
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  vigia run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!(
                "  Primary: {}:{}",
                config.store.primary_host, config.store.primary_port
            );
            println!(
                "  Secondary: {}:{}",
                config.store.secondary_host, config.store.secondary_port
            );
            println!("  Database: {}", config.store.database);
            println!(
                "  Replica set: {}",
                config.store.replica_set.as_deref().unwrap_or("(none)")
            );
            println!(
                "  Credentials: {}",
                if config.store.username.is_some() {
                    "configured"
                } else {
                    "none"
                }
            );
            println!("  Health interval: {}s", config.health.interval_sec);
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("vigia v{}", env!("CARGO_PKG_VERSION"));
    println!("Connection, bootstrap and replication health manager for MongoDB replica sets");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Ordered connection strategy ladder with graceful single-node fallback");
    println!("  • Idempotent collection, index and admin account bootstrap");
    println!("  • Live replication lag verification with sentinel documents");
    println!("  • Pluggable cluster health classification");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
