mod api;
mod config;
mod serve_cmd;

use anyhow::Context;
use clap::{Parser, Subcommand};

use skalds_db::pool;

use config::{CliOverrides, SkaldsConfig};

#[derive(Parser)]
#[command(name = "skalds", about = "Distributed task orchestration controller")]
struct Cli {
    /// Database URL (overrides SKALDS_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Redis URL (overrides SKALDS_REDIS_URL env var)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Kafka bootstrap brokers (overrides SKALDS_KAFKA_BROKERS env var)
    #[arg(long, global = true)]
    kafka_brokers: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a skalds config file (no services required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/skalds")]
        db_url: String,
        /// Redis connection URL
        #[arg(long, default_value = "redis://localhost:6379")]
        cache_url: String,
        /// Kafka bootstrap brokers
        #[arg(long, default_value = "localhost:9092")]
        brokers: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the skalds database and apply migrations
    DbInit,
    /// Run the controller (API plus the components of the selected mode)
    Serve {
        /// Run mode: controller, monitor, or dispatcher
        #[arg(long)]
        mode: Option<String>,
        /// Bind host override
        #[arg(long)]
        host: Option<String>,
        /// Bind port override
        #[arg(long)]
        port: Option<u16>,
    },
}

/// Execute `skalds init`: write the config file.
fn cmd_init(db_url: &str, cache_url: &str, brokers: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: Some(db_url.to_owned()),
        },
        cache: config::CacheSection {
            url: Some(cache_url.to_owned()),
        },
        events: config::EventsSection {
            brokers: Some(brokers.to_owned()),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url  = {db_url}");
    println!("  cache.url     = {cache_url}");
    println!("  events.brokers = {brokers}");
    println!();
    println!("Next: run `skalds db-init` to create and migrate the database.");

    Ok(())
}

/// Execute `skalds db-init`: create database and run migrations.
async fn cmd_db_init(overrides: &CliOverrides) -> anyhow::Result<()> {
    let resolved = SkaldsConfig::resolve(overrides)?;

    println!("Initializing skalds database...");
    pool::ensure_database_exists(&resolved.db).await?;

    let db_pool = pool::create_pool(&resolved.db).await?;
    pool::run_migrations(&db_pool)
        .await
        .context("migration run failed")?;
    db_pool.close().await;

    println!("skalds db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = std::env::var("SKALDS_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
                tracing_subscriber::EnvFilter::new(level)
            }),
        )
        .init();

    let cli = Cli::parse();
    let overrides = CliOverrides {
        database_url: cli.database_url,
        redis_url: cli.redis_url,
        kafka_brokers: cli.kafka_brokers,
    };

    match cli.command {
        Commands::Init {
            db_url,
            cache_url,
            brokers,
            force,
        } => {
            cmd_init(&db_url, &cache_url, &brokers, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(&overrides).await?;
        }
        Commands::Serve { mode, host, port } => {
            let mut resolved = SkaldsConfig::resolve(&overrides)?;
            if let Some(mode) = mode {
                resolved.controller.run_mode = mode
                    .parse()
                    .with_context(|| format!("invalid --mode {mode}"))?;
            }
            if let Some(host) = host {
                resolved.controller.bind_host = host;
            }
            if let Some(port) = port {
                resolved.controller.bind_port = port;
            }
            serve_cmd::run_serve(resolved).await?;
        }
    }

    Ok(())
}
