use clap::{Parser, ValueEnum};
use fitledger_core::{EconomyConfig, RewardCatalog, StorageConfig};
use fitledger_service::registry::DEFAULT_MAX_CACHED_SESSIONS;
use fitledger_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    File,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "fitledgerd", version, about = "FitLedger token economy REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092", env = "FITLEDGER_LISTEN")]
    listen: SocketAddr,
    /// Session persistence backend. `auto` picks postgres when a database url is
    /// configured, otherwise file storage under `--data-dir`.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "FITLEDGER_STORAGE")]
    storage: StorageMode,
    /// Directory holding one JSON document per user for file storage.
    #[arg(long, default_value = "fitledger/data/sessions", env = "FITLEDGER_DATA_DIR")]
    data_dir: PathBuf,
    /// PostgreSQL url for session persistence.
    #[arg(long, env = "FITLEDGER_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "FITLEDGER_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Economy config JSON (rates, reward policy, mission templates, UTC offset).
    #[arg(long, env = "FITLEDGER_ECONOMY_CONFIG")]
    economy_config: Option<PathBuf>,
    /// Upper bound on user sessions kept in memory; idle ones are evicted.
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_CACHED_SESSIONS,
        env = "FITLEDGER_MAX_CACHED_SESSIONS"
    )]
    max_cached_sessions: usize,
    /// Reward catalog JSON. The built-in catalog is used when omitted.
    #[arg(long, env = "FITLEDGER_CATALOG")]
    catalog: Option<PathBuf>,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::File => StorageConfig::file(&cli.data_dir),
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::file(&cli.data_dir),
        },
    };

    Ok(storage)
}

fn load_catalog(path: Option<&PathBuf>) -> anyhow::Result<RewardCatalog> {
    match path {
        Some(path) => {
            let bytes = std::fs::read(path)?;
            Ok(RewardCatalog::from_json(&bytes)?)
        }
        None => Ok(RewardCatalog::builtin()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "fitledger_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    let economy = match cli.economy_config.as_ref() {
        Some(path) => EconomyConfig::load(path)?,
        None => EconomyConfig::default(),
    };
    let catalog = load_catalog(cli.catalog.as_ref())?;

    let units: Vec<&str> = economy
        .conversion_rates
        .units()
        .map(|unit| unit.as_str())
        .collect();
    info!(
        storage = storage.label(),
        rewards = catalog.len(),
        units = ?units,
        templates = economy.mission_templates.len(),
        "Starting fitledger-service"
    );

    let state = ServiceState::bootstrap(ServiceConfig {
        storage,
        economy,
        catalog,
        max_cached_sessions: cli.max_cached_sessions,
    })
    .await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("fitledger-service REST listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
