//! Blockfeed CLI entry point

mod cli;

use crate::cli::{Cli, Commands, KeyCommands};
use anyhow::{Context, Result};
use blockfeed::auth::{AdminKey, AllowAnyKey, ApiKey, Authorizer, StaticKeyAuthorizer};
use blockfeed::config::BrokerConfig;
use blockfeed::server::{Broker, PublishedEvent};
use blockfeed::storage::{PostgresConfig, PostgresStore};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Events buffered between the database listener and the dispatcher
const FEED_BUFFER: usize = 1024;

/// Waits between event feed reconnects
const FEED_BACKOFF: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// A feed that ran this long before failing starts over at the shortest wait
const FEED_HEALTHY_AFTER: Duration = Duration::from_secs(60);

/// `serve` flags beyond the broker configuration
struct ServeOptions {
    api_keys: Vec<String>,
    allow_any_key: bool,
    listen_events: bool,
    daily_limit: u64,
    sync_interval: u64,
}

/// Where subscriber keys are checked
#[derive(Debug, PartialEq, Eq)]
enum AuthSource {
    AnyKey,
    Static(Vec<ApiKey>),
    Database,
}

/// `--allow-any-key` wins over `--api-key`, which wins over the database
fn auth_source(allow_any_key: bool, api_keys: Vec<ApiKey>, has_database: bool) -> Option<AuthSource> {
    if allow_any_key {
        Some(AuthSource::AnyKey)
    } else if !api_keys.is_empty() {
        Some(AuthSource::Static(api_keys))
    } else if has_database {
        Some(AuthSource::Database)
    } else {
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db_config = match &cli.database_url {
        Some(url) => Some(PostgresConfig::from_url(url).context("Invalid DATABASE_URL")?),
        None => PostgresConfig::from_env(),
    };

    match cli.command {
        Commands::Serve {
            bind,
            queue_capacity,
            api_keys,
            allow_any_key,
            admin_key,
            listen_events,
            daily_limit,
            sync_interval,
        } => {
            let bind_addr: SocketAddr = bind.parse().context("Invalid bind address")?;
            let mut config = BrokerConfig::default()
                .with_bind_addr(bind_addr)
                .with_queue_capacity(queue_capacity);
            if let Some(key) = admin_key {
                config = config.with_admin_key(AdminKey::new(key));
            }

            let options = ServeOptions {
                api_keys,
                allow_any_key,
                listen_events,
                daily_limit,
                sync_interval,
            };
            serve(config, db_config, options).await
        }
        Commands::Keys { command } => {
            keys(db_config.context("DATABASE_URL not set")?, command).await
        }
        Commands::Init => init(db_config.context("DATABASE_URL not set")?).await,
    }
}

async fn serve(
    config: BrokerConfig,
    db_config: Option<PostgresConfig>,
    options: ServeOptions,
) -> Result<()> {
    let api_keys: Vec<ApiKey> = options
        .api_keys
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .map(ApiKey::new)
        .collect();
    let daily_limit = (options.daily_limit > 0).then_some(options.daily_limit);

    let source = auth_source(options.allow_any_key, api_keys, db_config.is_some())
        .context("No authorizer configured: pass --api-key, --allow-any-key or DATABASE_URL")?;

    // Only touch the database when something needs it
    let needs_store = options.listen_events || source == AuthSource::Database;
    let store = match db_config {
        Some(db_config) if needs_store => Some(Arc::new(
            PostgresStore::new(db_config)
                .await?
                .with_daily_limit(daily_limit),
        )),
        _ => None,
    };

    let mut ledger_store = None;
    let authorizer: Arc<dyn Authorizer> = match source {
        AuthSource::AnyKey => {
            warn!("Accepting any API key, do not use in production");
            Arc::new(AllowAnyKey)
        }
        AuthSource::Static(keys) => {
            info!(keys = keys.len(), daily_limit = ?daily_limit, "Authorizing against configured API keys");
            let authorizer = StaticKeyAuthorizer::new(keys);
            match daily_limit {
                Some(limit) => Arc::new(authorizer.with_daily_limit(limit)),
                None => Arc::new(authorizer),
            }
        }
        AuthSource::Database => {
            let store = store.clone().context("Database store not connected")?;
            info!(daily_limit = ?daily_limit, "Authorizing against database API keys");
            ledger_store = Some(store.clone());
            store
        }
    };

    let ledger_sync = ledger_store.clone().map(|store| {
        let every = Duration::from_secs(options.sync_interval.max(1));
        tokio::spawn(store.run_delivery_sync(every))
    });

    if config.admin_key.is_none() {
        info!("No admin key set, HTTP publishing disabled");
    }

    let broker = Broker::new(config, authorizer);

    if options.listen_events {
        let store = store.context("--listen-events requires DATABASE_URL")?;
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        broker.spawn_feed(rx);
        tokio::spawn(run_event_feed(store, tx));
    }

    info!(addr = %broker.config().bind_addr, "Blockfeed broker starting");
    let served = broker.run_until(shutdown_signal()).await;

    if let Some(sync) = ledger_sync {
        sync.abort();
    }
    if let Some(store) = ledger_store {
        // Deliveries recorded since the last sync
        if let Err(e) = store.sync_deliveries().await {
            warn!(error = %e, "Final delivery ledger sync failed");
        }
    }

    served
}

/// Keep the database event feed running, reconnecting with backoff until the
/// dispatcher side goes away
async fn run_event_feed(store: Arc<PostgresStore>, tx: mpsc::Sender<PublishedEvent>) {
    let mut failures = 0usize;

    loop {
        let started = Instant::now();
        let Err(e) = store.event_feed(tx.clone()).await else {
            return;
        };

        if started.elapsed() >= FEED_HEALTHY_AFTER {
            failures = 0;
        }
        let backoff = FEED_BACKOFF[failures.min(FEED_BACKOFF.len() - 1)];
        failures += 1;

        error!(
            error = %e,
            failures,
            backoff_secs = backoff.as_secs(),
            "Event feed failed, reconnecting"
        );

        tokio::select! {
            _ = tx.closed() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

async fn keys(db_config: PostgresConfig, command: KeyCommands) -> Result<()> {
    let store = PostgresStore::new(db_config).await?;

    match command {
        KeyCommands::Create { label } => {
            let key = store.create_key(label.as_deref()).await?;

            println!("{}", key.as_str());
            if let Some(l) = label {
                println!("Label: {}", l);
            }
        }
        KeyCommands::Disable { key } => {
            store.set_enabled(&ApiKey::new(key.clone()), false).await?;
            println!("Disabled key: {}", key);
        }
        KeyCommands::Enable { key } => {
            store.set_enabled(&ApiKey::new(key.clone()), true).await?;
            println!("Enabled key: {}", key);
        }
        KeyCommands::List => {
            let records = store.list_keys().await?;
            if records.is_empty() {
                println!("(no keys)");
            }
            for record in records {
                println!(
                    "{}  {:<8}  {:>8}  {}  {}",
                    record.key.as_str(),
                    if record.enabled { "enabled" } else { "disabled" },
                    record.deliveries_today,
                    record.created_at,
                    record.label.as_deref().unwrap_or("-"),
                );
            }
        }
    }

    Ok(())
}

async fn init(db_config: PostgresConfig) -> Result<()> {
    let _store = PostgresStore::new(db_config).await?;
    println!("Database schema initialized successfully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
