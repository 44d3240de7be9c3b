//! CLI command definitions

use blockfeed::auth::DEFAULT_DAILY_DELIVERY_LIMIT;
use blockfeed::config::{DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "blockfeed")]
#[command(about = "Topic-based event broker for a blockchain gateway", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Log level, used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker
    ///
    /// Without a database, subscribers are authorized against --api-key.
    Serve {
        /// Address to bind to
        #[arg(short, long, env = "BLOCKFEED_BIND", default_value_t = default_bind())]
        bind: String,

        /// Messages buffered per session before a slow subscriber is dropped
        #[arg(long, env = "BLOCKFEED_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
        queue_capacity: usize,

        /// Accepted subscriber API key (repeatable)
        #[arg(long = "api-key", env = "BLOCKFEED_API_KEYS", value_delimiter = ',')]
        api_keys: Vec<String>,

        /// Accept any non-empty API key (development only); overrides --api-key
        #[arg(long)]
        allow_any_key: bool,

        /// Admin key enabling the HTTP publish endpoint
        #[arg(long, env = "BLOCKFEED_ADMIN_KEY")]
        admin_key: Option<String>,

        /// Forward NOTIFY events from the database (requires DATABASE_URL)
        #[arg(long)]
        listen_events: bool,

        /// Deliveries allowed per API key and day, 0 for unlimited
        #[arg(long, env = "BLOCKFEED_DAILY_LIMIT", default_value_t = DEFAULT_DAILY_DELIVERY_LIMIT)]
        daily_limit: u64,

        /// Seconds between delivery ledger syncs with the database
        #[arg(long, env = "BLOCKFEED_SYNC_INTERVAL", default_value_t = 5)]
        sync_interval: u64,
    },

    /// Manage subscriber API keys
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Initialize the database schema
    Init,
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Create a new API key
    Create {
        /// Optional label, e.g. the owner of the key
        #[arg(long)]
        label: Option<String>,
    },

    /// Disable a key; running brokers drop its subscriptions on their next sync
    Disable {
        key: String,
    },

    /// Re-enable a disabled key
    Enable {
        key: String,
    },

    /// List all keys
    List,
}

fn default_bind() -> String {
    format!("0.0.0.0:{}", DEFAULT_PORT)
}
