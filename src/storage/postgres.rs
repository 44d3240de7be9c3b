//! PostgreSQL storage backend

use crate::auth::{
    ApiKey, AuthError, Authorizer, DeliveryDenied, DeliveryLedger, DEFAULT_DAILY_DELIVERY_LIMIT,
};
use crate::server::PublishedEvent;
use crate::storage::StorageError;
use crate::topics::TopicFamily;
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use futures::{stream, Stream, StreamExt};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_postgres::{AsyncMessage, NoTls};
use tracing::{debug, info, warn};

/// Notification channel carrying `{"topic": "...", "payload": <json>}` events
pub const EVENTS_CHANNEL: &str = "blockfeed_events";

/// How often delivery history older than the rate limit window is deleted
const HISTORY_PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const POOL_SIZE: usize = 16;

/// Postgres connection settings, shared by the pool and the LISTEN connection
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pg: tokio_postgres::Config,
}

impl PostgresConfig {
    /// Settings from the libpq `PG*` variables; `None` without a user or database
    pub fn from_env() -> Option<Self> {
        let user = std::env::var("PGUSER").ok()?;
        let database = std::env::var("PGDATABASE").ok()?;
        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432);

        let mut pg = tokio_postgres::Config::new();
        pg.host(&host).port(port).user(&user).dbname(&database);
        if let Ok(password) = std::env::var("PGPASSWORD") {
            pg.password(password);
        }

        Some(Self { pg })
    }

    /// Parse a `postgres://` URL or a `key=value` connection string
    pub fn from_url(url: &str) -> Result<Self, StorageError> {
        let pg: tokio_postgres::Config = url
            .parse()
            .map_err(|e| StorageError::Config(format!("invalid database URL: {}", e)))?;

        if pg.get_user().is_none() {
            return Err(StorageError::Config("database URL has no user".to_string()));
        }

        Ok(Self { pg })
    }

    pub fn as_pg_config(&self) -> &tokio_postgres::Config {
        &self.pg
    }
}

/// Stored API key as listed by operators
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub key: ApiKey,
    pub label: Option<String>,
    pub enabled: bool,
    pub created_at: String,
    /// Deliveries within the last day
    pub deliveries_today: i64,
}

/// PostgreSQL storage for API keys, delivery history and the event feed
pub struct PostgresStore {
    pool: Pool,
    config: PostgresConfig,
    ledger: DeliveryLedger,
}

fn db_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Database(e.to_string())
}

impl PostgresStore {
    pub async fn new(config: PostgresConfig) -> Result<Self, StorageError> {
        let manager = Manager::from_config(
            config.as_pg_config().clone(),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(db_err)?;

        let store = Self {
            pool,
            config,
            ledger: DeliveryLedger::new(Some(DEFAULT_DAILY_DELIVERY_LIMIT)).with_records(),
        };
        store.ensure_schema().await?;

        Ok(store)
    }

    /// Deliveries allowed per key and day, `None` for unlimited
    pub fn with_daily_limit(mut self, limit: Option<u64>) -> Self {
        self.ledger = DeliveryLedger::new(limit).with_records();
        self
    }

    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        let client = self.pool.get().await.map_err(db_err)?;

        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS blockfeed_api_keys (
                    key TEXT PRIMARY KEY,
                    label TEXT,
                    enabled BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );

                CREATE INDEX IF NOT EXISTS blockfeed_api_keys_label_idx ON blockfeed_api_keys(label);

                CREATE TABLE IF NOT EXISTS blockfeed_delivery_history (
                    id BIGSERIAL PRIMARY KEY,
                    key TEXT NOT NULL,
                    endpoint TEXT NOT NULL,
                    bytes BIGINT NOT NULL,
                    delivered_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );

                CREATE INDEX IF NOT EXISTS blockfeed_delivery_history_key_idx
                    ON blockfeed_delivery_history(key, delivered_at);
                "#,
            )
            .await
            .map_err(db_err)?;

        info!("Database schema initialized");
        Ok(())
    }

    /// Generate and store a new enabled key
    pub async fn create_key(&self, label: Option<&str>) -> Result<ApiKey, StorageError> {
        let client = self.pool.get().await.map_err(db_err)?;
        let key = ApiKey::generate();

        client
            .execute(
                "INSERT INTO blockfeed_api_keys (key, label) VALUES ($1, $2)",
                &[&key.as_str(), &label],
            )
            .await
            .map_err(db_err)?;

        debug!(label = ?label, "Created API key");
        Ok(key)
    }

    /// Enable or disable a key.
    ///
    /// A disabled key is refused for new subscriptions at once; running brokers
    /// stop its open subscriptions on their next delivery ledger sync.
    pub async fn set_enabled(&self, key: &ApiKey, enabled: bool) -> Result<(), StorageError> {
        let client = self.pool.get().await.map_err(db_err)?;

        let updated = client
            .execute(
                "UPDATE blockfeed_api_keys SET enabled = $1 WHERE key = $2",
                &[&enabled, &key.as_str()],
            )
            .await
            .map_err(db_err)?;

        if updated == 0 {
            return Err(StorageError::NotFound("API key not found".to_string()));
        }

        if enabled {
            self.ledger.reinstate(key);
        } else {
            self.ledger.revoke(key);
        }

        debug!(enabled, "Updated API key");
        Ok(())
    }

    pub async fn list_keys(&self) -> Result<Vec<ApiKeyRecord>, StorageError> {
        let client = self.pool.get().await.map_err(db_err)?;

        let rows = client
            .query(
                "SELECT k.key, k.label, k.enabled, k.created_at::text,
                        (SELECT COUNT(*) FROM blockfeed_delivery_history h
                          WHERE h.key = k.key AND h.delivered_at > NOW() - INTERVAL '1 day')
                 FROM blockfeed_api_keys k
                 ORDER BY k.created_at ASC",
                &[],
            )
            .await
            .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| ApiKeyRecord {
                key: ApiKey::new(row.get::<_, String>(0)),
                label: row.get(1),
                enabled: row.get(2),
                created_at: row.get(3),
                deliveries_today: row.get(4),
            })
            .collect())
    }

    /// `None` when the key is unknown
    async fn key_enabled(&self, key: &ApiKey) -> Result<Option<bool>, StorageError> {
        let client = self.pool.get().await.map_err(db_err)?;

        let row = client
            .query_opt(
                "SELECT enabled FROM blockfeed_api_keys WHERE key = $1",
                &[&key.as_str()],
            )
            .await
            .map_err(db_err)?;

        Ok(row.map(|row| row.get(0)))
    }

    /// Bring the in-memory delivery ledger and the database in line: write the
    /// deliveries recorded since the last sync, then reload disabled keys and
    /// daily counts. Returns how many deliveries were written.
    pub async fn sync_deliveries(&self) -> Result<usize, StorageError> {
        let client = self.pool.get().await.map_err(db_err)?;

        let records = self.ledger.take_records();
        if !records.is_empty() {
            let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
            let endpoints: Vec<&str> = records.iter().map(|r| r.family.as_str()).collect();
            let bytes: Vec<i64> = records
                .iter()
                .map(|r| i64::try_from(r.bytes).unwrap_or(i64::MAX))
                .collect();
            let times: Vec<SystemTime> = records.iter().map(|r| r.delivered_at).collect();

            client
                .execute(
                    "INSERT INTO blockfeed_delivery_history (key, endpoint, bytes, delivered_at)
                     SELECT * FROM UNNEST($1::text[], $2::text[], $3::bigint[], $4::timestamptz[])",
                    &[&keys, &endpoints, &bytes, &times],
                )
                .await
                .map_err(|e| {
                    StorageError::Database(format!(
                        "dropped {} delivery records: {}",
                        records.len(),
                        e
                    ))
                })?;
        }

        let disabled = client
            .query("SELECT key FROM blockfeed_api_keys WHERE enabled = FALSE", &[])
            .await
            .map_err(db_err)?;
        self.ledger
            .set_revoked(disabled.iter().map(|row| ApiKey::new(row.get::<_, String>(0))));

        if self.ledger.daily_limit().is_some() {
            let counts = client
                .query(
                    "SELECT key, COUNT(*) FROM blockfeed_delivery_history
                     WHERE delivered_at > NOW() - INTERVAL '1 day'
                     GROUP BY key",
                    &[],
                )
                .await
                .map_err(db_err)?;
            self.ledger.replace_deliveries(counts.iter().map(|row| {
                let count: i64 = row.get(1);
                (ApiKey::new(row.get::<_, String>(0)), count.max(0) as u64)
            }));
        }

        Ok(records.len())
    }

    /// Delete delivery history that no longer counts toward any limit
    pub async fn prune_delivery_history(&self) -> Result<u64, StorageError> {
        let client = self.pool.get().await.map_err(db_err)?;

        client
            .execute(
                "DELETE FROM blockfeed_delivery_history WHERE delivered_at < NOW() - INTERVAL '1 day'",
                &[],
            )
            .await
            .map_err(db_err)
    }

    /// Sync the delivery ledger every `every` and prune old history once a day.
    /// Runs until the task is dropped.
    pub async fn run_delivery_sync(self: Arc<Self>, every: Duration) {
        let mut sync = tokio::time::interval(every);
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prune = tokio::time::interval(HISTORY_PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?every, "Delivery ledger sync started");

        loop {
            tokio::select! {
                _ = sync.tick() => match self.sync_deliveries().await {
                    Ok(written) => debug!(written, "Synced delivery ledger"),
                    Err(e) => warn!(error = %e, "Delivery ledger sync failed"),
                },
                _ = prune.tick() => match self.prune_delivery_history().await {
                    Ok(deleted) => debug!(deleted, "Pruned delivery history"),
                    Err(e) => warn!(error = %e, "Delivery history pruning failed"),
                },
            }
        }
    }

    /// Forward notifications on `blockfeed_events` into `tx`.
    ///
    /// Returns `Ok` once every receiver is gone. Losing the LISTEN connection is
    /// an error, so the caller can reconnect. Uses a dedicated connection:
    /// pooled connections cannot hold a LISTEN.
    pub async fn event_feed(&self, tx: mpsc::Sender<PublishedEvent>) -> Result<(), StorageError> {
        let (client, mut connection) = self
            .config
            .as_pg_config()
            .connect(NoTls)
            .await
            .map_err(db_err)?;

        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
        let driver = tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let forwarded = match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        notify_tx.send(Ok(n.payload().to_string()))
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = notify_tx.send(Err(db_err(e)));
                        break;
                    }
                };
                if forwarded.is_err() {
                    break;
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {}", EVENTS_CHANNEL))
            .await
            .map_err(db_err)?;

        info!(channel = EVENTS_CHANNEL, "Listening for events");

        let notifications = stream::poll_fn(move |cx| notify_rx.poll_recv(cx));
        let result = forward_events(notifications, &tx).await;

        driver.abort();
        drop(client);
        info!(channel = EVENTS_CHANNEL, "Event feed stopped");
        result
    }
}

/// Decode feed notifications into `tx`, skipping malformed ones.
///
/// `Ok` when the receiving side went away, an error when the notification
/// stream failed or ended first.
async fn forward_events<S>(
    mut notifications: S,
    tx: &mpsc::Sender<PublishedEvent>,
) -> Result<(), StorageError>
where
    S: Stream<Item = Result<String, StorageError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = tx.closed() => return Ok(()),
            next = notifications.next() => next,
        };

        let Some(notification) = next else {
            return Err(StorageError::Database(
                "event notification stream ended".to_string(),
            ));
        };

        match PublishedEvent::from_json(&notification?) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                warn!(error = %e, "Skipping malformed event notification");
            }
        }
    }
}

#[async_trait]
impl Authorizer for PostgresStore {
    async fn authorize(&self, key: &ApiKey) -> Result<(), AuthError> {
        if key.is_empty() {
            return Err(AuthError::Missing);
        }
        // Never reaches the database with something that cannot be a stored key
        if !key.is_well_formed() {
            return Err(AuthError::UnknownKey);
        }

        match self.key_enabled(key).await {
            Ok(Some(true)) => {
                self.ledger.reinstate(key);
                Ok(())
            }
            Ok(Some(false)) => {
                self.ledger.revoke(key);
                Err(AuthError::Disabled)
            }
            Ok(None) => Err(AuthError::UnknownKey),
            Err(e) => Err(AuthError::Backend(e.to_string())),
        }
    }

    fn admit_delivery(&self, key: &ApiKey) -> Result<(), DeliveryDenied> {
        self.ledger.admit(key)
    }

    fn record_delivery(&self, key: &ApiKey, family: TopicFamily, bytes: usize) {
        self.ledger.record(key, family, bytes);
    }
}
