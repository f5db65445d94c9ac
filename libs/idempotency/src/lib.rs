//! Redelivery guard for bus consumers.
//!
//! At-least-once delivery means a forwarded message can come back after a crash between publish
//! and ack. The guard remembers which `(channel, type, message_id)` triples were already forwarded
//! so the second copy can be acked without repeating side effects.

use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration as StdDuration,
};

use anyhow::{Context, Result};
use async_nats::jetstream::{
    Context as JsContext,
    context::KeyValueErrorKind,
    kv::{self, CreateErrorKind},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::{instrument, warn};

/// Dedup key for one consumed message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdKey {
    pub channel: String,
    pub msg_type: String,
    pub message_id: String,
}

impl IdKey {
    pub fn new(
        channel: impl Into<String>,
        msg_type: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            msg_type: msg_type.into(),
            message_id: message_id.into(),
        }
    }
}

impl Display for IdKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.channel, self.msg_type, self.message_id)
    }
}

/// Contract implemented by dedup stores.
#[async_trait]
pub trait IdemStore: Send + Sync {
    /// Whether `key` was registered and has not expired.
    async fn contains(&self, key: &str) -> Result<bool>;

    /// Registers `key` for `ttl_s` seconds. `Ok(false)` when it was already present.
    async fn put_if_absent(&self, key: &str, ttl_s: u64) -> Result<bool>;
}

pub type SharedIdemStore = Arc<dyn IdemStore>;

/// Expired entries are swept after this many registrations.
const DEFAULT_PURGE_EVERY: usize = 1024;

/// Process-local store. Lookups ignore expired entries; registrations sweep them periodically.
#[derive(Clone)]
pub struct InMemoryIdemStore {
    inner: Arc<RwLock<HashMap<String, OffsetDateTime>>>,
    inserts: Arc<AtomicUsize>,
    purge_every: usize,
}

impl Default for InMemoryIdemStore {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            inserts: Arc::default(),
            purge_every: DEFAULT_PURGE_EVERY,
        }
    }
}

impl InMemoryIdemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweeps expired entries every `inserts` registrations instead of the default 1024.
    pub fn with_purge_every(mut self, inserts: usize) -> Self {
        self.purge_every = inserts.max(1);
        self
    }

    pub async fn purge_expired(&self, now: OffsetDateTime) {
        self.inner.write().await.retain(|_, expires| *expires > now);
    }

    pub async fn entry_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl IdemStore for InMemoryIdemStore {
    async fn contains(&self, key: &str) -> Result<bool> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .inner
            .read()
            .await
            .get(key)
            .is_some_and(|expires| *expires > now))
    }

    async fn put_if_absent(&self, key: &str, ttl_s: u64) -> Result<bool> {
        let now = OffsetDateTime::now_utc();
        let mut guard = self.inner.write().await;
        if guard.get(key).is_some_and(|expires| *expires > now) {
            return Ok(false);
        }
        let inserted = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if inserted % self.purge_every == 0 {
            guard.retain(|_, expires| *expires > now);
        }
        guard.insert(key.to_string(), now + Duration::seconds(ttl_s as i64));
        Ok(true)
    }
}

/// JetStream key-value store shared by every replica in a consumer group.
///
/// Expiry is the bucket's `max_age`; keys are written without a per-message TTL.
pub struct NatsKvIdemStore {
    bucket: kv::Store,
}

impl NatsKvIdemStore {
    /// Opens the bucket, creating it with `ttl` as its entry lifetime on first use.
    pub async fn new(js: &JsContext, bucket: &str, ttl: StdDuration) -> Result<Self> {
        let bucket = match js.get_key_value(bucket).await {
            Ok(store) => store,
            Err(err) if err.kind() == KeyValueErrorKind::GetBucket => js
                .create_key_value(bucket_config(bucket, ttl))
                .await
                .with_context(|| format!("create JetStream KV bucket {bucket}"))?,
            Err(err) => anyhow::bail!("idempotency kv init failed: {err}"),
        };
        Ok(Self { bucket })
    }
}

fn bucket_config(bucket: &str, ttl: StdDuration) -> kv::Config {
    kv::Config {
        bucket: bucket.to_string(),
        history: 1,
        max_age: ttl.max(StdDuration::from_secs(60)),
        ..Default::default()
    }
}

#[async_trait]
impl IdemStore for NatsKvIdemStore {
    #[instrument(name = "idempotency.contains", skip(self), fields(key = %key))]
    async fn contains(&self, key: &str) -> Result<bool> {
        let entry = self
            .bucket
            .get(key)
            .await
            .with_context(|| format!("read idempotency key {key}"))?;
        Ok(entry.is_some())
    }

    #[instrument(name = "idempotency.put_if_absent", skip(self), fields(key = %key))]
    async fn put_if_absent(&self, key: &str, _ttl_s: u64) -> Result<bool> {
        let seen_at = OffsetDateTime::now_utc().unix_timestamp();
        let payload = serde_json::to_vec(&serde_json::json!({ "seen_at": seen_at }))?;

        match self.bucket.create(key, payload.into()).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == CreateErrorKind::AlreadyExists => Ok(false),
            Err(err) => {
                Err(anyhow::anyhow!(err).context(format!("put idempotency key {key}")))
            }
        }
    }
}

/// Which store backs the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyBackend {
    Off,
    Memory,
    Nats,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown idempotency backend `{0}` (expected off, memory or nats)")]
pub struct UnknownBackend(pub String);

impl std::str::FromStr for IdempotencyBackend {
    type Err = UnknownBackend;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" => Ok(Self::Off),
            "memory" | "mem" | "" => Ok(Self::Memory),
            "nats" | "jetstream" | "kv" => Ok(Self::Nats),
            other => Err(UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub backend: IdempotencyBackend,
    pub ttl_hours: u64,
    pub bucket: String,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            backend: IdempotencyBackend::Memory,
            ttl_hours: 36,
            bucket: "iotv-idempotency".to_string(),
        }
    }
}

impl IdempotencyConfig {
    /// Dedupe window as a duration.
    pub fn ttl(&self) -> StdDuration {
        StdDuration::from_secs(self.ttl_hours.saturating_mul(3600))
    }

    pub fn from_env() -> Result<Self, UnknownBackend> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, UnknownBackend>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(backend) = lookup("IDEMPOTENCY_BACKEND") {
            cfg.backend = backend.parse()?;
        }
        if let Some(ttl) = lookup("IDEMPOTENCY_TTL_HOURS")
            && let Ok(parsed) = ttl.trim().parse::<u64>()
        {
            cfg.ttl_hours = parsed.max(1);
        }
        if let Some(bucket) = lookup("IDEMPOTENCY_KV_BUCKET")
            && !bucket.trim().is_empty()
        {
            cfg.bucket = bucket.trim().to_string();
        }
        Ok(cfg)
    }
}

/// Check-then-commit dedup used around a dispatch.
///
/// [`IdempotencyGuard::is_duplicate`] runs before any side effect and
/// [`IdempotencyGuard::mark_processed`] only after the forward was published, so a failed publish
/// leaves the message eligible for redelivery. Store outages fail open.
#[derive(Clone)]
pub struct IdempotencyGuard {
    ttl_secs: u64,
    store: SharedIdemStore,
}

impl IdempotencyGuard {
    pub fn new(store: SharedIdemStore, ttl_hours: u64) -> Self {
        Self {
            store,
            ttl_secs: ttl_hours.saturating_mul(3600).max(60),
        }
    }

    pub async fn is_duplicate(&self, key: &IdKey) -> bool {
        match self.store.contains(&key.to_string()).await {
            Ok(true) => {
                warn!(
                    channel = %key.channel,
                    msg_type = %key.msg_type,
                    message_id = %key.message_id,
                    "duplicate message skipped"
                );
                metrics::counter!(
                    "iotv_idempotency_hit",
                    "channel" => key.channel.clone(),
                    "type" => key.msg_type.clone()
                )
                .increment(1);
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!(error = %err, key = %key, "idempotency lookup failed; processing anyway");
                false
            }
        }
    }

    pub async fn mark_processed(&self, key: &IdKey) {
        if let Err(err) = self.store.put_if_absent(&key.to_string(), self.ttl_secs).await {
            warn!(error = %err, key = %key, "failed to record processed message");
        }
    }
}
