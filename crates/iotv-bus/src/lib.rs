use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error(transparent)]
    Publish(#[from] anyhow::Error),
}

/// Publishes one message body to a named subject.
///
/// Implementations must be safe to share across concurrent dispatches.
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn publish(&self, subject: &str, body: Bytes) -> Result<(), BusError>;
}

pub type SharedBusClient = Arc<dyn BusClient>;

/// JetStream publish that waits for the stream to acknowledge persistence.
#[derive(Clone)]
pub struct JetStreamBusClient {
    js: async_nats::jetstream::Context,
}

impl JetStreamBusClient {
    pub fn new(js: async_nats::jetstream::Context) -> Self {
        Self { js }
    }
}

#[async_trait]
impl BusClient for JetStreamBusClient {
    async fn publish(&self, subject: &str, body: Bytes) -> Result<(), BusError> {
        let ack = self
            .js
            .publish(subject.to_string(), body)
            .await
            .map_err(|err| BusError::Publish(anyhow::Error::new(err)))?;
        let ack = ack
            .await
            .map_err(|err| BusError::Publish(anyhow::Error::new(err)))?;
        debug!(subject, stream = %ack.stream, seq = ack.sequence, "publish acknowledged");
        Ok(())
    }
}

/// Records publishes in memory. Can be switched into a failing mode to exercise redelivery.
#[derive(Clone, Default)]
pub struct InMemoryBusClient {
    published: Arc<Mutex<Vec<(String, Bytes)>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryBusClient {
    /// Client whose publishes all fail until [`InMemoryBusClient::set_failing`] clears it.
    pub fn failing() -> Self {
        let client = Self::default();
        client.set_failing(true);
        client
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Drains recorded publishes, decoding each body as JSON (`Null` when it is not JSON).
    pub async fn take_published(&self) -> Vec<(String, Value)> {
        let mut guard = self.published.lock().await;
        std::mem::take(&mut *guard)
            .into_iter()
            .map(|(subject, body)| {
                let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                (subject, value)
            })
            .collect()
    }

    pub async fn published_count(&self) -> usize {
        self.published.lock().await.len()
    }
}

#[async_trait]
impl BusClient for InMemoryBusClient {
    async fn publish(&self, subject: &str, body: Bytes) -> Result<(), BusError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::Publish(anyhow::anyhow!(
                "in-memory bus rejected publish to {subject}"
            )));
        }
        let mut guard = self.published.lock().await;
        guard.push((subject.to_string(), body));
        Ok(())
    }
}
