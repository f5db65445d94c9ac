use std::sync::Arc;

use anyhow::{Context, Result};
use async_nats::jetstream::{
    self, AckKind,
    consumer::{AckPolicy, push::Config as PushConfig, push::Messages},
    stream::{Config as StreamConfig, RetentionPolicy},
};
use futures::{Stream, StreamExt};
use iotv_bus::{JetStreamBusClient, SharedBusClient};
use iotv_core::{
    AgentAdapter, BearerAuth, Channel, InMemorySettingsStore, SettingsResolver,
    SharedAgentGateway, SharedSettingsStore, SqliteSettingsStore,
};
use iotv_idempotency::{
    IdempotencyBackend, IdempotencyGuard, InMemoryIdemStore, NatsKvIdemStore, SharedIdemStore,
};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::dispatcher::{BusMessage, Dispatcher};
use crate::gateway::{EchoAgentGateway, HttpAgentGateway};

/// Wires the dispatcher's collaborators from config.
pub async fn build_dispatcher(
    config: &DispatcherConfig,
    bus: SharedBusClient,
    js: Option<&jetstream::Context>,
) -> Result<Dispatcher> {
    let store: SharedSettingsStore = match &config.settings_db {
        Some(path) => Arc::new(
            SqliteSettingsStore::open(path)
                .with_context(|| format!("open settings database {}", path.display()))?,
        ),
        None => {
            warn!("SETTINGS_DB_PATH not set; every device resolves to the default voice");
            Arc::new(InMemorySettingsStore::new())
        }
    };

    let gateway: SharedAgentGateway = match &config.agent.http_url {
        Some(url) => Arc::new(HttpAgentGateway::new(url.clone())?),
        None => {
            warn!("AGENT_HTTP_URL not set; agent replies echo the user's input");
            Arc::new(EchoAgentGateway)
        }
    };
    let mut agent = AgentAdapter::new(gateway)
        .with_selection(config.agent.answer_selection)
        .with_policy(config.agent.failure_policy)
        .with_timeout(config.agent.timeout);
    if let Some(key) = &config.agent.api_key {
        agent = agent.with_auth(Arc::new(BearerAuth::new(key.clone())));
    }

    let mut dispatcher = Dispatcher::new(bus, SettingsResolver::new(store), agent)
        .with_subject_prefix(config.subject_prefix.clone());

    let idem = &config.idempotency;
    let idem_store: Option<SharedIdemStore> = match (idem.backend, js) {
        (IdempotencyBackend::Off, _) => None,
        (IdempotencyBackend::Memory, _) => Some(Arc::new(InMemoryIdemStore::new())),
        (IdempotencyBackend::Nats, Some(js)) => {
            Some(Arc::new(
                NatsKvIdemStore::new(js, &idem.bucket, idem.ttl()).await?,
            ))
        }
        (IdempotencyBackend::Nats, None) => {
            anyhow::bail!("IDEMPOTENCY_BACKEND=nats needs a JetStream connection")
        }
    };
    if let Some(store) = idem_store {
        dispatcher = dispatcher.with_idempotency(IdempotencyGuard::new(store, idem.ttl_hours));
    }

    Ok(dispatcher)
}

/// Connects to NATS, declares the stream and consumers, and dispatches until ctrl-c.
pub async fn run(config: DispatcherConfig) -> Result<()> {
    let client = async_nats::connect(&config.nats_url)
        .await
        .with_context(|| format!("connect to NATS at {}", config.nats_url))?;
    let js = jetstream::new(client.clone());

    let bus: SharedBusClient = Arc::new(JetStreamBusClient::new(js.clone()));
    let dispatcher = Arc::new(build_dispatcher(&config, bus, Some(&js)).await?);

    let stream = js
        .get_or_create_stream(StreamConfig {
            name: config.stream.clone(),
            subjects: Channel::ALL
                .iter()
                .map(|channel| channel.subject(&config.subject_prefix))
                .collect(),
            retention: RetentionPolicy::Interest,
            max_messages: -1,
            max_messages_per_subject: -1,
            max_bytes: -1,
            ..Default::default()
        })
        .await
        .with_context(|| format!("declare stream {}", config.stream))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let permits = Arc::new(Semaphore::new(config.max_in_flight));
    let mut consumers = JoinSet::new();

    for channel in Channel::CONSUMED {
        let filter_subject = channel.subject(&config.subject_prefix);
        let consumer_name = format!("iotv-{}", channel.as_str().replace('.', "-"));
        let consumer: jetstream::consumer::Consumer<PushConfig> = stream
            .get_or_create_consumer(
                &consumer_name,
                PushConfig {
                    durable_name: Some(consumer_name.clone()),
                    deliver_subject: format!("deliver.{}.{consumer_name}", config.stream),
                    deliver_group: Some(channel.consumer_group().to_string()),
                    filter_subject: filter_subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: config.ack_wait,
                    max_deliver: config.max_deliver,
                    max_ack_pending: config.max_in_flight as i64,
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("declare consumer {consumer_name}"))?;
        let messages = consumer
            .messages()
            .await
            .with_context(|| format!("subscribe consumer {consumer_name}"))?;

        info!(
            stream = %config.stream,
            consumer = %consumer_name,
            subject = %filter_subject,
            group = channel.consumer_group(),
            "dispatcher listening"
        );
        consumers.spawn(consume(
            channel,
            messages,
            Arc::clone(&dispatcher),
            Arc::clone(&permits),
            shutdown_rx.clone(),
        ));
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "failed to listen for ctrl-c; shutting down");
            }
            info!("shutdown requested");
        }
        Some(finished) = consumers.join_next() => {
            warn!(result = ?finished, "consumer loop exited; shutting down");
        }
    }

    shutdown_tx.send(true).ok();
    while consumers.join_next().await.is_some() {}

    // In-flight dispatches each hold a permit; taking all of them waits for the last one.
    let all_permits =
        u32::try_from(config.max_in_flight).context("BUS_MAX_IN_FLIGHT exceeds u32")?;
    let _drained = permits
        .acquire_many(all_permits)
        .await
        .context("drain in-flight dispatches")?;
    client.flush().await.context("flush NATS connection")?;
    info!("dispatcher stopped");
    Ok(())
}

async fn consume(
    channel: Channel,
    messages: Messages,
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
) {
    pump(messages, permits, shutdown, move |next| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let message = match next {
                Ok(message) => message,
                Err(err) => {
                    warn!(%channel, error = %err, "failed to receive delivery");
                    return;
                }
            };
            let delivery = BusMessage::new(channel, message.payload.clone());
            match dispatcher.handle_message(&delivery).await {
                Ok(outcome) => {
                    debug!(%channel, ?outcome, "delivery handled");
                    if let Err(err) = message.ack().await {
                        warn!(%channel, error = %err, "failed to ack delivery");
                    }
                }
                Err(err) => {
                    error!(%channel, error = %err, "requesting redelivery");
                    if let Err(err) = message.ack_with(AckKind::Nak(None)).await {
                        warn!(%channel, error = %err, "failed to nak delivery");
                    }
                }
            }
        }
    })
    .await;
    debug!(%channel, "consumer loop stopped");
}

/// Runs `handle` for every item of `incoming` on its own task.
///
/// The permit is taken after an item has arrived, so a quiet source holds none of the shared
/// budget while it waits.
async fn pump<S, F, Fut>(
    mut incoming: S,
    permits: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
    handle: F,
) where
    S: Stream + Unpin,
    F: Fn(S::Item) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let item = tokio::select! {
            _ = shutdown.changed() => break,
            next = incoming.next() => match next {
                Some(item) => item,
                None => break,
            },
        };
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let task = handle(item);
        tokio::spawn(async move {
            let _permit = permit;
            task.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn quiet_channel_does_not_hold_the_only_permit() {
        let permits = Arc::new(Semaphore::new(1));
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let quiet = tokio::spawn(pump(
            stream::pending::<u32>(),
            Arc::clone(&permits),
            shutdown.clone(),
            |_| async {},
        ));
        tokio::task::yield_now().await;

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let busy = pump(
            stream::iter(1..=3u32),
            Arc::clone(&permits),
            shutdown,
            move |n| {
                let done = done_tx.clone();
                async move {
                    done.send(n).ok();
                }
            },
        );
        tokio::time::timeout(Duration::from_secs(1), busy)
            .await
            .expect("busy channel should be served");

        let mut seen = Vec::new();
        for _ in 0..3 {
            let n = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
                .await
                .expect("delivery should be handled")
                .expect("sender alive");
            seen.push(n);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
        quiet.abort();
    }

    #[tokio::test]
    async fn shutdown_stops_pulling() {
        let permits = Arc::new(Semaphore::new(4));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let loop_task = tokio::spawn(pump(
            stream::pending::<u32>(),
            Arc::clone(&permits),
            shutdown,
            |_| async {},
        ));
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), loop_task)
            .await
            .expect("loop should stop on shutdown")
            .unwrap();
        assert_eq!(permits.available_permits(), 4);
    }
}
