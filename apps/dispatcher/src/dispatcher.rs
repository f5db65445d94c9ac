use bytes::Bytes;
use iotv_bus::{BusError, SharedBusClient};
use iotv_core::{
    AgentAdapter, AgentError, AgentRequest, Channel, Envelope, EnvelopeError, LlmResult, LlmTask,
    MessageKind, Payload, PayloadError, SettingsError, SettingsResolver, TtsRequest,
};
use iotv_idempotency::{IdKey, IdempotencyGuard};
use iotv_telemetry::{MessageLabels, record_counter, record_histogram};
use tokio::time::Instant;
use tracing::{Span, error, info, instrument, warn};

/// One delivery taken off a consumed channel.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: Channel,
    pub group: &'static str,
    pub body: Bytes,
}

impl BusMessage {
    pub fn new(channel: Channel, body: impl Into<Bytes>) -> Self {
        Self {
            channel,
            group: channel.consumer_group(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Unroutable(String),
    /// Partial `llm.result`; only the final one triggers synthesis.
    NotFinal,
    /// Pass-through onto the channel it was consumed from.
    Loopback,
    Duplicate,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Unroutable(_) => "unroutable",
            DropReason::NotFinal => "not_final",
            DropReason::Loopback => "loopback",
            DropReason::Duplicate => "duplicate",
        }
    }
}

/// Terminal action taken for one inbound message. Both variants mean "ack".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Forwarded { channel: Channel, kind: MessageKind },
    Dropped(DropReason),
}

/// Failures that should make the bus redeliver the inbound message.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("tts settings resolution failed: {0}")]
    Resolution(#[from] SettingsError),
    #[error("agent invocation failed: {0}")]
    AgentInvocation(#[from] AgentError),
    #[error("publish failed: {0}")]
    Publish(#[from] BusError),
    #[error(transparent)]
    Encode(#[from] EnvelopeError),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Resolution(_) => "resolution",
            DispatchError::AgentInvocation(_) => "agent_invocation",
            DispatchError::Publish(_) => "publish",
            DispatchError::Encode(_) => "encode",
        }
    }
}

enum Step {
    Forward(Channel, Envelope),
    Drop(DropReason),
}

/// Per-message routing state machine. Holds no per-message state; share it behind an `Arc`.
#[derive(Clone)]
pub struct Dispatcher {
    bus: SharedBusClient,
    resolver: SettingsResolver,
    agent: AgentAdapter,
    subject_prefix: String,
    idempotency: Option<IdempotencyGuard>,
}

impl Dispatcher {
    pub fn new(bus: SharedBusClient, resolver: SettingsResolver, agent: AgentAdapter) -> Self {
        Self {
            bus,
            resolver,
            agent,
            subject_prefix: String::new(),
            idempotency: None,
        }
    }

    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = prefix.into();
        self
    }

    pub fn with_idempotency(mut self, guard: IdempotencyGuard) -> Self {
        self.idempotency = Some(guard);
        self
    }

    /// Classifies one delivery and emits at most one outbound envelope.
    ///
    /// `Ok` means the delivery can be acked, whether or not anything was forwarded. `Err` is
    /// returned only for failures a redelivery might fix.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(
            channel = %msg.channel,
            group = msg.group,
            message_id = tracing::field::Empty,
            device_id = tracing::field::Empty,
            r#type = tracing::field::Empty,
            tts_source = tracing::field::Empty,
        )
    )]
    pub async fn handle_message(&self, msg: &BusMessage) -> Result<Outcome, DispatchError> {
        let result = self.dispatch(msg).await;
        let labels = MessageLabels::new(msg.channel.as_str());
        match &result {
            Ok(Outcome::Forwarded { channel, kind }) => record_counter(
                "iotv_dispatch_forwarded",
                1,
                &MessageLabels::new(channel.as_str()).with_type(kind.as_str()),
            ),
            Ok(Outcome::Dropped(reason)) => record_counter(
                "iotv_dispatch_dropped",
                1,
                &labels.with_extra("reason", reason.as_str()),
            ),
            Err(err) => {
                record_counter(
                    "iotv_dispatch_failed",
                    1,
                    &labels.with_extra("kind", err.kind()),
                );
                error!(error = %err, "dispatch failed");
            }
        }
        result
    }

    async fn dispatch(&self, msg: &BusMessage) -> Result<Outcome, DispatchError> {
        let env = match Envelope::decode(&msg.body) {
            Ok(env) => env,
            Err(err) => {
                warn!(error = %err, "dropping malformed envelope");
                return Ok(Outcome::Dropped(DropReason::Malformed));
            }
        };
        iotv_telemetry::with_message_fields(
            &Span::current(),
            &env.message_id,
            &env.device_id,
            &env.msg_type,
        );

        let dedup = match &self.idempotency {
            Some(guard) if !env.message_id.is_empty() => Some((
                guard,
                IdKey::new(msg.channel.as_str(), &env.msg_type, &env.message_id),
            )),
            _ => None,
        };
        if let Some((guard, key)) = &dedup
            && guard.is_duplicate(key).await
        {
            return Ok(Outcome::Dropped(DropReason::Duplicate));
        }

        let (channel, next) = match self.route(msg.channel, &env).await? {
            Step::Forward(channel, next) => (channel, next),
            Step::Drop(reason) => return Ok(Outcome::Dropped(reason)),
        };

        let subject = channel.subject(&self.subject_prefix);
        let body = next.encode()?;
        self.bus.publish(&subject, Bytes::from(body)).await?;
        if let Some((guard, key)) = &dedup {
            guard.mark_processed(key).await;
        }

        info!(%subject, next_type = %next.msg_type, "forwarded envelope");
        Ok(Outcome::Forwarded {
            channel,
            kind: next.kind(),
        })
    }

    async fn route(&self, consumed_from: Channel, env: &Envelope) -> Result<Step, DispatchError> {
        let payload = match env.payload() {
            Ok(payload) => payload,
            Err(PayloadError::Unroutable(tag)) => {
                warn!(r#type = %tag, "no route for message type");
                return Ok(Step::Drop(DropReason::Unroutable(tag)));
            }
            Err(err) => {
                warn!(error = %err, "dropping envelope with mismatched payload");
                return Ok(Step::Drop(DropReason::Malformed));
            }
        };

        let step = match payload {
            Payload::DeviceEvent(_) | Payload::AsrText(_) => Step::Forward(
                Channel::LlmTasks,
                env.forward_as(MessageKind::LlmRequest),
            ),
            Payload::LlmRequest(_) if consumed_from == Channel::LlmTasks => {
                warn!("llm.request consumed from the task channel; not re-forwarding");
                Step::Drop(DropReason::Loopback)
            }
            Payload::LlmRequest(_) => Step::Forward(
                Channel::LlmTasks,
                env.forward_as(MessageKind::LlmRequest),
            ),
            Payload::LlmTask(task) => self.run_task(env, task).await?,
            Payload::LlmResult(result) if !result.is_final => Step::Drop(DropReason::NotFinal),
            Payload::LlmResult(result) => self.request_speech(env, result).await?,
            Payload::TtsResult(_) => Step::Forward(
                Channel::DeviceOutbound,
                env.forward_as(MessageKind::TtsResult),
            ),
            Payload::TtsRequest(_) => {
                warn!(r#type = %env.msg_type, "no route for message type");
                Step::Drop(DropReason::Unroutable(env.msg_type.clone()))
            }
        };
        Ok(step)
    }

    async fn run_task(&self, env: &Envelope, task: LlmTask) -> Result<Step, DispatchError> {
        let request = match AgentRequest::from_task(env, &task) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "dropping llm.task with unusable agent id");
                return Ok(Step::Drop(DropReason::Malformed));
            }
        };

        let started = Instant::now();
        let reply = self.agent.run(request).await;
        let labels = MessageLabels::new(Channel::LlmTasks.as_str());
        record_histogram(
            "iotv_agent_latency_ms",
            started.elapsed().as_secs_f64() * 1000.0,
            &labels,
        );
        let reply = reply?;

        let mut properties = task.properties;
        if let Some(cause) = reply.interrupted {
            record_counter("iotv_agent_degraded", 1, &labels);
            warn!(error = %cause, "forwarding degraded agent reply");
            properties.insert("degraded".into(), "true".into());
            properties.insert("agent_error".into(), cause);
        }

        let result = LlmResult {
            text: reply.text,
            is_final: true,
            trace_ctx: task.trace_ctx,
            properties,
        };
        Ok(Step::Forward(
            Channel::LlmTasks,
            env.derive(Payload::LlmResult(result))?,
        ))
    }

    async fn request_speech(
        &self,
        env: &Envelope,
        result: LlmResult,
    ) -> Result<Step, DispatchError> {
        let tts = self.resolver.resolve(&env.device_id, env.app_id()).await?;
        Span::current().record("tts_source", tts.source.as_str());
        info!(
            provider = %tts.provider,
            model = %tts.model,
            voice = %tts.voice,
            source = %tts.source,
            "resolved tts settings"
        );

        let request = TtsRequest {
            text: result.text,
            provider: Some(tts.provider),
            model: Some(tts.model),
            voice: Some(tts.voice),
        };
        Ok(Step::Forward(
            Channel::TtsTasks,
            env.derive(Payload::TtsRequest(request))?,
        ))
    }
}
