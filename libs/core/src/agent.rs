//! Conversational-agent invocation contract and reply aggregation.
//!
//! An agent call yields a finite stream of chunks. Only chunks of kind `answer` carry reply
//! text; the adapter keeps one of them (the last, unless configured otherwise) and falls back
//! to the user's own input when the stream produced no answer at all.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::payload::LlmTask;

/// Validated agent invocation, built once at the boundary from an `llm.task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Device acting as the end user.
    pub user: String,
    /// Bound agent. `None` means no agent is bound to the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<u64>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AgentRequestError {
    #[error("invalid agent id {0}")]
    InvalidAgentId(String),
}

impl AgentRequest {
    pub fn from_task(env: &Envelope, task: &LlmTask) -> Result<Self, AgentRequestError> {
        Ok(Self {
            user: env.device_id.clone(),
            agent_id: parse_agent_id(task.bot_id.as_ref())?,
            text: task.text.clone(),
            locale: task.locale.clone(),
            properties: task.properties.clone(),
        })
    }
}

/// Accepts a non-negative JSON integer or a decimal string; absent or null is unbound.
fn parse_agent_id(raw: Option<&Value>) -> Result<Option<u64>, AgentRequestError> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| AgentRequestError::InvalidAgentId(n.to_string())),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| AgentRequestError::InvalidAgentId(s.clone())),
        Some(other) => Err(AgentRequestError::InvalidAgentId(other.to_string())),
    }
}

/// Per-invocation metadata that trust/identity capabilities may decorate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationContext {
    pub headers: BTreeMap<String, String>,
}

/// Attaches identity to an invocation before it reaches the agent runtime.
pub trait InvocationAuth: Send + Sync {
    fn authorize(
        &self,
        ctx: &mut InvocationContext,
        request: &AgentRequest,
    ) -> Result<(), AgentError>;
}

/// Leaves the context untouched.
#[derive(Debug, Default, Clone)]
pub struct NoAuth;

impl InvocationAuth for NoAuth {
    fn authorize(
        &self,
        _ctx: &mut InvocationContext,
        _request: &AgentRequest,
    ) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Static API key sent as a bearer token.
#[derive(Clone)]
pub struct BearerAuth {
    token: String,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl InvocationAuth for BearerAuth {
    fn authorize(
        &self,
        ctx: &mut InvocationContext,
        _request: &AgentRequest,
    ) -> Result<(), AgentError> {
        if self.token.trim().is_empty() {
            return Err(AgentError::Unauthorized("empty api key".into()));
        }
        ctx.headers
            .insert("authorization".into(), format!("Bearer {}", self.token));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Answer,
    Thinking,
    ToolCall,
    ToolOutput,
    Verbose,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentChunk {
    pub kind: ChunkKind,
    #[serde(default)]
    pub content: String,
}

impl AgentChunk {
    pub fn answer(content: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Answer,
            content: content.into(),
        }
    }

    pub fn of(kind: ChunkKind) -> Self {
        Self {
            kind,
            content: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent submission failed: {0}")]
    Submit(#[source] anyhow::Error),
    #[error("agent stream failed: {0}")]
    Stream(#[source] anyhow::Error),
    #[error("agent invocation unauthorized: {0}")]
    Unauthorized(String),
    #[error("agent did not finish within {0:?}")]
    Timeout(Duration),
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<AgentChunk, AgentError>> + Send>>;

/// Agent runtime. Each call is independent; a stream cannot be restarted, only re-invoked.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    async fn invoke(
        &self,
        ctx: InvocationContext,
        request: AgentRequest,
    ) -> Result<ChunkStream, AgentError>;
}

pub type SharedAgentGateway = Arc<dyn AgentGateway>;

/// Which answer chunk becomes the reply when a stream carries several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnswerSelection {
    #[default]
    Last,
    First,
    Concatenate,
}

/// What to do when the agent cannot be reached or its stream breaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Forward the partial answer, or the user's input, and mark the result degraded.
    #[default]
    Degrade,
    /// Surface the error so the bus redelivers the task.
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOrigin {
    Answer,
    Fallback,
}

/// Aggregated reply from one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub origin: ReplyOrigin,
    /// Error that cut the invocation short, if any.
    pub interrupted: Option<String>,
}

impl AgentReply {
    pub fn degraded(&self) -> bool {
        self.interrupted.is_some()
    }
}

/// Drains `stream`, keeping answer chunks according to `selection`.
///
/// A transport error ends consumption early; the reply then carries whatever was gathered and
/// the error text in [`AgentReply::interrupted`].
pub async fn aggregate(
    stream: ChunkStream,
    fallback: &str,
    selection: AnswerSelection,
) -> AgentReply {
    aggregate_until(stream, fallback, selection, None).await
}

/// [`aggregate`] bounded by a deadline. Expiry stops reading and keeps the answer gathered so far.
async fn aggregate_until(
    mut stream: ChunkStream,
    fallback: &str,
    selection: AnswerSelection,
    deadline: Option<Deadline>,
) -> AgentReply {
    let mut answer: Option<String> = None;
    let mut interrupted = None;

    loop {
        let next = match deadline {
            Some(deadline) => match timeout_at(deadline.at, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let err = AgentError::Timeout(deadline.limit);
                    warn!(error = %err, "agent stream ended early");
                    interrupted = Some(err.to_string());
                    break;
                }
            },
            None => stream.next().await,
        };
        let Some(item) = next else {
            break;
        };
        match item {
            Ok(chunk) if chunk.kind == ChunkKind::Answer => {
                answer = match (selection, answer) {
                    (AnswerSelection::First, Some(first)) => Some(first),
                    (AnswerSelection::Concatenate, Some(mut acc)) => {
                        acc.push_str(&chunk.content);
                        Some(acc)
                    }
                    _ => Some(chunk.content),
                };
            }
            Ok(chunk) => debug!(kind = ?chunk.kind, "skipping non-answer chunk"),
            Err(err) => {
                warn!(error = %err, "agent stream ended early");
                interrupted = Some(err.to_string());
                break;
            }
        }
    }

    match answer.filter(|text| !text.is_empty()) {
        Some(text) => AgentReply {
            text,
            origin: ReplyOrigin::Answer,
            interrupted,
        },
        None => AgentReply {
            text: fallback.to_string(),
            origin: ReplyOrigin::Fallback,
            interrupted,
        },
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

/// Gateway plus the policies applied around every invocation.
#[derive(Clone)]
pub struct AgentAdapter {
    gateway: SharedAgentGateway,
    auth: Arc<dyn InvocationAuth>,
    selection: AnswerSelection,
    policy: FailurePolicy,
    timeout: Option<Duration>,
}

impl AgentAdapter {
    pub fn new(gateway: SharedAgentGateway) -> Self {
        Self {
            gateway,
            auth: Arc::new(NoAuth),
            selection: AnswerSelection::default(),
            policy: FailurePolicy::default(),
            timeout: None,
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn InvocationAuth>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_selection(mut self, selection: AnswerSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invokes the agent and aggregates its reply, applying the failure policy.
    pub async fn run(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        let fallback = request.text.clone();
        let deadline = self.timeout.map(|limit| Deadline {
            at: Instant::now() + limit,
            limit,
        });
        let outcome = self.invoke_and_aggregate(request, deadline).await;

        match (outcome, self.policy) {
            (Ok(reply), FailurePolicy::FailClosed) if reply.degraded() => Err(AgentError::Stream(
                anyhow::anyhow!(reply.interrupted.unwrap_or_default()),
            )),
            (Ok(reply), _) => Ok(reply),
            (Err(err), FailurePolicy::FailClosed) => Err(err),
            (Err(err), FailurePolicy::Degrade) => {
                warn!(error = %err, "agent invocation failed; replying with input text");
                Ok(AgentReply {
                    text: fallback,
                    origin: ReplyOrigin::Fallback,
                    interrupted: Some(err.to_string()),
                })
            }
        }
    }

    async fn invoke_and_aggregate(
        &self,
        request: AgentRequest,
        deadline: Option<Deadline>,
    ) -> Result<AgentReply, AgentError> {
        let mut ctx = InvocationContext::default();
        self.auth.authorize(&mut ctx, &request)?;
        let fallback = request.text.clone();
        let invocation = self.gateway.invoke(ctx, request);
        let stream = match deadline {
            Some(deadline) => timeout_at(deadline.at, invocation)
                .await
                .map_err(|_| AgentError::Timeout(deadline.limit))??,
            None => invocation.await?,
        };
        Ok(aggregate_until(stream, &fallback, self.selection, deadline).await)
    }
}
