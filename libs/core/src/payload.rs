//! Payload shapes keyed by the envelope `type`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{EnvelopeError, MessageKind};

/// Text handed to the agent task queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trace_ctx: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Agent task as it comes back off the task queue: a request plus the bound agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmTask {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trace_ctx: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Raw agent identifier; validated by `AgentRequest::from_task`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmResult {
    #[serde(default)]
    pub text: String,
    #[serde(rename = "final", default)]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trace_ctx: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Synthesis request. Empty provider/model/voice means "resolve from settings".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TtsRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// Synthesized audio, referenced by URL rather than embedded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TtsResult {
    pub audio_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trace_ctx: BTreeMap<String, String>,
}

/// Closed set of payload shapes, one per routed `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    DeviceEvent(Value),
    AsrText(Value),
    LlmRequest(LlmRequest),
    LlmTask(LlmTask),
    LlmResult(LlmResult),
    TtsRequest(TtsRequest),
    TtsResult(TtsResult),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::DeviceEvent(_) => MessageKind::DeviceEvent,
            Payload::AsrText(_) => MessageKind::AsrText,
            Payload::LlmRequest(_) => MessageKind::LlmRequest,
            Payload::LlmTask(_) => MessageKind::LlmTask,
            Payload::LlmResult(_) => MessageKind::LlmResult,
            Payload::TtsRequest(_) => MessageKind::TtsRequest,
            Payload::TtsResult(_) => MessageKind::TtsResult,
        }
    }

    pub(crate) fn into_parts(self) -> Result<(MessageKind, Value), EnvelopeError> {
        let kind = self.kind();
        let value = match self {
            Payload::DeviceEvent(value) | Payload::AsrText(value) => value,
            Payload::LlmRequest(p) => serde_json::to_value(p)?,
            Payload::LlmTask(p) => serde_json::to_value(p)?,
            Payload::LlmResult(p) => serde_json::to_value(p)?,
            Payload::TtsRequest(p) => serde_json::to_value(p)?,
            Payload::TtsResult(p) => serde_json::to_value(p)?,
        };
        Ok((kind, value))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("unroutable message type `{0}`")]
    Unroutable(String),
    #[error("payload does not match `{kind}` shape: {source}")]
    Shape {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
