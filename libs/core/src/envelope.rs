//! Wire envelope exchanged with devices, the agent task queue and the synthesis workers.
//!
//! The envelope is JSON with a string `type` tag and a `payload` whose shape depends on that
//! tag. The payload stays opaque until [`Envelope::payload`] is called; that call classifies
//! the tag first and only then decodes the single shape the tag selects.
//!
//! The contract is shared with device firmware and must stay additive-only: unknown top-level
//! fields are kept in [`Envelope::extra`] and re-emitted on every derived copy.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::payload::{LlmRequest, LlmResult, LlmTask, Payload, PayloadError, TtsRequest, TtsResult};

/// Dispatch tag carried in the envelope `type` field.
///
/// ```
/// use iotv_core::MessageKind;
///
/// assert_eq!(MessageKind::parse("llm.result"), MessageKind::LlmResult);
/// assert_eq!(MessageKind::parse("ota.progress").as_str(), "ota.progress");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    DeviceEvent,
    AsrText,
    LlmRequest,
    LlmTask,
    LlmResult,
    TtsRequest,
    TtsResult,
    /// Any tag this relay does not route. Still a valid wire object.
    Other(String),
}

impl MessageKind {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "device.event" => MessageKind::DeviceEvent,
            "asr.text" => MessageKind::AsrText,
            "llm.request" => MessageKind::LlmRequest,
            "llm.task" => MessageKind::LlmTask,
            "llm.result" => MessageKind::LlmResult,
            "tts.request" => MessageKind::TtsRequest,
            "tts.result" => MessageKind::TtsResult,
            other => MessageKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::DeviceEvent => "device.event",
            MessageKind::AsrText => "asr.text",
            MessageKind::LlmRequest => "llm.request",
            MessageKind::LlmTask => "llm.task",
            MessageKind::LlmResult => "llm.result",
            MessageKind::TtsRequest => "tts.request",
            MessageKind::TtsResult => "tts.result",
            MessageKind::Other(tag) => tag.as_str(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Unit of transport on every bus channel.
///
/// ```
/// use iotv_core::{Envelope, MessageKind};
///
/// let env = Envelope::decode(br#"{"message_id":"m1","type":"device.event","device_id":"d1","payload":{"button":1}}"#).unwrap();
/// assert_eq!(env.kind(), MessageKind::DeviceEvent);
/// assert_eq!(env.app_id(), None);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default, deserialize_with = "null_as_default")]
    pub message_id: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub msg_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub device_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub space_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub app_id: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub user_id: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub session_id: String,
    /// Milliseconds since the unix epoch, stamped by whoever emitted this copy.
    #[serde(default, deserialize_with = "null_as_default")]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(default)]
    pub payload: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Envelope {
    /// Builds a fresh envelope stamped with the current time.
    pub fn new(message_id: impl Into<String>, kind: MessageKind, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            msg_type: kind.as_str().to_string(),
            device_id: String::new(),
            space_id: String::new(),
            app_id: String::new(),
            user_id: String::new(),
            session_id: String::new(),
            ts: now_millis(),
            streaming: None,
            seq: None,
            payload,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn with_app(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_space(mut self, space_id: impl Into<String>) -> Self {
        self.space_id = space_id.into();
        self
    }

    /// Parses wire bytes. Fails only when the outer object cannot be read or `type` is blank;
    /// unknown tags decode fine.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let env: Envelope = serde_json::from_slice(bytes)
            .map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
        if env.msg_type.trim().is_empty() {
            return Err(EnvelopeError::Malformed("missing type".into()));
        }
        Ok(env)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::parse(&self.msg_type)
    }

    pub fn app_id(&self) -> Option<&str> {
        non_empty(&self.app_id)
    }

    pub fn space_id(&self) -> Option<&str> {
        non_empty(&self.space_id)
    }

    /// Decodes the payload shape selected by `type`.
    ///
    /// Untyped tags (`device.event`, `asr.text`) hand back the raw JSON. Tags outside the routing
    /// table yield [`PayloadError::Unroutable`].
    pub fn payload(&self) -> Result<Payload, PayloadError> {
        let kind = self.kind();
        let payload = match &kind {
            MessageKind::DeviceEvent => Payload::DeviceEvent(self.payload.clone()),
            MessageKind::AsrText => Payload::AsrText(self.payload.clone()),
            MessageKind::LlmRequest => Payload::LlmRequest(self.typed::<LlmRequest>(&kind)?),
            MessageKind::LlmTask => Payload::LlmTask(self.typed::<LlmTask>(&kind)?),
            MessageKind::LlmResult => Payload::LlmResult(self.typed::<LlmResult>(&kind)?),
            MessageKind::TtsRequest => Payload::TtsRequest(self.typed::<TtsRequest>(&kind)?),
            MessageKind::TtsResult => Payload::TtsResult(self.typed::<TtsResult>(&kind)?),
            MessageKind::Other(tag) => return Err(PayloadError::Unroutable(tag.clone())),
        };
        Ok(payload)
    }

    fn typed<T: serde::de::DeserializeOwned>(&self, kind: &MessageKind) -> Result<T, PayloadError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| PayloadError::Shape {
            kind: kind.as_str().to_string(),
            source,
        })
    }

    /// Next-hop copy with a new typed payload. The `type` follows the payload variant.
    pub fn derive(&self, payload: Payload) -> Result<Envelope, EnvelopeError> {
        let (kind, value) = payload.into_parts()?;
        Ok(self.derive_raw(kind, value))
    }

    /// Next-hop copy that keeps the current payload verbatim under `kind`.
    pub fn forward_as(&self, kind: MessageKind) -> Envelope {
        self.derive_raw(kind, self.payload.clone())
    }

    fn derive_raw(&self, kind: MessageKind, payload: Value) -> Envelope {
        Envelope {
            message_id: self.message_id.clone(),
            msg_type: kind.as_str().to_string(),
            device_id: self.device_id.clone(),
            space_id: self.space_id.clone(),
            app_id: self.app_id.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            ts: now_millis(),
            streaming: self.streaming,
            seq: self.seq,
            payload,
            extra: self.extra.clone(),
        }
    }
}

/// Explicit `null` reads the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Current wall clock in epoch milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
