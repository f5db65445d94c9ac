//! Logical bus channels and the consumer groups that read them.

use std::borrow::Cow;
use std::fmt;

pub const GROUP_IOT: &str = "iot";
pub const GROUP_LLM: &str = "llm";
pub const GROUP_TTS: &str = "tts";

/// Normalizes a subject prefix (trim, strip wildcard and separator characters).
fn norm<S: AsRef<str>>(s: S) -> Cow<'static, str> {
    let t = s
        .as_ref()
        .trim()
        .trim_matches('.')
        .replace([' ', '\t', '\n', '\r', '*', '>', '/'], "-");
    Cow::Owned(t)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    DeviceInbound,
    LlmTasks,
    LlmResults,
    TtsTasks,
    TtsResults,
    DeviceOutbound,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::DeviceInbound,
        Channel::LlmTasks,
        Channel::LlmResults,
        Channel::TtsTasks,
        Channel::TtsResults,
        Channel::DeviceOutbound,
    ];

    /// Channels this relay subscribes to.
    pub const CONSUMED: [Channel; 4] = [
        Channel::DeviceInbound,
        Channel::LlmTasks,
        Channel::LlmResults,
        Channel::TtsResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::DeviceInbound => "device.inbound",
            Channel::LlmTasks => "llm.tasks",
            Channel::LlmResults => "llm.results",
            Channel::TtsTasks => "tts.tasks",
            Channel::TtsResults => "tts.results",
            Channel::DeviceOutbound => "device.outbound",
        }
    }

    /// Consumer group identity; services in one group share the work of a channel.
    pub fn consumer_group(&self) -> &'static str {
        match self {
            Channel::DeviceInbound | Channel::DeviceOutbound => GROUP_IOT,
            Channel::LlmTasks | Channel::LlmResults => GROUP_LLM,
            Channel::TtsTasks | Channel::TtsResults => GROUP_TTS,
        }
    }

    /// Bus subject for this channel under an optional deployment prefix.
    ///
    /// ```
    /// use iotv_core::Channel;
    ///
    /// assert_eq!(Channel::TtsTasks.subject(""), "tts.tasks");
    /// assert_eq!(Channel::TtsTasks.subject(" prod.eu. "), "prod.eu.tts.tasks");
    /// ```
    pub fn subject(&self, prefix: &str) -> String {
        let prefix = norm(prefix);
        if prefix.is_empty() {
            self.as_str().to_string()
        } else {
            format!("{prefix}.{}", self.as_str())
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
