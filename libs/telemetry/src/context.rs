use tracing::Span;

/// Low-cardinality labels attached to relay metrics.
///
/// Device and message ids never go here; they belong on log spans via [`with_message_fields`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLabels {
    pub channel: String,
    pub msg_type: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl MessageLabels {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, msg_type: impl Into<String>) -> Self {
        self.msg_type = Some(msg_type.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(2 + self.extra.len());
        tags.push(("channel".into(), self.channel.clone()));
        if let Some(msg_type) = &self.msg_type {
            tags.push(("type".into(), msg_type.clone()));
        }
        tags.extend(self.extra.iter().cloned());
        tags
    }
}

/// Fills the standard message fields on a span that declared them as `Empty`.
pub fn with_message_fields(span: &Span, message_id: &str, device_id: &str, msg_type: &str) {
    span.record("message_id", tracing::field::display(message_id));
    span.record("device_id", tracing::field::display(device_id));
    span.record("type", tracing::field::display(msg_type));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_skip_unknown_type() {
        let labels = MessageLabels::new("llm.results").with_extra("reason", "malformed");
        assert_eq!(
            labels.tags(),
            vec![
                ("channel".to_string(), "llm.results".to_string()),
                ("reason".to_string(), "malformed".to_string()),
            ]
        );

        let labels = MessageLabels::new("tts.tasks").with_type("tts.request");
        assert_eq!(labels.tags()[1], ("type".to_string(), "tts.request".to_string()));
    }

    #[test]
    #[tracing_test::traced_test]
    fn message_fields_show_up_in_span_output() {
        let span = tracing::info_span!(
            "dispatch",
            message_id = tracing::field::Empty,
            device_id = tracing::field::Empty,
            r#type = tracing::field::Empty,
        );
        with_message_fields(&span, "m1", "d1", "asr.text");
        span.in_scope(|| tracing::info!("routed"));
        assert!(logs_contain("message_id=m1"));
        assert!(logs_contain("device_id=d1"));
    }
}
