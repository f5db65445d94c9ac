use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use iotv_core::{AnswerSelection, FailurePolicy};
use iotv_idempotency::IdempotencyConfig;

pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
pub const DEFAULT_STREAM: &str = "IOTV";
/// Upper bound for `BUS_MAX_IN_FLIGHT`; also the largest `max_ack_pending` handed to the bus.
pub const MAX_IN_FLIGHT_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub nats_url: String,
    pub subject_prefix: String,
    pub stream: String,
    pub max_in_flight: usize,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub agent: AgentConfig,
    pub settings_db: Option<PathBuf>,
    pub idempotency: IdempotencyConfig,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent runtime endpoint. Without one the dispatcher echoes the user's input.
    pub http_url: Option<String>,
    pub api_key: Option<String>,
    pub failure_policy: FailurePolicy,
    pub answer_selection: AnswerSelection,
    pub timeout: Option<Duration>,
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let agent = AgentConfig {
            http_url: var("AGENT_HTTP_URL"),
            api_key: var("AGENT_API_KEY"),
            failure_policy: match var("AGENT_FAILURE_POLICY") {
                Some(raw) => parse_policy(&raw).context("AGENT_FAILURE_POLICY")?,
                None => FailurePolicy::default(),
            },
            answer_selection: match var("AGENT_ANSWER_SELECTION") {
                Some(raw) => parse_selection(&raw).context("AGENT_ANSWER_SELECTION")?,
                None => AnswerSelection::default(),
            },
            timeout: parse_opt::<u64>(var("AGENT_TIMEOUT_SECS"), "AGENT_TIMEOUT_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        };

        let max_in_flight =
            parse_opt::<usize>(var("BUS_MAX_IN_FLIGHT"), "BUS_MAX_IN_FLIGHT")?.unwrap_or(64);
        if !(1..=MAX_IN_FLIGHT_LIMIT).contains(&max_in_flight) {
            return Err(anyhow!(
                "BUS_MAX_IN_FLIGHT must be between 1 and {MAX_IN_FLIGHT_LIMIT}, got {max_in_flight}"
            ));
        }

        Ok(Self {
            nats_url: var("NATS_URL").unwrap_or_else(|| DEFAULT_NATS_URL.into()),
            subject_prefix: var("BUS_SUBJECT_PREFIX").unwrap_or_default(),
            stream: var("BUS_STREAM").unwrap_or_else(|| DEFAULT_STREAM.into()),
            max_in_flight,
            ack_wait: Duration::from_secs(
                parse_opt::<u64>(var("BUS_ACK_WAIT_SECS"), "BUS_ACK_WAIT_SECS")?.unwrap_or(120),
            ),
            max_deliver: parse_opt::<i64>(var("BUS_MAX_DELIVER"), "BUS_MAX_DELIVER")?
                .unwrap_or(5),
            agent,
            settings_db: var("SETTINGS_DB_PATH").map(PathBuf::from),
            idempotency: IdempotencyConfig::from_lookup(&lookup)
                .context("IDEMPOTENCY_BACKEND")?,
        })
    }
}

fn parse_opt<T>(raw: Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(|value| {
        value
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid {key}: {value}"))
    })
    .transpose()
}

fn parse_policy(raw: &str) -> Result<FailurePolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "degrade" => Ok(FailurePolicy::Degrade),
        "fail_closed" | "fail-closed" | "strict" => Ok(FailurePolicy::FailClosed),
        other => Err(anyhow!("unknown failure policy `{other}`")),
    }
}

fn parse_selection(raw: &str) -> Result<AnswerSelection> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "last" => Ok(AnswerSelection::Last),
        "first" => Ok(AnswerSelection::First),
        "concat" | "concatenate" => Ok(AnswerSelection::Concatenate),
        other => Err(anyhow!("unknown answer selection `{other}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotv_idempotency::IdempotencyBackend;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<DispatcherConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DispatcherConfig::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_target_local_nats() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.nats_url, DEFAULT_NATS_URL);
        assert_eq!(cfg.stream, "IOTV");
        assert_eq!(cfg.subject_prefix, "");
        assert_eq!(cfg.max_in_flight, 64);
        assert_eq!(cfg.ack_wait, Duration::from_secs(120));
        assert_eq!(cfg.max_deliver, 5);
        assert_eq!(cfg.agent.failure_policy, FailurePolicy::Degrade);
        assert_eq!(cfg.agent.answer_selection, AnswerSelection::Last);
        assert!(cfg.agent.http_url.is_none());
        assert!(cfg.agent.timeout.is_none());
        assert!(cfg.settings_db.is_none());
        assert_eq!(cfg.idempotency.backend, IdempotencyBackend::Memory);
    }

    #[test]
    fn reads_overrides() {
        let cfg = config(&[
            ("NATS_URL", "nats://bus:4222"),
            ("BUS_SUBJECT_PREFIX", "prod"),
            ("BUS_MAX_IN_FLIGHT", "8"),
            ("AGENT_HTTP_URL", "http://agent/invoke"),
            ("AGENT_API_KEY", "k"),
            ("AGENT_FAILURE_POLICY", "fail_closed"),
            ("AGENT_ANSWER_SELECTION", "concat"),
            ("AGENT_TIMEOUT_SECS", "30"),
            ("SETTINGS_DB_PATH", "/var/lib/iotv/settings.db"),
            ("IDEMPOTENCY_BACKEND", "off"),
        ])
        .unwrap();
        assert_eq!(cfg.nats_url, "nats://bus:4222");
        assert_eq!(cfg.subject_prefix, "prod");
        assert_eq!(cfg.max_in_flight, 8);
        assert_eq!(cfg.agent.http_url.as_deref(), Some("http://agent/invoke"));
        assert_eq!(cfg.agent.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(cfg.agent.answer_selection, AnswerSelection::Concatenate);
        assert_eq!(cfg.agent.timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            cfg.settings_db,
            Some(PathBuf::from("/var/lib/iotv/settings.db"))
        );
        assert_eq!(cfg.idempotency.backend, IdempotencyBackend::Off);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = config(&[("BUS_MAX_DELIVER", "lots")]).unwrap_err();
        assert!(err.to_string().contains("BUS_MAX_DELIVER"));

        let err = config(&[("AGENT_FAILURE_POLICY", "retry")]).unwrap_err();
        assert!(format!("{err:#}").contains("AGENT_FAILURE_POLICY"));

        assert!(config(&[("BUS_MAX_IN_FLIGHT", "0")]).is_err());
        let err = config(&[("BUS_MAX_IN_FLIGHT", "18446744073709551615")]).unwrap_err();
        assert!(err.to_string().contains("BUS_MAX_IN_FLIGHT"));
        assert_eq!(
            config(&[("BUS_MAX_IN_FLIGHT", "10000")])
                .unwrap()
                .max_in_flight,
            MAX_IN_FLIGHT_LIMIT
        );
        assert!(config(&[("IDEMPOTENCY_BACKEND", "redis")]).is_err());
    }
}
