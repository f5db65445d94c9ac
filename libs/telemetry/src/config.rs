use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryProtocol {
    Grpc,
    HttpProtobuf,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub endpoint: String,
    pub protocol: TelemetryProtocol,
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub json_logs: bool,
    pub enabled: bool,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str, default_service_version: &str) -> Self {
        Self::from_lookup(default_service_name, default_service_version, |key| {
            env::var(key).ok()
        })
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(
        default_service_name: &str,
        default_service_version: &str,
        lookup: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_default();
        let protocol = match lookup("OTEL_EXPORTER_OTLP_PROTOCOL")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            Some("http") | Some("http/protobuf") => TelemetryProtocol::HttpProtobuf,
            _ => TelemetryProtocol::Grpc,
        };
        let service_name =
            lookup("OTEL_SERVICE_NAME").unwrap_or_else(|| default_service_name.to_string());
        let service_version = lookup("OTEL_SERVICE_VERSION")
            .unwrap_or_else(|| default_service_version.to_string());
        let environment = lookup("OTEL_RESOURCE_ATTRIBUTES")
            .and_then(parse_environment_from_resource)
            .or_else(|| lookup("DEPLOYMENT_ENV"))
            .unwrap_or_else(|| "dev".into());
        let json_logs = lookup("LOG_FORMAT")
            .map(|v| !matches!(v.to_lowercase().as_str(), "text" | "pretty" | "plain"))
            .unwrap_or(true);
        let enabled = lookup("ENABLE_OTEL")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Self {
            endpoint,
            protocol,
            service_name,
            service_version,
            environment,
            json_logs,
            enabled,
        }
    }

    pub fn exporter_enabled(&self) -> bool {
        self.enabled && !self.endpoint.trim().is_empty()
    }
}

fn parse_environment_from_resource(value: String) -> Option<String> {
    value.split(',').find_map(|kv| {
        let (key, val) = kv.split_once('=')?;
        (key.trim() == "deployment.environment").then(|| val.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_json_logs_without_exporters() {
        let cfg = TelemetryConfig::from_lookup("iotv-dispatcher", "0.1.0", lookup(&[]));
        assert_eq!(cfg.service_name, "iotv-dispatcher");
        assert_eq!(cfg.environment, "dev");
        assert!(cfg.json_logs);
        assert!(!cfg.exporter_enabled());
    }

    #[test]
    fn exporter_needs_flag_and_endpoint() {
        let cfg = TelemetryConfig::from_lookup(
            "svc",
            "1",
            lookup(&[("ENABLE_OTEL", "true"), ("LOG_FORMAT", "text")]),
        );
        assert!(!cfg.exporter_enabled());
        assert!(!cfg.json_logs);

        let cfg = TelemetryConfig::from_lookup(
            "svc",
            "1",
            lookup(&[
                ("ENABLE_OTEL", "on"),
                ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4318"),
                ("OTEL_EXPORTER_OTLP_PROTOCOL", "http/protobuf"),
                (
                    "OTEL_RESOURCE_ATTRIBUTES",
                    "service.team=voice,deployment.environment=staging",
                ),
            ]),
        );
        assert!(cfg.exporter_enabled());
        assert_eq!(cfg.protocol, TelemetryProtocol::HttpProtobuf);
        assert_eq!(cfg.environment, "staging");
    }
}
