// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection and Worker Configuration
//!
//! `AmqpConfig` is the accepted option surface of the transport. It deserializes with
//! `deny_unknown_fields` at every level, so an unknown key is a configuration error
//! rather than a silently ignored typo. `WorkerOptions` holds the stop controls the
//! command line layer hands to the worker.

use crate::{
    errors::ConfigError,
    exchange::ExchangeKind,
    headers::Headers,
    stop::{parse_memory_limit, StopCondition},
};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Queue arguments the broker only accepts as integers.
pub const ARGUMENTS_AS_INTEGER: [&str; 6] = [
    "x-delay",
    "x-expires",
    "x-max-length",
    "x-max-length-bytes",
    "x-max-priority",
    "x-message-ttl",
];

const DEFAULT_EXCHANGE_NAME: &str = "messages";
const DEFAULT_ROUTING_KEY_PATTERN: &str = "%s";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct AmqpConfig {
    pub host: String,
    pub port: Option<u16>,
    pub vhost: String,
    pub user: String,
    pub password: String,
    pub queue: QueueConfig,
    pub exchange: ExchangeConfig,
    /// Heartbeat in seconds
    pub heartbeat: Option<u16>,
    /// Seconds, may be fractional
    pub read_timeout: Option<f64>,
    /// Seconds, may be fractional
    pub write_timeout: Option<f64>,
    /// Seconds, may be fractional
    pub connect_timeout: Option<f64>,
    pub tls: bool,
    /// Path to the CA certificate in PEM format
    pub cacert: Option<String>,
    /// Client certificate; the connector only takes PKCS#12 identities, so a
    /// TLS configuration setting it is rejected
    pub cert: Option<String>,
    /// Client key, rejected with TLS like `cert`
    pub key: Option<String>,
    /// Peer verification is always on, only `true` is accepted with TLS
    pub verify: Option<bool>,
    pub connection_name: Option<String>,
    pub lazy: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct QueueConfig {
    pub name: Option<String>,
    pub binding_keys: Vec<String>,
    pub binding_arguments: Headers,
    pub arguments: Headers,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    pub default_publish_routing_key: String,
    pub arguments: Headers,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        AmqpConfig {
            host: "localhost".to_owned(),
            port: None,
            vhost: "/".to_owned(),
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            queue: QueueConfig::default(),
            exchange: ExchangeConfig::default(),
            heartbeat: None,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
            tls: false,
            cacert: None,
            cert: None,
            key: None,
            verify: None,
            connection_name: None,
            lazy: true,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            name: DEFAULT_EXCHANGE_NAME.to_owned(),
            kind: ExchangeKind::Direct,
            default_publish_routing_key: DEFAULT_ROUTING_KEY_PATTERN.to_owned(),
            arguments: Headers::new(),
        }
    }
}

impl AmqpConfig {
    /// Parses and validates a JSON option document.
    pub fn from_json(raw: &str) -> Result<AmqpConfig, ConfigError> {
        let cfg: AmqpConfig = serde_json::from_str(raw)
            .map_err(|err| ConfigError::InvalidOptions(err.to_string()))?;
        cfg.validated()
    }

    /// Applies defaults that depend on other options and normalizes queue arguments.
    pub fn validated(mut self) -> Result<AmqpConfig, ConfigError> {
        if self.queue.name.is_none() {
            self.queue.name = Some(self.exchange.name.clone());
        }

        self.queue.arguments = normalize_arguments(self.queue.arguments)?;

        if !self.tls {
            self.cacert = None;
            self.cert = None;
            self.key = None;
            self.verify = None;
        } else if self.cacert.as_deref().unwrap_or_default().is_empty() {
            return Err(ConfigError::MissingCaCert);
        } else if self.cert.is_some() {
            return Err(ConfigError::UnsupportedTlsOption("cert"));
        } else if self.key.is_some() {
            return Err(ConfigError::UnsupportedTlsOption("key"));
        } else if self.verify == Some(false) {
            return Err(ConfigError::UnsupportedTlsOption("verify"));
        }

        Ok(self)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 5671 } else { 5672 })
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name.as_deref().unwrap_or(&self.exchange.name)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout.and_then(seconds)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout.and_then(seconds)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout.and_then(seconds)
    }
}

fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok().filter(|d| !d.is_zero())
}

/// Coerces the integer-only queue arguments, numeric strings included.
pub fn normalize_arguments(mut arguments: Headers) -> Result<Headers, ConfigError> {
    for key in ARGUMENTS_AS_INTEGER {
        let Some(value) = arguments.get(key) else {
            continue;
        };

        let normalized = match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => n.as_i64(),
            Value::Number(n) => n.as_f64().map(|f| f as i64),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .ok()
                .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
            _ => None,
        };

        match normalized {
            Some(n) => {
                arguments.insert(key.to_owned(), Value::from(n));
            }
            None => {
                return Err(ConfigError::NonIntegerArgument {
                    key: key.to_owned(),
                    given: value.to_string(),
                })
            }
        }
    }

    Ok(arguments)
}

/// Stop controls exposed to the command line layer.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerOptions {
    /// Stop after this many received messages
    pub limit: Option<u64>,
    /// Stop after this many failed messages
    pub failure_limit: Option<u64>,
    /// Stop when resident memory exceeds this amount, e.g. `128M`
    pub memory_limit: Option<String>,
    /// Stop after running this many seconds
    pub time_limit: Option<u64>,
}

impl WorkerOptions {
    /// Builds the stop conditions described by the options.
    pub fn stop_conditions(&self) -> Result<Vec<StopCondition>, ConfigError> {
        let mut conditions = vec![];

        if let Some(limit) = self.limit {
            conditions.push(StopCondition::message_limit(limit)?);
        }

        if let Some(limit) = self.failure_limit {
            conditions.push(StopCondition::failure_limit(limit)?);
        }

        if let Some(limit) = &self.memory_limit {
            conditions.push(StopCondition::memory_limit(parse_memory_limit(limit)?)?);
        }

        if let Some(limit) = self.time_limit {
            conditions.push(StopCondition::time_limit(Duration::from_secs(limit))?);
        }

        Ok(conditions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_queue_name_to_exchange_name() {
        let cfg = AmqpConfig::from_json(r#"{"exchange": {"name": "orders"}}"#).unwrap();

        assert_eq!(cfg.queue_name(), "orders");
        assert_eq!(cfg.exchange.default_publish_routing_key, "%s");
        assert_eq!(cfg.port(), 5672);
        assert!(cfg.lazy);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = AmqpConfig::from_json(r#"{"hostname": "x"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOptions(_)));

        let err = AmqpConfig::from_json(r#"{"queue": {"flags": 2}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOptions(_)));

        let err = AmqpConfig::from_json(r#"{"exchange": {"durable": true}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOptions(_)));
    }

    #[test]
    fn normalizes_integer_arguments() {
        let cfg = AmqpConfig::from_json(
            r#"{"queue": {"arguments": {"x-message-ttl": "5000", "x-max-length": 10, "x-queue-mode": "lazy"}}}"#,
        )
        .unwrap();

        assert_eq!(cfg.queue.arguments.get("x-message-ttl"), Some(&json!(5000)));
        assert_eq!(cfg.queue.arguments.get("x-max-length"), Some(&json!(10)));
        assert_eq!(cfg.queue.arguments.get("x-queue-mode"), Some(&json!("lazy")));
    }

    #[test]
    fn rejects_non_numeric_integer_argument() {
        let err =
            AmqpConfig::from_json(r#"{"queue": {"arguments": {"x-expires": "soon"}}}"#).unwrap_err();

        assert_eq!(
            err,
            ConfigError::NonIntegerArgument {
                key: "x-expires".to_owned(),
                given: "\"soon\"".to_owned()
            }
        );
    }

    #[test]
    fn tls_requires_ca_certificate() {
        let err = AmqpConfig::from_json(r#"{"tls": true}"#).unwrap_err();
        assert_eq!(err, ConfigError::MissingCaCert);

        let cfg = AmqpConfig::from_json(r#"{"tls": true, "cacert": "/etc/ca.pem"}"#).unwrap();
        assert_eq!(cfg.port(), 5671);
    }

    #[test]
    fn rejects_tls_options_the_connector_cannot_honour() {
        let err = AmqpConfig::from_json(
            r#"{"tls": true, "cacert": "/etc/ca.pem", "cert": "/etc/client.pem", "key": "/etc/client.key"}"#,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::UnsupportedTlsOption("cert"));

        let err = AmqpConfig::from_json(r#"{"tls": true, "cacert": "/etc/ca.pem", "verify": false}"#)
            .unwrap_err();
        assert_eq!(err, ConfigError::UnsupportedTlsOption("verify"));

        let cfg = AmqpConfig::from_json(r#"{"tls": true, "cacert": "/etc/ca.pem", "verify": true}"#)
            .unwrap();
        assert_eq!(cfg.verify, Some(true));
    }

    #[test]
    fn drops_tls_material_without_tls() {
        let cfg = AmqpConfig::from_json(r#"{"cacert": "/etc/ca.pem", "verify": false}"#).unwrap();

        assert_eq!(cfg.cacert, None);
        assert_eq!(cfg.verify, None);
    }

    #[test]
    fn worker_options_build_conditions() {
        let options = WorkerOptions {
            limit: Some(10),
            failure_limit: Some(2),
            memory_limit: Some("128M".to_owned()),
            time_limit: Some(60),
        };

        assert_eq!(options.stop_conditions().unwrap().len(), 4);

        let invalid = WorkerOptions {
            limit: Some(0),
            ..WorkerOptions::default()
        };
        assert_eq!(
            invalid.stop_conditions().unwrap_err(),
            ConfigError::NonPositiveLimit("limit")
        );
    }
}
