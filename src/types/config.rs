//! Configuration types loaded from the process environment.

use std::str::FromStr;
use std::time::Duration;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use jsonwebtoken::Algorithm;
use uuid::Uuid;

use crate::messaging::{CommitMode, DeliveryMode};
use crate::{DEFAULT_DELIVERY_TIMEOUT_MS, DEFAULT_POLL_TIMEOUT_MS};

/// URL-safe base64 that accepts keys with or without trailing padding.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn optional(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Identity of the application publishing events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    /// Application name, used as JWT issuer and topic prefix
    pub name: String,

    /// Application version
    pub version: String,
}

impl AppIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Load from `APP_NAME` and `APP_VERSION`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            name: required("APP_NAME")?,
            version: optional("APP_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        })
    }
}

/// How consumer processes share the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerGroup {
    /// Every daemon joins the same group and partitions are balanced
    /// between them.
    Shared(String),

    /// Every daemon gets its own random group and sees every message.
    Broadcast { prefix: String },
}

impl ConsumerGroup {
    /// Resolve the group id handed to the broker. Broadcast groups get a
    /// fresh id on every call.
    pub fn resolve(&self) -> String {
        match self {
            Self::Shared(id) => id.clone(),
            Self::Broadcast { prefix } => format!("{}-{}", prefix, Uuid::new_v4().simple()),
        }
    }

    fn from_env(default_id: &str) -> Result<Self, ConfigError> {
        let id = optional("KAFKA_GROUP_ID").unwrap_or_else(|| default_id.to_string());
        match optional("KAFKA_GROUP_MODE").as_deref().map(str::trim) {
            None | Some("shared") => Ok(Self::Shared(id)),
            Some("broadcast") => Ok(Self::Broadcast { prefix: id }),
            Some(other) => Err(ConfigError::Invalid {
                key: "KAFKA_GROUP_MODE",
                reason: format!("expected `shared` or `broadcast`, got `{}`", other),
            }),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker addresses
    pub brokers: Vec<String>,

    /// Consumer group identity
    pub group: ConsumerGroup,

    /// Whether produce waits for broker acknowledgement
    pub delivery_mode: DeliveryMode,

    /// Upper bound on a single delivery
    pub delivery_timeout: Duration,

    /// Upper bound on a single consumer poll
    pub poll_timeout: Duration,

    /// Offset commit mode used by the daemon
    pub commit_mode: CommitMode,

    /// Topic used by `enqueue_event`
    pub events_topic: String,
}

impl BrokerConfig {
    /// Config with defaults for everything except the broker list.
    pub fn new(brokers: Vec<String>, app_name: &str) -> Self {
        Self {
            brokers,
            group: ConsumerGroup::Shared(app_name.to_string()),
            delivery_mode: DeliveryMode::Sync,
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            commit_mode: CommitMode::Async,
            events_topic: format!("{}:events", app_name),
        }
    }

    /// Load from `KAFKA_*` environment variables.
    pub fn from_env(identity: &AppIdentity) -> Result<Self, ConfigError> {
        let brokers: Vec<String> = required("KAFKA_URL")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if brokers.is_empty() {
            return Err(ConfigError::Missing("KAFKA_URL"));
        }

        let defaults = Self::new(brokers, &identity.name);

        Ok(Self {
            group: ConsumerGroup::from_env(&identity.name)?,
            delivery_mode: parse_or("KAFKA_DELIVERY_MODE", defaults.delivery_mode)?,
            delivery_timeout: Duration::from_millis(parse_or(
                "KAFKA_DELIVERY_TIMEOUT_MS",
                DEFAULT_DELIVERY_TIMEOUT_MS,
            )?),
            poll_timeout: Duration::from_millis(parse_or(
                "KAFKA_POLL_TIMEOUT_MS",
                DEFAULT_POLL_TIMEOUT_MS,
            )?),
            commit_mode: parse_or("KAFKA_COMMIT_MODE", defaults.commit_mode)?,
            events_topic: optional("KAFKA_EVENTS_TOPIC").unwrap_or(defaults.events_topic),
            brokers: defaults.brokers,
        })
    }

    /// Broker list in the comma-separated form librdkafka expects.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// Key material for signing event envelopes.
#[derive(Clone)]
pub struct SigningConfig {
    /// Decoded PEM private key (or raw secret for HMAC algorithms)
    pub private_key: Vec<u8>,

    /// JWT signing algorithm
    pub algorithm: Algorithm,
}

impl std::fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningConfig")
            .field("private_key", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl SigningConfig {
    /// Load from `EVENT_API_JWT_PRIVATE_KEY` and `EVENT_API_JWT_ALGORITHM`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let encoded = required("EVENT_API_JWT_PRIVATE_KEY")?;
        let algorithm = required("EVENT_API_JWT_ALGORITHM")?;
        Self::from_encoded(&encoded, &algorithm)
    }

    /// Build from a URL-safe base64 key and an algorithm name such as `RS256`.
    pub fn from_encoded(encoded_key: &str, algorithm: &str) -> Result<Self, ConfigError> {
        let private_key = URL_SAFE_LENIENT
            .decode(encoded_key.trim())
            .map_err(|e| ConfigError::Invalid {
                key: "EVENT_API_JWT_PRIVATE_KEY",
                reason: e.to_string(),
            })?;

        let algorithm =
            Algorithm::from_str(algorithm.trim()).map_err(|e| ConfigError::Invalid {
                key: "EVENT_API_JWT_ALGORITHM",
                reason: e.to_string(),
            })?;

        Ok(Self {
            private_key,
            algorithm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    /// Tests that touch the process environment hold this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: &[&str] = &[
        "APP_NAME",
        "APP_VERSION",
        "KAFKA_URL",
        "KAFKA_GROUP_MODE",
        "KAFKA_GROUP_ID",
        "KAFKA_DELIVERY_MODE",
        "KAFKA_DELIVERY_TIMEOUT_MS",
        "KAFKA_POLL_TIMEOUT_MS",
        "KAFKA_COMMIT_MODE",
        "KAFKA_EVENTS_TOPIC",
        "EVENT_API_JWT_PRIVATE_KEY",
        "EVENT_API_JWT_ALGORITHM",
    ];

    /// Run `f` with exactly `vars` set among the configuration keys.
    fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
        let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        for key in KEYS {
            std::env::remove_var(key);
        }
        for (key, value) in vars {
            std::env::set_var(key, value);
        }
        let result = f();
        for key in KEYS {
            std::env::remove_var(key);
        }
        result
    }

    fn identity() -> AppIdentity {
        AppIdentity::new("peatio", "1.0.0")
    }

    #[test]
    fn test_app_identity_requires_name() {
        let err = with_env(&[], AppIdentity::from_env).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("APP_NAME")));

        let identity = with_env(&[("APP_NAME", "peatio")], AppIdentity::from_env).unwrap();
        assert_eq!(identity.name, "peatio");
        assert_eq!(identity.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_broker_config_requires_kafka_url() {
        let err = with_env(&[], || BrokerConfig::from_env(&identity())).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("KAFKA_URL")));

        let err = with_env(&[("KAFKA_URL", " , ")], || {
            BrokerConfig::from_env(&identity())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("KAFKA_URL")));
    }

    #[test]
    fn test_broker_config_from_env() {
        let config = with_env(
            &[
                ("KAFKA_URL", "k1:9092, k2:9092"),
                ("KAFKA_DELIVERY_MODE", "async"),
                ("KAFKA_POLL_TIMEOUT_MS", "250"),
                ("KAFKA_COMMIT_MODE", "SYNC"),
                ("KAFKA_EVENTS_TOPIC", "peatio.stream"),
            ],
            || BrokerConfig::from_env(&identity()),
        )
        .unwrap();

        assert_eq!(config.brokers, vec!["k1:9092", "k2:9092"]);
        assert_eq!(config.group, ConsumerGroup::Shared("peatio".into()));
        assert_eq!(config.delivery_mode, DeliveryMode::Async);
        assert_eq!(config.poll_timeout, Duration::from_millis(250));
        assert_eq!(
            config.delivery_timeout,
            Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS)
        );
        assert_eq!(config.commit_mode, CommitMode::Sync);
        assert_eq!(config.events_topic, "peatio.stream");
    }

    #[test]
    fn test_group_mode_switch() {
        let config = with_env(
            &[
                ("KAFKA_URL", "k1:9092"),
                ("KAFKA_GROUP_MODE", "broadcast"),
                ("KAFKA_GROUP_ID", "ranger"),
            ],
            || BrokerConfig::from_env(&identity()),
        )
        .unwrap();
        assert_eq!(
            config.group,
            ConsumerGroup::Broadcast {
                prefix: "ranger".into()
            }
        );

        let err = with_env(
            &[("KAFKA_URL", "k1:9092"), ("KAFKA_GROUP_MODE", "sometimes")],
            || BrokerConfig::from_env(&identity()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "KAFKA_GROUP_MODE",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_timeout_is_rejected() {
        let err = with_env(
            &[("KAFKA_URL", "k1:9092"), ("KAFKA_POLL_TIMEOUT_MS", "soon")],
            || BrokerConfig::from_env(&identity()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "KAFKA_POLL_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn test_signing_config_requires_key_and_algorithm() {
        let err = with_env(&[("EVENT_API_JWT_ALGORITHM", "RS256")], SigningConfig::from_env)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing("EVENT_API_JWT_PRIVATE_KEY")
        ));

        let err = with_env(
            &[("EVENT_API_JWT_PRIVATE_KEY", "c2VjcmV0")],
            SigningConfig::from_env,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("EVENT_API_JWT_ALGORITHM")));

        let config = with_env(
            &[
                ("EVENT_API_JWT_PRIVATE_KEY", "c2VjcmV0"),
                ("EVENT_API_JWT_ALGORITHM", "HS256"),
            ],
            SigningConfig::from_env,
        )
        .unwrap();
        assert_eq!(config.algorithm, Algorithm::HS256);
    }

    #[test]
    fn test_shared_group_is_stable() {
        let group = ConsumerGroup::Shared("peatio".to_string());
        assert_eq!(group.resolve(), "peatio");
        assert_eq!(group.resolve(), group.resolve());
    }

    #[test]
    fn test_broadcast_group_is_unique_per_resolve() {
        let group = ConsumerGroup::Broadcast {
            prefix: "peatio".to_string(),
        };
        let first = group.resolve();
        let second = group.resolve();

        assert!(first.starts_with("peatio-"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_broker_defaults() {
        let config = BrokerConfig::new(vec!["a:9092".into(), "b:9092".into()], "peatio");
        assert_eq!(config.bootstrap_servers(), "a:9092,b:9092");
        assert_eq!(config.events_topic, "peatio:events");
        assert_eq!(config.delivery_mode, DeliveryMode::Sync);
        assert_eq!(config.group, ConsumerGroup::Shared("peatio".into()));
    }

    #[test]
    fn test_signing_config_accepts_unpadded_key() {
        let config = SigningConfig::from_encoded("c2VjcmV0", "HS256").unwrap();
        assert_eq!(config.private_key, b"secret");

        // "secre" encodes to "c2VjcmU=" with padding
        let config = SigningConfig::from_encoded("c2VjcmU", "HS256").unwrap();
        assert_eq!(config.private_key, b"secre");
    }

    #[test]
    fn test_signing_config_rejects_unknown_algorithm() {
        let err = SigningConfig::from_encoded("c2VjcmV0", "XX999").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "EVENT_API_JWT_ALGORITHM",
                ..
            }
        ));
    }
}
