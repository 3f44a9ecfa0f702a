use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::security::ddos::types::VerdictLabel;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Admission policy
    pub policy: PolicySettings,

    /// External classifier
    pub classifier: ClassifierSettings,

    /// Detection record storage
    pub storage: StorageSettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the protected application
    pub bind_addr: String,

    /// Paths that bypass admission control
    #[serde(default)]
    pub exempt_paths: Vec<String>,

    /// Use the first X-Forwarded-For entry as the source address
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

/// Admission policy settings as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Sliding window length in seconds
    pub window_secs: u64,

    /// Minimum confidence for an attack label to block
    pub confidence_threshold: f64,

    /// Labels treated as attacks
    pub attack_labels: Vec<String>,

    /// Behaviour when the classifier is unavailable
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Idle-window sweep interval in seconds
    pub sweep_interval_secs: u64,

    /// Rolling client-signature history length per source
    pub signature_history_cap: usize,

    /// Hard per-source request ceiling within one window
    pub max_requests_per_window: Option<u64>,

    /// Reject flagged requests; `false` only records them (monitor mode)
    #[serde(default = "default_block_on_detection")]
    pub block_on_detection: bool,
}

fn default_block_on_detection() -> bool {
    true
}

/// Classifier endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    /// Scoring endpoint URL
    pub endpoint: String,

    /// Per-request budget in milliseconds
    pub timeout_ms: u64,

    /// Feature payload layout expected by the endpoint
    #[serde(default)]
    pub schema: PayloadSchema,
}

/// Detection record storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Backend kind
    pub kind: StorageKind,

    /// Database file or JSON-lines file path
    pub path: String,

    /// Pending-record queue capacity
    pub queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or EnvFilter directive (error, warn, info, debug, trace)
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,

    /// Write to stderr
    pub console_enabled: bool,

    /// Write to a rolling file under `log_dir`
    pub file_enabled: bool,

    /// Directory for log files
    pub log_dir: PathBuf,

    /// File rotation strategy
    #[serde(default)]
    pub rotation: RotationStrategy,
}

/// Classifier outage policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit traffic while the classifier is down
    #[default]
    Open,
    /// Reject traffic while the classifier is down
    Closed,
}

/// Classifier payload layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadSchema {
    /// Request-oriented fields (`req_rate_1min`, `headers_length`, ...)
    #[default]
    Http,
    /// Packet-count fields (`Packets`, `Bytes`, `tcp.srcport`, ...)
    Packet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    #[serde(rename = "sqlite")]
    Sqlite,
    #[serde(rename = "jsonl")]
    JsonLines,
    #[serde(rename = "memory")]
    Memory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationStrategy {
    #[serde(rename = "daily")]
    #[default]
    Daily,
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "never")]
    Never,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_addr: "127.0.0.1:3000".to_string(),
                exempt_paths: vec!["/health".to_string()],
                trust_forwarded_for: false,
            },
            policy: PolicySettings {
                window_secs: 60,
                confidence_threshold: 0.8,
                attack_labels: vec!["ddos".to_string(), "malicious".to_string()],
                fail_mode: FailMode::Open,
                sweep_interval_secs: 30,
                signature_history_cap: 10,
                max_requests_per_window: None,
                block_on_detection: true,
            },
            classifier: ClassifierSettings {
                endpoint: "http://127.0.0.1:8000/predict".to_string(),
                timeout_ms: 250,
                schema: PayloadSchema::Http,
            },
            storage: StorageSettings {
                kind: StorageKind::Sqlite,
                path: "detections.db".to_string(),
                queue_capacity: 1024,
            },
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            console_enabled: true,
            file_enabled: false,
            log_dir: PathBuf::from("logs"),
            rotation: RotationStrategy::Daily,
        }
    }
}

/// Validated, immutable admission policy shared by every request handler.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub window: Duration,
    pub confidence_threshold: f64,
    pub attack_labels: HashSet<VerdictLabel>,
    pub classifier_endpoint: String,
    pub classifier_timeout: Duration,
    pub payload_schema: PayloadSchema,
    pub fail_mode: FailMode,
    pub sweep_interval: Duration,
    pub signature_history_cap: usize,
    pub max_requests_per_window: Option<u64>,
    pub block_on_detection: bool,
    pub exempt_paths: Vec<String>,
    pub trust_forwarded_for: bool,
}

impl PolicyConfig {
    /// Validate raw settings. Any failure here is fatal for startup.
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        let policy = &config.policy;

        if policy.window_secs == 0 {
            return Err(Error::Configuration(
                "policy.window_secs must be greater than zero".to_string(),
            ));
        }
        if !policy.confidence_threshold.is_finite()
            || !(0.0..=1.0).contains(&policy.confidence_threshold)
        {
            return Err(Error::Configuration(format!(
                "policy.confidence_threshold must be within [0, 1], got {}",
                policy.confidence_threshold
            )));
        }
        if policy.sweep_interval_secs == 0 {
            return Err(Error::Configuration(
                "policy.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if policy.signature_history_cap == 0 {
            return Err(Error::Configuration(
                "policy.signature_history_cap must be greater than zero".to_string(),
            ));
        }
        if policy.max_requests_per_window == Some(0) {
            return Err(Error::Configuration(
                "policy.max_requests_per_window must be greater than zero when set".to_string(),
            ));
        }

        let mut attack_labels = HashSet::new();
        for raw in &policy.attack_labels {
            let label = VerdictLabel::from_config_name(raw).ok_or_else(|| {
                Error::Configuration(format!("unknown attack label: {}", raw))
            })?;
            if label == VerdictLabel::Benign {
                return Err(Error::Configuration(
                    "'benign' cannot be configured as an attack label".to_string(),
                ));
            }
            attack_labels.insert(label);
        }
        if attack_labels.is_empty() {
            return Err(Error::Configuration(
                "policy.attack_labels must name at least one label".to_string(),
            ));
        }

        let endpoint = config.classifier.endpoint.trim();
        if endpoint.is_empty() {
            return Err(Error::Configuration(
                "classifier.endpoint must be set".to_string(),
            ));
        }
        url::Url::parse(endpoint).map_err(|e| {
            Error::Configuration(format!("classifier.endpoint is not a valid URL: {}", e))
        })?;
        if config.classifier.timeout_ms == 0 {
            return Err(Error::Configuration(
                "classifier.timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            window: Duration::from_secs(policy.window_secs),
            confidence_threshold: policy.confidence_threshold,
            attack_labels,
            classifier_endpoint: endpoint.to_string(),
            classifier_timeout: Duration::from_millis(config.classifier.timeout_ms),
            payload_schema: config.classifier.schema,
            fail_mode: policy.fail_mode,
            sweep_interval: Duration::from_secs(policy.sweep_interval_secs),
            signature_history_cap: policy.signature_history_cap,
            max_requests_per_window: policy.max_requests_per_window,
            block_on_detection: policy.block_on_detection,
            exempt_paths: config.server.exempt_paths.clone(),
            trust_forwarded_for: config.server.trust_forwarded_for,
        })
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            confidence_threshold: 0.8,
            attack_labels: [VerdictLabel::Ddos, VerdictLabel::Malicious]
                .into_iter()
                .collect(),
            classifier_endpoint: "http://127.0.0.1:8000/predict".to_string(),
            classifier_timeout: Duration::from_millis(250),
            payload_schema: PayloadSchema::Http,
            fail_mode: FailMode::Open,
            sweep_interval: Duration::from_secs(30),
            signature_history_cap: 10,
            max_requests_per_window: None,
            block_on_detection: true,
            exempt_paths: vec!["/health".to_string()],
            trust_forwarded_for: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let policy = PolicyConfig::from_config(&GuardConfig::default()).unwrap();
        assert_eq!(policy.window, Duration::from_secs(60));
        assert_eq!(policy.fail_mode, FailMode::Open);
        assert!(policy.attack_labels.contains(&VerdictLabel::Ddos));
        assert!(!policy.attack_labels.contains(&VerdictLabel::Benign));
        assert!(policy.block_on_detection);
    }

    #[test]
    fn test_block_on_detection_defaults_when_omitted() {
        let settings: PolicySettings = toml::from_str(
            r#"
            window_secs = 60
            confidence_threshold = 0.7
            attack_labels = ["ddos"]
            sweep_interval_secs = 30
            signature_history_cap = 10
            "#,
        )
        .unwrap();
        assert!(settings.block_on_detection);

        let mut config = GuardConfig::default();
        config.policy.block_on_detection = false;
        assert!(!PolicyConfig::from_config(&config).unwrap().block_on_detection);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = GuardConfig::default();
        config.policy.confidence_threshold = 1.5;
        let err = PolicyConfig::from_config(&config).unwrap_err();
        assert!(err.is_fatal());

        config.policy.confidence_threshold = f64::NAN;
        assert!(PolicyConfig::from_config(&config).is_err());
    }

    #[test]
    fn test_benign_attack_label_rejected() {
        let mut config = GuardConfig::default();
        config.policy.attack_labels = vec!["benign".to_string()];
        assert!(PolicyConfig::from_config(&config).is_err());
    }

    #[test]
    fn test_unknown_attack_label_name_rejected() {
        let mut config = GuardConfig::default();
        config.policy.attack_labels = vec!["ddos".to_string(), "volcano".to_string()];
        assert!(PolicyConfig::from_config(&config).is_err());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let mut config = GuardConfig::default();
        config.policy.window_secs = 0;
        assert!(PolicyConfig::from_config(&config).is_err());

        let mut config = GuardConfig::default();
        config.classifier.timeout_ms = 0;
        assert!(PolicyConfig::from_config(&config).is_err());
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        let mut config = GuardConfig::default();
        config.classifier.endpoint = "  ".to_string();
        assert!(PolicyConfig::from_config(&config).is_err());
    }

    #[test]
    fn test_fail_mode_deserializes_lowercase() {
        let mode: FailMode = serde_json::from_str("\"closed\"").unwrap();
        assert_eq!(mode, FailMode::Closed);
        assert_eq!(FailMode::default(), FailMode::Open);
    }
}
