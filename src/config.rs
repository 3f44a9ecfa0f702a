//! Process configuration: raw settings, layered loading and validation.

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::{
    ClassifierSettings, FailMode, GuardConfig, LoggingConfig, PayloadSchema, PolicyConfig,
    PolicySettings, RotationStrategy, ServerConfig, StorageKind, StorageSettings,
};

use crate::error::{Error, Result};

impl GuardConfig {
    /// Write an annotated sample configuration file
    pub fn generate_sample_config(path: &str) -> Result<()> {
        let toml_content = toml::to_string_pretty(&GuardConfig::default())
            .map_err(|e| Error::Configuration(e.to_string()))?;

        let sample_content = format!(
            r#"# ddos-guard configuration
#
# Save as ddos-guard.toml. Every key can be overridden from the environment,
# e.g. DDOS_GUARD__POLICY__CONFIDENCE_THRESHOLD=0.9

{}
# [policy]
# window_secs             = sliding window length per source
# confidence_threshold    = minimum confidence for an attack label to block
# attack_labels           = labels that may block: ddos, malicious, unknown
# fail_mode               = open (admit) or closed (reject) while the classifier is down
# max_requests_per_window = optional hard ceiling, answered with 429 before scoring
# block_on_detection      = false records flagged requests but lets them through
#
# [classifier]
# schema = http (request features) or packet (Packets/Bytes/tcp.* features)
#
# [storage]
# kind = sqlite, jsonl or memory
"#,
            toml_content
        );

        std::fs::write(path, sample_content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_sample_config_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ddos-guard.toml");
        let path = path.to_str().unwrap();

        GuardConfig::generate_sample_config(path).unwrap();

        let config = ConfigLoader::new().load_from_file(Some(path)).build().unwrap();
        assert!(PolicyConfig::from_config(&config).is_ok());
    }
}
