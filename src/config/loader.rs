use super::types::GuardConfig;
use crate::error::{Error, Result};
use config::{Config, Environment, File};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    config_file: Option<String>,
    load_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_file: None,
            load_env: false,
        }
    }

    /// Load configuration from file
    pub fn load_from_file(mut self, path: Option<&str>) -> Self {
        self.config_file = path.map(String::from);
        self
    }

    /// Load configuration from environment variables
    pub fn load_from_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> Result<GuardConfig> {
        let mut builder = Config::builder().add_source(Config::try_from(&GuardConfig::default())?);

        if let Some(config_path) = &self.config_file {
            // An explicitly requested file must exist
            builder = builder.add_source(File::with_name(config_path).required(true));
        } else {
            builder = builder
                .add_source(File::with_name("ddos-guard").required(false))
                .add_source(File::with_name("config/ddos-guard").required(false));
        }

        if self.load_env {
            builder = builder.add_source(
                Environment::with_prefix("DDOS_GUARD")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("policy.attack_labels")
                    .with_list_parse_key("server.exempt_paths")
                    .try_parsing(true),
            );
        }

        let config: GuardConfig = builder
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| {
                Error::Configuration(format!("Failed to deserialize configuration: {}", e))
            })?;

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
