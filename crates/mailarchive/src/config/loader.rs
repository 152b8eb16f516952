use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};

use crate::config::schema::AppConfig;
use crate::error::ConfigError;
use crate::factory::OutlookAppCredentials;
use crate::secrets::expand_home;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

/// Loads a YAML (`.yaml`/`.yml`) or JSON config file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
    if is_yaml {
        load_config_from_yaml(&content)
    } else {
        load_config_from_str(&content)
    }
}

pub fn load_config_from_str(content: &str) -> Result<AppConfig, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;
    load_config_from_value(json_value)
}

pub fn load_config_from_yaml(content: &str) -> Result<AppConfig, ConfigError> {
    let json_value: serde_json::Value = serde_yaml::from_str(content)?;
    load_config_from_value(json_value)
}

fn load_config_from_value(json_value: serde_json::Value) -> Result<AppConfig, ConfigError> {
    validate_schema(&json_value)?;

    let config: AppConfig = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

/// Semantic checks the schema cannot express.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.workers.count == 0 {
        return Err(ConfigError::Validation {
            message: "workers.count must be greater than 0".to_string(),
        });
    }

    let folder = &config.storage.opened_emails_folder;
    if folder.trim_matches('/').is_empty() || folder.contains("..") {
        return Err(ConfigError::Validation {
            message: format!("Invalid storage.opened_emails_folder '{}'", folder),
        });
    }

    let key = config.encryption_key()?;
    let key = key.expose_secret();
    if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::Validation {
            message: "encryption_key must be 64 hex characters (32 bytes)".to_string(),
        });
    }

    config.outlook_app()?;

    Ok(())
}

impl AppConfig {
    pub fn encryption_key(&self) -> Result<SecretString, ConfigError> {
        self.encryption_key
            .resolve()
            .map_err(|source| ConfigError::Secret {
                field: "encryption_key",
                source,
            })
    }

    /// The Outlook.com app registration, if configured.
    pub fn outlook_app(&self) -> Result<Option<OutlookAppCredentials>, ConfigError> {
        let Some(outlook) = &self.outlook else {
            return Ok(None);
        };
        let client_secret =
            outlook
                .client_secret
                .resolve()
                .map_err(|source| ConfigError::Secret {
                    field: "outlook.client_secret",
                    source,
                })?;
        Ok(Some(OutlookAppCredentials {
            client_id: outlook.client_id.clone(),
            client_secret,
        }))
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(expand_home(path)),
            None => crate::db::default_database_path(),
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        expand_home(&self.storage.root)
    }

    pub fn readpst_bin(&self) -> String {
        self.readpst_path
            .as_deref()
            .map(|p| expand_home(p).display().to_string())
            .unwrap_or_else(|| "readpst".to_string())
    }
}
