//! TOML configuration with `MQTT_*`/`DATA_DIR` environment overrides: the
//! file is primary and env vars are an override layer on top, so a deployed
//! config file never needs editing just to swap a broker address.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config invalid: {reason}")]
    ConfigInvalid { reason: String },
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MqttConfig {
    pub broker: Option<String>,
    #[serde(default = "default_publish_prefix")]
    pub publish_prefix: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_publish_prefix() -> String {
    "tudomesh".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslationOverride {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VacuumConfig {
    pub id: String,
    pub topic: String,
    pub color: Option<String>,
    pub rotation: Option<f64>,
    pub translation: Option<TranslationOverride>,
    #[serde(rename = "apiUrl")]
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    pub reference: Option<String>,
    #[serde(default)]
    pub vacuums: Vec<VacuumConfig>,
    #[serde(rename = "gridSpacing")]
    pub grid_spacing: Option<f64>,
}

impl Config {
    /// Loads `path` as TOML if given, else starts from defaults; either
    /// way, applies the `MQTT_*`/`DATA_DIR` environment overrides on top.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(broker) = std::env::var("MQTT_BROKER") {
            self.mqtt.broker = Some(broker);
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Ok(prefix) = std::env::var("MQTT_PUBLISH_PREFIX") {
            self.mqtt.publish_prefix = prefix;
        }
        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            self.mqtt.client_id = Some(client_id);
        }
    }

    /// Required whenever `--mqtt` is requested: a broker URI, and every
    /// vacuum entry well formed (non-empty id and topic).
    pub fn validate(&self, mqtt_requested: bool) -> Result<(), ConfigError> {
        if mqtt_requested && self.mqtt.broker.is_none() {
            return Err(ConfigError::ConfigInvalid {
                reason: "mqtt.broker is required when --mqtt is set".to_string(),
            });
        }
        let mut seen_ids = HashMap::new();
        for vacuum in &self.vacuums {
            if vacuum.id.is_empty() || vacuum.topic.is_empty() {
                return Err(ConfigError::ConfigInvalid {
                    reason: format!("vacuum entry {:?} is missing id or topic", vacuum.id),
                });
            }
            if let Some(hex) = &vacuum.color {
                if tudomesh_render::Color::from_hex(hex).is_none() {
                    return Err(ConfigError::ConfigInvalid {
                        reason: format!("vacuum {} has malformed color {:?}", vacuum.id, hex),
                    });
                }
            }
            if seen_ids.insert(vacuum.id.clone(), ()).is_some() {
                return Err(ConfigError::ConfigInvalid {
                    reason: format!("duplicate vacuum id {:?}", vacuum.id),
                });
            }
        }
        Ok(())
    }
}

pub fn resolve_data_dir(cli_value: Option<PathBuf>) -> PathBuf {
    if let Ok(from_env) = std::env::var("DATA_DIR") {
        return PathBuf::from(from_env);
    }
    cli_value.unwrap_or_else(|| PathBuf::from("./data"))
}
