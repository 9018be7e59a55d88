use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::HuddleConfig;

/// Loads and reloads the huddle configuration.
pub struct ConfigLoader {
    config: RwLock<HuddleConfig>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > HUDDLE_CONFIG env > ~/.huddle/huddle.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("HUDDLE_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".huddle")
            .join("huddle.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> huddle_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            Self::parse(&raw, &config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            HuddleConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        // Validate config: log warnings, fail on errors
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(huddle_core::HuddleError::Config(e));
            }
        }

        Ok(Self {
            config: RwLock::new(config),
            config_path,
        })
    }

    fn parse(raw: &str, path: &Path) -> huddle_core::Result<HuddleConfig> {
        toml::from_str::<HuddleConfig>(raw).map_err(|e| {
            huddle_core::HuddleError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> HuddleConfig {
        self.config.read().clone()
    }

    /// Path the config was (or would have been) loaded from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (HUDDLE_NAME, HUDDLE_COORDINATOR, etc.)
    fn apply_env_overrides(mut config: HuddleConfig) -> HuddleConfig {
        if let Ok(v) = std::env::var("HUDDLE_NAME") {
            config.participant.name = v;
        }
        if let Ok(v) = std::env::var("HUDDLE_COORDINATOR") {
            match v.rsplit_once(':') {
                Some((addr, port)) => match port.parse::<u16>() {
                    Ok(port) => {
                        config.participant.coordinator_address = addr.to_string();
                        config.participant.coordinator_port = port;
                    }
                    Err(_) => warn!(value = %v, "ignoring HUDDLE_COORDINATOR with invalid port"),
                },
                None => config.participant.coordinator_address = v,
            }
        }
        if let Ok(v) = std::env::var("HUDDLE_SEGMENT") {
            config.participant.segment = v;
        }
        if let Ok(v) = std::env::var("HUDDLE_PUBLIC_ADDRESS") {
            config.participant.public_address = v;
        }
        if let Ok(v) = std::env::var("HUDDLE_LOG_LEVEL") {
            config.logging.level = v;
        }
        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> huddle_core::Result<()> {
        if !self.config_path.exists() {
            return Err(huddle_core::HuddleError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = Self::parse(&raw, &self.config_path)?;
        let new_config = Self::apply_env_overrides(new_config);
        new_config.validate().map_err(huddle_core::HuddleError::Config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }
}
