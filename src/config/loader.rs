//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/workspace-supervisor/config.toml`
//! 3. User config: `~/.config/workspace-supervisor/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Missing system and user files are skipped. Invalid TOML anywhere is an
//! error.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;
use crate::cli::{Cli, Commands};

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/workspace-supervisor/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "workspace-supervisor";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    system_path: PathBuf,
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a ConfigLoader with the default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths.
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load, merge and validate configuration from all sources.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        for path in [&self.system_path, &self.user_path] {
            if let Some(file_config) = self.load_file(path)? {
                config.merge(file_config);
                debug!("Loaded config from {:?}", path);
            } else {
                debug!("No config found at {:?}", path);
            }
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        apply_cli_flags(&mut config, cli);
        config.validate()?;
        Ok(config)
    }

    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_cli_flags(config: &mut Config, cli: &Cli) {
    if let Some(ref socket_path) = cli.socket_path {
        config.supervisor.socket_path = socket_path.clone();
    }
    if let Commands::Run {
        poll_interval_ms: Some(ms),
    } = cli.command
    {
        config.ports.poll_interval_ms = ms;
    }
}
