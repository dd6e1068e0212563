//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use kojo_core::{KojoError, KojoResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub session: SessionSection,
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// Scrollback ring capacity per session, in bytes.
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    /// Persisted sessions older than this many days are dropped on load.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Override for the sessions file location (defaults to the per-user
    /// config directory).
    #[serde(default)]
    pub sessions_file: Option<PathBuf>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            scrollback_bytes: default_scrollback_bytes(),
            retention_days: default_retention_days(),
            sessions_file: None,
        }
    }
}

fn default_scrollback_bytes() -> usize {
    1024 * 1024
}
fn default_retention_days() -> u32 {
    7
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub scrollback_bytes: usize,
    pub retention_days: u32,
    pub sessions_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Load configuration from a TOML file. A missing file means defaults;
    /// an unreadable or invalid file is an error.
    pub fn load(config_path: Option<&Path>) -> KojoResult<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);

        let file = if path.exists() {
            info!(path = %path.display(), "loading config file");
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<ConfigFile>(&content)
                .map_err(|e| KojoError::Config(format!("config parse error: {e}")))?
        } else {
            ConfigFile::default()
        };

        Ok(Self {
            scrollback_bytes: file.session.scrollback_bytes,
            retention_days: file.session.retention_days,
            sessions_file: file.session.sessions_file,
        })
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kojo")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = ServerConfig::load(Some(Path::new("/nonexistent/kojo.toml"))).unwrap();
        assert_eq!(cfg.scrollback_bytes, 1024 * 1024);
        assert_eq!(cfg.retention_days, 7);
        assert!(cfg.sessions_file.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[session]\nscrollback_bytes = 4096\nretention_days = 2\n",
        )
        .unwrap();

        let cfg = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.scrollback_bytes, 4096);
        assert_eq!(cfg.retention_days, 2);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session\n").unwrap();
        assert!(ServerConfig::load(Some(&path)).is_err());
    }
}
