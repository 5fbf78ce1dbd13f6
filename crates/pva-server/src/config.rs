//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use pva_core::{PvaError, PvaResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_tcp_port() -> u16 {
    5075
}
fn default_udp_port() -> u16 {
    5076
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
        cli_udp_port: Option<u16>,
    ) -> PvaResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| PvaError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile { server: ServerSection::default() }
            }
        } else {
            ConfigFile { server: ServerSection::default() }
        };

        let bind = cli_bind.map(|s| s.to_string()).unwrap_or(file_config.server.bind);
        let tcp_port = cli_port.unwrap_or(file_config.server.tcp_port);
        let udp_port = cli_udp_port.unwrap_or(file_config.server.udp_port);

        Ok(Self { bind, tcp_port, udp_port })
    }

    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.bind, self.tcp_port)
    }

    pub fn udp_addr(&self) -> String {
        format!("{}:{}", self.bind, self.udp_port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let config = ServerConfig::load(None, None, None, None).unwrap();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.tcp_port, 5075);
        assert_eq!(config.udp_port, 5076);
        assert_eq!(config.tcp_addr(), "0.0.0.0:5075");
        assert_eq!(config.udp_addr(), "0.0.0.0:5076");
    }

    #[test]
    fn cli_overrides_beat_file_values() {
        let path = std::env::temp_dir().join(format!("pva-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[server]\nbind = \"127.0.0.1\"\ntcp_port = 6000\n").unwrap();

        let config = ServerConfig::load(Some(&path), None, Some(7000), None).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.tcp_port, 7000);
        assert_eq!(config.udp_port, 5076);
    }

    #[test]
    fn parse_errors_surface() {
        let path =
            std::env::temp_dir().join(format!("pva-config-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[server\nbind =").unwrap();

        let err = ServerConfig::load(Some(&path), None, None, None).unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(err.to_string().contains("config parse error"));
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let path = Path::new("/nonexistent/pva/config.toml");
        let config = ServerConfig::load(Some(path), Some("10.0.0.1"), None, None).unwrap();
        assert_eq!(config.bind, "10.0.0.1");
        assert_eq!(config.tcp_port, 5075);
    }
}
