//! Server configuration: TOML file + CLI overrides.

use crate::session::SessionSettings;
use serde::Deserialize;
use ssho_core::{SshoError, SshoResult};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Outbound queue capacity per viewer, in frames.
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            client_queue: default_client_queue(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// Shell to spawn; falls back to `$SHELL`.
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            shell: None,
            term: default_term(),
            history_limit: default_history_limit(),
            read_chunk: default_read_chunk(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    8080
}
fn default_client_queue() -> usize {
    256
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_history_limit() -> usize {
    crate::session::history::DEFAULT_HISTORY_LIMIT
}
fn default_read_chunk() -> usize {
    4096
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub shell: Option<String>,
    pub history_limit: Option<usize>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub shell: String,
    pub term: String,
    pub client_queue: usize,
    pub history_limit: usize,
    pub read_chunk: usize,
    pub rows: u16,
    pub cols: u16,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> SshoResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::merge(file_config, overrides))
    }

    fn merge(file: ConfigFile, overrides: ConfigOverrides) -> Self {
        let shell = overrides
            .shell
            .or(file.session.shell)
            .unwrap_or_else(default_shell);
        Self {
            bind: overrides.bind.unwrap_or(file.server.bind),
            port: overrides.port.unwrap_or(file.server.port),
            shell,
            term: file.session.term,
            client_queue: file.server.client_queue.max(1),
            history_limit: overrides.history_limit.unwrap_or(file.session.history_limit),
            read_chunk: file.session.read_chunk.max(1),
            rows: file.session.rows.max(1),
            cols: file.session.cols.max(1),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            history_limit: self.history_limit,
            read_chunk: self.read_chunk,
            rows: self.rows,
            cols: self.cols,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::merge(ConfigFile::default(), ConfigOverrides::default())
    }
}

fn parse_config(content: &str) -> SshoResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| SshoError::Config(format!("config parse error: {e}")))
}

/// `$SHELL`, else the platform default.
fn default_shell() -> String {
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ if cfg!(windows) => "powershell.exe".to_string(),
        _ => "/bin/bash".to_string(),
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.listen_addr().to_string(), "0.0.0.0:8080");
        assert_eq!(cfg.term, "xterm-256color");
        assert_eq!(cfg.history_limit, 1_048_576);
        assert_eq!(cfg.read_chunk, 4096);
        assert_eq!(cfg.client_queue, 256);
        assert_eq!((cfg.rows, cfg.cols), (24, 80));
        assert!(!cfg.shell.is_empty());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
bind = "127.0.0.1"
port = 9000
client_queue = 16

[session]
shell = "/bin/zsh"
term = "xterm"
history_limit = 4096
rows = 40
cols = 120
"#;
        let cfg = ServerConfig::merge(parse_config(toml_str).unwrap(), ConfigOverrides::default());
        assert_eq!(cfg.listen_addr().to_string(), "127.0.0.1:9000");
        assert_eq!(cfg.client_queue, 16);
        assert_eq!(cfg.shell, "/bin/zsh");
        assert_eq!(cfg.term, "xterm");
        assert_eq!(cfg.history_limit, 4096);
        assert_eq!((cfg.rows, cfg.cols), (40, 120));
    }

    #[test]
    fn parse_partial_toml_config() {
        let cfg = parse_config("[server]\nport = 5000\n").unwrap();
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.session.read_chunk, 4096);
        assert!(cfg.session.shell.is_none());
    }

    #[test]
    fn invalid_toml_is_config_error() {
        assert!(matches!(
            parse_config("[server]\nport = \"not a port\"\n"),
            Err(SshoError::Config(_))
        ));
    }

    #[test]
    fn cli_overrides_win() {
        let file =
            parse_config("[server]\nport = 5000\n[session]\nshell = \"/bin/zsh\"\n").unwrap();
        let cfg = ServerConfig::merge(
            file,
            ConfigOverrides {
                port: Some(7000),
                shell: Some("/bin/sh".into()),
                history_limit: Some(64),
                ..Default::default()
            },
        );
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.shell, "/bin/sh");
        assert_eq!(cfg.history_limit, 64);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nterm = \"vt100\"\n").unwrap();
        let cfg = ServerConfig::load(Some(&path), ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.term, "vt100");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(
            Some(&dir.path().join("absent.toml")),
            ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
    }
}
