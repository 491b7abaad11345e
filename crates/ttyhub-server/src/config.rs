//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use ttyhub_core::{HubError, HubResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    /// Free-form viewer settings, uploaded as JSON.
    #[serde(default)]
    pub settings: toml::Table,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub once: bool,
    #[serde(default)]
    pub readonly: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            once: false,
            readonly: false,
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_signal")]
    pub signal: SignalSpec,
    #[serde(default)]
    pub packet_mode: PacketMode,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            command: None,
            signal: default_signal(),
            packet_mode: PacketMode::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// A signal given either by name (`"HUP"`, `"SIGTERM"`) or by number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SignalSpec {
    Number(i32),
    Name(String),
}

impl SignalSpec {
    pub fn resolve(&self) -> HubResult<i32> {
        match self {
            SignalSpec::Number(n) => Ok(*n),
            SignalSpec::Name(name) => parse_signal(name),
        }
    }
}

/// How the PTY reports terminal-mode changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PacketMode {
    /// Plain reads, no mode reports.
    No,
    /// Packet mode: each read carries a status byte.
    Yes,
    /// Packet mode with external line processing enabled.
    #[default]
    Extproc,
}

impl PacketMode {
    pub fn enabled(self) -> bool {
        self != PacketMode::No
    }
}

fn default_port() -> u16 {
    7033
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_signal() -> SignalSpec {
    SignalSpec::Name("HUP".to_string())
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}

/// Flags from the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub once: bool,
    pub readonly: bool,
    pub signal: Option<String>,
    pub packet_mode: Option<PacketMode>,
    pub command: Vec<String>,
    pub detached: bool,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub config_path: Option<PathBuf>,
    pub bind: IpAddr,
    pub port: u16,
    pub once: bool,
    pub readonly: bool,
    pub command: Vec<String>,
    pub signal: i32,
    pub packet_mode: PacketMode,
    pub shutdown_grace: Duration,
    pub settings_json: Option<String>,
    /// Start a session at launch with no viewer attached.
    pub detached: bool,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &Overrides) -> HubResult<Self> {
        let expanded = config_path.map(expand_tilde);
        let file_config = match &expanded {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };

        let bind_str = cli.bind.clone().unwrap_or(file_config.server.bind);
        let bind: IpAddr = bind_str
            .parse()
            .map_err(|_| HubError::Config(format!("invalid bind address '{bind_str}'")))?;

        let signal = match &cli.signal {
            Some(name) => parse_signal(name)?,
            None => file_config.session.signal.resolve()?,
        };

        let command = if !cli.command.is_empty() {
            cli.command.clone()
        } else {
            match file_config.session.command {
                Some(cmd) if !cmd.is_empty() => cmd,
                _ => default_command(),
            }
        };

        Ok(Self {
            config_path: expanded,
            bind,
            port: cli.port.unwrap_or(file_config.server.port),
            once: cli.once || file_config.server.once,
            readonly: cli.readonly || file_config.server.readonly,
            command,
            signal,
            packet_mode: cli.packet_mode.unwrap_or(file_config.session.packet_mode),
            shutdown_grace: Duration::from_millis(file_config.session.shutdown_grace_ms),
            settings_json: settings_to_json(&file_config.settings)?,
            detached: cli.detached,
        })
    }

    /// Re-read the `[settings]` table from the config file.
    pub fn reload_settings(&self) -> HubResult<Option<String>> {
        match &self.config_path {
            Some(path) => settings_to_json(&read_config_file(path)?.settings),
            None => Ok(None),
        }
    }
}

fn read_config_file(path: &Path) -> HubResult<ConfigFile> {
    if !path.exists() {
        info!(path = %path.display(), "config file not found, using defaults");
        return Ok(ConfigFile::default());
    }
    info!(path = %path.display(), "loading config file");
    let content = std::fs::read_to_string(path)?;
    toml::from_str::<ConfigFile>(&content)
        .map_err(|e| HubError::Config(format!("config parse error: {e}")))
}

fn settings_to_json(settings: &toml::Table) -> HubResult<Option<String>> {
    if settings.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(settings)
        .map(Some)
        .map_err(|e| HubError::Config(format!("settings are not JSON-representable: {e}")))
}

/// The user's shell, or `/bin/sh`.
pub fn default_command() -> Vec<String> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    vec![shell]
}

/// Parse a signal name (`HUP`, `SIGHUP`, `hup`) or decimal number.
pub fn parse_signal(spec: &str) -> HubResult<i32> {
    let spec = spec.trim();
    if let Ok(n) = spec.parse::<i32>() {
        return Ok(n);
    }
    let upper = spec.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    let signal = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "TERM" => libc::SIGTERM,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        _ => return Err(HubError::Config(format!("unknown signal '{spec}'"))),
    };
    Ok(signal)
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
