//! Configuration: the global proxy config plus one JSON file per backend.
//!
//! The on-disk layout is a directory holding `ultraviolet.json` and a
//! `config/` subdirectory of per-backend files. Config files keep durations
//! as human strings (`"1s"`, `"5m"`); [`ServerConfig::resolve`] parses them
//! and pre-marshals the offline/disconnect packets into the runtime
//! [`BackendConfig`] form consumed by the backend workers.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::mc::packets::{ClientBoundDisconnect, SimpleStatus};
use crate::mc::Packet;
use crate::proxy::realip::{self, RealIpMode};

/// Default config directory for bare-metal installs.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/ultraviolet";

/// Name of the global config file inside the config directory.
pub const MAIN_CONFIG_FILE: &str = "ultraviolet.json";

/// Subdirectory holding per-backend config files.
pub const SERVER_CONFIG_DIR: &str = "config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{key} {value:?} is not a valid duration")]
    InvalidDuration { key: &'static str, value: String },

    #[error("proxyTo {0:?} does not resolve to an address")]
    UnresolvableTarget(String),

    #[error("proxyBind {0:?} is not a valid ip address")]
    InvalidBind(String),

    #[error("realIPKeyPath {path}: {reason}")]
    UnreadableKey { path: PathBuf, reason: String },
}

/// Global proxy configuration (`ultraviolet.json`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UltravioletConfig {
    pub listen_to: String,
    pub default_status: SimpleStatus,
    pub number_of_workers: usize,
    pub number_of_listeners: usize,
    pub accept_proxy_protocol: bool,
    pub enable_prometheus: bool,
    pub prometheus_bind: String,

    pub enable_hot_swap: bool,
    pub pid_file: String,
    #[serde(rename = "iODeadline")]
    pub io_deadline: String,
}

impl Default for UltravioletConfig {
    fn default() -> Self {
        Self {
            listen_to: ":25565".to_string(),
            default_status: SimpleStatus {
                name: "Ultraviolet".to_string(),
                protocol: 755,
                description: "One proxy to rule them all".to_string(),
            },
            number_of_workers: 10,
            number_of_listeners: 1,
            accept_proxy_protocol: false,
            enable_prometheus: true,
            prometheus_bind: ":9100".to_string(),
            enable_hot_swap: false,
            pid_file: "/var/run/ultraviolet.pid".to_string(),
            io_deadline: "1s".to_string(),
        }
    }
}

impl UltravioletConfig {
    /// Bind address for the game listener; a bare `:port` means all
    /// interfaces.
    pub fn listen_addr(&self) -> String {
        normalize_bind_addr(&self.listen_to)
    }

    /// Bind address for the HTTP control surface.
    pub fn prometheus_addr(&self) -> String {
        normalize_bind_addr(&self.prometheus_bind)
    }

    pub fn io_deadline(&self) -> Duration {
        parse_duration_or("iODeadline", &self.io_deadline, Duration::from_secs(1))
            .unwrap_or(Duration::from_secs(1))
    }
}

fn normalize_bind_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

/// One backend's configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    #[serde(skip)]
    pub file_path: PathBuf,

    pub name: String,
    pub domains: Vec<String>,

    pub proxy_to: String,
    pub proxy_bind: String,
    pub dial_timeout: String,
    pub send_proxy_protocol: bool,

    pub disconnect_message: String,

    pub cache_status: bool,
    pub cache_update_cooldown: String,
    pub valid_protocol: i32,
    pub offline_status: SimpleStatus,

    pub rate_limit: usize,
    pub rate_cooldown: String,
    pub ban_list_cooldown: String,
    pub reconnect_msg: String,

    #[serde(rename = "useRealIPv2.4")]
    pub use_real_ip_v2_4: bool,
    #[serde(rename = "useRealIPv2.5")]
    pub use_real_ip_v2_5: bool,
    #[serde(rename = "realIPKeyPath")]
    pub real_ip_key_path: String,

    pub state_update_cooldown: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            file_path: PathBuf::new(),
            name: String::new(),
            domains: Vec::new(),
            proxy_to: String::new(),
            proxy_bind: String::new(),
            dial_timeout: "1s".to_string(),
            send_proxy_protocol: false,
            disconnect_message: "Server is offline".to_string(),
            cache_status: false,
            cache_update_cooldown: String::new(),
            valid_protocol: 0,
            offline_status: SimpleStatus::default(),
            rate_limit: 5,
            rate_cooldown: "1s".to_string(),
            ban_list_cooldown: "5m".to_string(),
            reconnect_msg: "Please reconnect to verify yourself".to_string(),
            use_real_ip_v2_4: false,
            use_real_ip_v2_5: false,
            real_ip_key_path: String::new(),
            state_update_cooldown: "1s".to_string(),
        }
    }
}

impl ServerConfig {
    /// Stable identity across reloads.
    pub fn id(&self) -> &Path {
        &self.file_path
    }

    /// Parse durations, resolve addresses, load keys, and pre-marshal the
    /// synthesized packets.
    pub fn resolve(&self) -> Result<BackendConfig, ConfigError> {
        let target = self
            .proxy_to
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::UnresolvableTarget(self.proxy_to.clone()))?;

        let bind = if self.proxy_bind.is_empty() {
            None
        } else {
            Some(
                self.proxy_bind
                    .parse::<IpAddr>()
                    .map_err(|_| ConfigError::InvalidBind(self.proxy_bind.clone()))?,
            )
        };

        let real_ip = if self.use_real_ip_v2_5 {
            let key = realip::load_signing_key(Path::new(&self.real_ip_key_path))?;
            RealIpMode::Signed(key)
        } else if self.use_real_ip_v2_4 {
            RealIpMode::Legacy
        } else {
            RealIpMode::None
        };

        Ok(BackendConfig {
            id: self.file_path.clone(),
            name: if self.name.is_empty() {
                self.domains.first().cloned().unwrap_or_default()
            } else {
                self.name.clone()
            },
            domains: self.domains.iter().map(|d| d.to_lowercase()).collect(),
            proxy_to: self.proxy_to.clone(),
            target,
            bind,
            dial_timeout: parse_duration_or(
                "dialTimeout",
                &self.dial_timeout,
                Duration::from_secs(1),
            )?,
            send_proxy_protocol: self.send_proxy_protocol,
            offline_status: self.offline_status.marshal(),
            offline_disconnect: ClientBoundDisconnect {
                reason: self.disconnect_message.clone(),
            }
            .marshal(),
            cache_status: self.cache_status,
            cache_update_cooldown: parse_duration_or(
                "cacheUpdateCooldown",
                &self.cache_update_cooldown,
                Duration::ZERO,
            )?,
            valid_protocol: self.valid_protocol,
            rate_limit: self.rate_limit,
            rate_cooldown: parse_duration_or("rateCooldown", &self.rate_cooldown, Duration::ZERO)?,
            ban_list_cooldown: parse_duration_or(
                "banListCooldown",
                &self.ban_list_cooldown,
                Duration::ZERO,
            )?,
            rate_disconnect: ClientBoundDisconnect {
                reason: self.reconnect_msg.clone(),
            }
            .marshal(),
            state_update_cooldown: parse_duration_or(
                "stateUpdateCooldown",
                &self.state_update_cooldown,
                Duration::from_secs(1),
            )?,
            real_ip,
        })
    }
}

/// Runtime form of a backend config: addresses resolved, durations parsed,
/// reply packets pre-marshaled.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub id: PathBuf,
    pub name: String,
    pub domains: Vec<String>,
    pub proxy_to: String,
    pub target: SocketAddr,
    pub bind: Option<IpAddr>,
    pub dial_timeout: Duration,
    pub send_proxy_protocol: bool,
    pub offline_status: Packet,
    pub offline_disconnect: Packet,
    pub cache_status: bool,
    pub cache_update_cooldown: Duration,
    pub valid_protocol: i32,
    pub rate_limit: usize,
    pub rate_cooldown: Duration,
    pub ban_list_cooldown: Duration,
    pub rate_disconnect: Packet,
    pub state_update_cooldown: Duration,
    pub real_ip: RealIpMode,
}

fn parse_duration_or(
    key: &'static str,
    value: &str,
    empty_default: Duration,
) -> Result<Duration, ConfigError> {
    if value.is_empty() {
        return Ok(empty_default);
    }
    humantime::parse_duration(value).map_err(|_| ConfigError::InvalidDuration {
        key,
        value: value.to_string(),
    })
}

/// Read the global config file; a missing file falls back to defaults.
pub fn read_ultraviolet_config(path: &Path) -> Result<UltravioletConfig, ConfigError> {
    if !path.exists() {
        warn!(path = %path.display(), "main config file missing, using defaults");
        return Ok(UltravioletConfig::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Read every `*.json` backend config in the directory, in sorted order so
/// duplicate-domain resolution is deterministic. Unreadable files are
/// returned separately so startup can treat them as fatal and reload can
/// log and skip.
pub fn read_server_configs(dir: &Path) -> (Vec<ServerConfig>, Vec<ConfigError>) {
    let mut configs = Vec::new();
    let mut errors = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if dir.exists() {
                errors.push(ConfigError::Read {
                    path: dir.to_path_buf(),
                    source: err,
                });
            } else {
                warn!(dir = %dir.display(), "server config directory missing");
            }
            return (configs, errors);
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    for path in paths {
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) => {
                errors.push(ConfigError::Read { path, source });
                continue;
            }
        };
        match serde_json::from_str::<ServerConfig>(&raw) {
            Ok(mut cfg) => {
                cfg.file_path = path;
                configs.push(cfg);
            }
            Err(source) => errors.push(ConfigError::Parse { path, source }),
        }
    }

    (configs, errors)
}
