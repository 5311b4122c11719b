//! Load config from file and environment.

use meshpeer_core::{DiscoveryInfo, SessionConfig};
use serde::Deserialize;
use std::path::PathBuf;

const MAX_DISPLAY_NAME_LEN: usize = 63;

/// Host configuration. File: ~/.config/meshpeer/config.toml or /etc/meshpeer/config.toml.
/// Env overrides: MESHPEER_SERVICE_TYPE, MESHPEER_DISPLAY_NAME, MESHPEER_DISCOVERY_PORT,
/// MESHPEER_TRANSPORT_PORT, MESHPEER_AUTO_ACCEPT, MESHPEER_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery namespace (default "meshpeer-chat").
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Shown to other peers. Defaults to the hostname.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Link TCP port (default 45681; 0 picks any free port).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default = "default_invite_timeout_secs")]
    pub invite_timeout_secs: u64,
    /// Accept every invitation without asking.
    #[serde(default)]
    pub auto_accept: bool,
    /// Received files land here (default: $TMPDIR/meshpeer).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// tracing filter directive when RUST_LOG is unset (default "info").
    #[serde(default = "default_log")]
    pub log: String,
    /// Advertised alongside the local identity.
    #[serde(default)]
    pub discovery_info: DiscoveryInfo,
}

fn default_service_type() -> String {
    "meshpeer-chat".into()
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_invite_timeout_secs() -> u64 {
    meshpeer_core::config::DEFAULT_INVITE_TIMEOUT_SECS
}
fn default_log() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            display_name: None,
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            invite_timeout_secs: default_invite_timeout_secs(),
            auto_accept: false,
            download_dir: None,
            log: default_log(),
            discovery_info: DiscoveryInfo::new(),
        }
    }
}

impl Config {
    /// Configured name, else the hostname, cut to what discovery allows.
    pub fn resolved_display_name(&self) -> String {
        let name = self
            .display_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
        let name = if name.is_empty() { "meshpeer".to_string() } else { name };
        truncate_on_char_boundary(name, MAX_DISPLAY_NAME_LEN)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("meshpeer"))
    }

    pub fn session_config(&self) -> SessionConfig {
        let mut session = SessionConfig::new(self.service_type.clone(), self.resolved_display_name());
        session.invite_timeout_secs = self.invite_timeout_secs;
        if !self.discovery_info.is_empty() {
            session.discovery_info = Some(self.discovery_info.clone());
        }
        session
    }

    /// Apply overrides from `var`, the environment lookup.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("MESHPEER_SERVICE_TYPE") {
            self.service_type = s;
        }
        if let Some(s) = var("MESHPEER_DISPLAY_NAME") {
            self.display_name = Some(s);
        }
        if let Some(p) = var("MESHPEER_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
            self.discovery_port = p;
        }
        if let Some(p) = var("MESHPEER_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
            self.transport_port = p;
        }
        if let Some(s) = var("MESHPEER_AUTO_ACCEPT") {
            self.auto_accept = matches!(s.as_str(), "1" | "true" | "yes");
        }
        if let Some(s) = var("MESHPEER_LOG") {
            self.log = s;
        }
    }
}

fn truncate_on_char_boundary(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshpeer/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshpeer/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => eprintln!("ignoring {}: {e}", p.display()),
                Err(e) => eprintln!("cannot read {}: {e}", p.display()),
            }
            break;
        }
    }
    None
}
