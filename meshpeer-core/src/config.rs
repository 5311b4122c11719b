//! Session configuration supplied by the host at construction.

use std::time::Duration;

use serde::Deserialize;

use crate::discovery::DiscoveryInfo;
use crate::error::ConfigError;
use crate::transfer::SendMode;

/// Default outbound invitation timeout in seconds.
pub const DEFAULT_INVITE_TIMEOUT_SECS: u64 = 30;

const MAX_SERVICE_TYPE_LEN: usize = 15;
const MAX_DISPLAY_NAME_LEN: usize = 63;

/// Everything the core needs to know about the local participant and its policies.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Discovery namespace; unrelated applications use different values.
    pub service_type: String,
    /// Display name of the local peer. The core never looks this up itself.
    pub display_name: String,
    #[serde(default = "default_invite_timeout_secs")]
    pub invite_timeout_secs: u64,
    #[serde(default)]
    pub send_mode: SendMode,
    /// Evict discovery entries not refreshed within this window. `None`: lost events only.
    #[serde(default)]
    pub discovery_staleness_secs: Option<u64>,
    /// Metadata advertised alongside the local identity.
    #[serde(default)]
    pub discovery_info: Option<DiscoveryInfo>,
}

fn default_invite_timeout_secs() -> u64 {
    DEFAULT_INVITE_TIMEOUT_SECS
}

impl SessionConfig {
    pub fn new(service_type: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            display_name: display_name.into(),
            invite_timeout_secs: DEFAULT_INVITE_TIMEOUT_SECS,
            send_mode: SendMode::default(),
            discovery_staleness_secs: None,
            discovery_info: None,
        }
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn discovery_staleness(&self) -> Option<Duration> {
        self.discovery_staleness_secs.map(Duration::from_secs)
    }

    /// Check the Bonjour-style service type rule and the display name length.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let st = &self.service_type;
        if st.is_empty() || st.len() > MAX_SERVICE_TYPE_LEN {
            return Err(ConfigError::ServiceTypeLength(st.len()));
        }
        if !st
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(ConfigError::ServiceTypeCharset(st.clone()));
        }
        if st.starts_with('-') || st.ends_with('-') || st.contains("--") {
            return Err(ConfigError::ServiceTypeHyphen(st.clone()));
        }
        let name_len = self.display_name.len();
        if name_len == 0 || name_len > MAX_DISPLAY_NAME_LEN {
            return Err(ConfigError::DisplayNameLength(name_len));
        }
        Ok(())
    }
}
