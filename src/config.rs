// SPDX-License-Identifier: GPL-3.0-only

//! User configuration handling

use crate::backends::capture::BackendKind;
use crate::constants::VIDEO_READY_TIMEOUT;
use crate::engines::EngineProfile;
use crate::reconcile::AcceptancePolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Directory name under the user config root
const CONFIG_DIR: &str = "codescan";
/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture backend to use
    pub backend: BackendKind,
    /// Last used camera device id
    pub last_device_id: Option<String>,
    /// Device class override; auto-detected when unset
    pub engine_profile: Option<EngineProfile>,
    /// Seconds to wait for the first frame before giving up
    pub ready_timeout_secs: u64,
    /// Per-pipeline acceptance thresholds and the debounce window
    pub acceptance: AcceptancePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            last_device_id: None,
            engine_profile: None,
            ready_timeout_secs: VIDEO_READY_TIMEOUT.as_secs(),
            acceptance: AcceptancePolicy::default(),
        }
    }
}

impl Config {
    /// Load the configuration, falling back to defaults on any problem
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Configuration loaded");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Malformed configuration, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persist the configuration as pretty-printed JSON
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::config_path() else {
            return Err(std::io::Error::other("no config directory on this system"));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)
            .map_err(std::io::Error::other)?;
        std::fs::write(&path, contents)
    }

    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// First-frame wait budget
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Effective device class: the override, or host detection
    pub fn profile(&self) -> EngineProfile {
        self.engine_profile.unwrap_or_else(EngineProfile::detect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.ready_timeout(), VIDEO_READY_TIMEOUT);
        assert_eq!(config.acceptance.debounce_ms, 1500);
        assert!(config.last_device_id.is_none());
    }

    #[test]
    fn roundtrips_through_json() {
        let mut config = Config::default();
        config.last_device_id = Some("/dev/video2".to_string());
        config.engine_profile = Some(EngineProfile::Constrained);

        let json = serde_json::to_string(&config).expect("serializes");
        let parsed: Config = serde_json::from_str(&json).expect("parses");
        assert_eq!(parsed, config);
    }

    #[test]
    fn unknown_and_missing_fields_fall_back() {
        // Older configs without newer fields still parse
        let parsed: Config = serde_json::from_str(r#"{"ready_timeout_secs": 5}"#).expect("parses");
        assert_eq!(parsed.ready_timeout_secs, 5);
        assert_eq!(parsed.acceptance, AcceptancePolicy::default());
    }
}
