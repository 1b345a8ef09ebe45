/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Fabric configuration and socket path handling.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Default delay before a disconnected client retries the rendezvous
/// socket, in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;

/// Configuration shared by servers and clients in one domain.
///
/// All fields have defaults, so `FabricConfig::default()` yields a working
/// configuration for the `default` domain. Values can also be loaded from
/// `$XDG_CONFIG_HOME/ipcio/fabric.toml` and overridden field-by-field.
///
/// # Example Configuration File
///
/// ```toml
/// domain = "build-farm"
/// encoding = "utf8"
/// socket_dir = "/tmp"
/// verbose = false
/// reconnect_delay_ms = 2000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Domain name selecting the rendezvous socket path.
    pub domain: String,

    /// Wire text encoding. The codec is UTF-8; any other value is accepted
    /// but logged and treated as UTF-8.
    pub encoding: String,

    /// Directory holding the domain's socket files.
    ///
    /// The default of `/tmp` gives the canonical rendezvous path
    /// `/tmp/IPC.io.<domain>`.
    pub socket_dir: PathBuf,

    /// Friendly name for a client. Servers ignore this field.
    ///
    /// If `None`, the client takes a random hex UUID as its name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Enables additional per-frame diagnostic logging.
    pub verbose: bool,

    /// Delay before a disconnected client retries, in milliseconds.
    #[serde(rename = "reconnect_delay_ms")]
    pub reconnect_delay: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            domain: "default".to_string(),
            encoding: "utf8".to_string(),
            socket_dir: PathBuf::from("/tmp"),
            name: None,
            verbose: false,
            reconnect_delay: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl FabricConfig {
    /// Creates a configuration for the given domain with everything else
    /// defaulted.
    #[must_use]
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Load fabric configuration from XDG-compliant locations.
    ///
    /// Attempts to load `$XDG_CONFIG_HOME/ipcio/fabric.toml`, falling back
    /// to `~/.config/ipcio/fabric.toml`. If no configuration file is found
    /// or it cannot be parsed, returns the default configuration.
    #[must_use]
    pub fn load() -> Self {
        let xdg_dirs = match xdg::BaseDirectories::with_prefix("ipcio") {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!("Failed to initialize XDG directories for fabric config: {}", e);
                return Self::default();
            }
        };

        xdg_dirs.find_config_file("fabric.toml").map_or_else(
            Self::default,
            |path| {
                info!("Loading fabric configuration from: {}", path.display());
                match std::fs::read_to_string(&path) {
                    Ok(config_str) => match toml::from_str::<Self>(&config_str) {
                        Ok(config) => config,
                        Err(e) => {
                            warn!(
                                "Failed to parse fabric configuration file {}: {}",
                                path.display(),
                                e
                            );
                            Self::default()
                        }
                    },
                    Err(e) => {
                        warn!(
                            "Failed to read fabric configuration file {}: {}",
                            path.display(),
                            e
                        );
                        Self::default()
                    }
                }
            },
        )
    }

    /// Path of the shared rendezvous socket for this domain.
    #[must_use]
    pub fn rendezvous_path(&self) -> PathBuf {
        self.socket_dir.join(format!("IPC.io.{}", self.domain))
    }

    /// Path of the per-client unique socket for the given channel id.
    #[must_use]
    pub fn unique_path(&self, channel_id: &str) -> PathBuf {
        self.socket_dir
            .join(format!("IPC.io.{}.{}", self.domain, channel_id))
    }

    /// Resolve the client friendly name, generating a random hex UUID when
    /// none was configured.
    #[must_use]
    pub fn resolve_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get the reconnect delay as a `Duration`.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay)
    }

    /// Warn once about an encoding the codec does not implement.
    pub(crate) fn check_encoding(&self) {
        if !self.encoding.eq_ignore_ascii_case("utf8")
            && !self.encoding.eq_ignore_ascii_case("utf-8")
        {
            warn!(
                encoding = %self.encoding,
                "unsupported encoding configured, frames are read and written as UTF-8"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FabricConfig::default();
        assert_eq!(config.domain, "default");
        assert_eq!(config.encoding, "utf8");
        assert_eq!(config.reconnect_delay, 2_000);
        assert!(!config.verbose);
        assert!(config.name.is_none());
    }

    #[test]
    fn test_rendezvous_path_default_domain() {
        let config = FabricConfig::default();
        assert_eq!(config.rendezvous_path(), PathBuf::from("/tmp/IPC.io.default"));
    }

    #[test]
    fn test_unique_path() {
        let config = FabricConfig::for_domain("d");
        assert_eq!(
            config.unique_path("00aabb"),
            PathBuf::from("/tmp/IPC.io.d.00aabb")
        );
    }

    #[test]
    fn test_socket_dir_override() {
        let mut config = FabricConfig::for_domain("d");
        config.socket_dir = PathBuf::from("/run/fabric");
        assert_eq!(config.rendezvous_path(), PathBuf::from("/run/fabric/IPC.io.d"));
    }

    #[test]
    fn test_resolve_name_configured() {
        let mut config = FabricConfig::default();
        config.name = Some("worker-a".to_string());
        assert_eq!(config.resolve_name(), "worker-a");
    }

    #[test]
    fn test_resolve_name_generated() {
        let config = FabricConfig::default();
        let name = config.resolve_name();
        assert_eq!(name.len(), 32);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, config.resolve_name());
    }

    #[test]
    fn test_reconnect_delay_duration() {
        let mut config = FabricConfig::default();
        config.reconnect_delay = 100;
        assert_eq!(config.reconnect_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_config_serialization() {
        let config = FabricConfig::for_domain("build-farm");
        let toml_str = toml::to_string(&config).unwrap();

        let parsed: FabricConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.domain, "build-farm");
        assert_eq!(parsed.reconnect_delay, config.reconnect_delay);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: FabricConfig = toml::from_str(r#"domain = "d""#).unwrap();
        assert_eq!(parsed.domain, "d");
        assert_eq!(parsed.encoding, "utf8");
        assert_eq!(parsed.reconnect_delay, DEFAULT_RECONNECT_DELAY_MS);
    }
}
