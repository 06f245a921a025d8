//! Configuration for the cpcache daemon.
//!
//! Loaded from a TOML file (`/etc/cpcache/cpcache.toml` by default);
//! missing optional keys fall back to serde defaults, and the whole
//! configuration is validated once at startup so a broken file fails the
//! boot instead of the first request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Where the daemon looks for its configuration unless told otherwise.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cpcache/cpcache.toml";

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML or does not match the schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
    /// The file parsed but describes an unusable configuration.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Human-readable description of the problem.
        reason: String,
    },
}

/// How the ordered mirror list is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorSelectionMethod {
    /// Serve the configured list as-is, rotated round-robin.
    #[default]
    Predefined,
    /// Periodically score the configured candidates by latency and serve
    /// the survivors in ascending score order.
    Auto,
}

/// Settings for the signed wanted-packages upload endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RecvPackagesConfig {
    /// Shared secret, given either hex-encoded or as raw bytes.
    pub key: String,
    /// Where uploaded package lists are written, one file per host.
    /// Defaults to `wanted_packages` under the cache directory.
    #[serde(default)]
    pub wanted_packages_dir: Option<PathBuf>,
}

impl RecvPackagesConfig {
    /// The shared secret as bytes: hex-decoded when the key is valid hex,
    /// the raw string bytes otherwise.
    pub fn secret_bytes(&self) -> Vec<u8> {
        hex::decode(&self.key).unwrap_or_else(|_| self.key.clone().into_bytes())
    }
}

/// Settings for automatic mirror scoring (`mirror_selection_method = "auto"`).
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorsAutoConfig {
    /// Only probe https mirrors.
    #[serde(default = "default_true")]
    pub https_required: bool,
    /// Probe mirrors over IPv4.
    #[serde(default = "default_true")]
    pub ipv4: bool,
    /// Probe mirrors over IPv6.
    #[serde(default)]
    pub ipv6: bool,
    /// Mirrors scoring above this (seconds of probe latency) are dropped.
    #[serde(default = "default_max_score")]
    pub max_score: f64,
    /// Per-probe timeout in seconds.
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,
    /// Seconds between re-scoring rounds.
    #[serde(default = "default_test_interval")]
    pub test_interval: u64,
}

impl Default for MirrorsAutoConfig {
    fn default() -> Self {
        Self {
            https_required: true,
            ipv4: true,
            ipv6: false,
            max_score: default_max_score(),
            timeout: default_probe_timeout(),
            test_interval: default_test_interval(),
        }
    }
}

impl MirrorsAutoConfig {
    /// Per-probe timeout as a [`Duration`].
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Interval between re-scoring rounds as a [`Duration`].
    pub fn test_interval(&self) -> Duration {
        Duration::from_secs(self.test_interval)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_score() -> f64 {
    2.5
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_test_interval() -> u64 {
    3600
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TCP port to listen on.
    pub port: u16,
    /// Root of the on-disk cache.
    pub cache_directory: PathBuf,
    /// Also listen on IPv6.
    #[serde(default)]
    pub ipv6_enabled: bool,
    /// Ordered upstream mirror base URLs.
    #[serde(default)]
    pub mirrors_predefined: Vec<String>,
    /// Mirrors excluded from selection even when listed or scored.
    #[serde(default)]
    pub mirrors_blacklist: Vec<String>,
    /// How the mirror list handed to downloads is produced.
    #[serde(default)]
    pub mirror_selection_method: MirrorSelectionMethod,
    /// Signed upload endpoint settings; uploads are rejected when absent.
    #[serde(default)]
    pub recv_packages: Option<RecvPackagesConfig>,
    /// Mirror scoring settings, used in `auto` mode.
    #[serde(default)]
    pub mirrors_auto: Option<MirrorsAutoConfig>,
}

impl Config {
    /// Reads and validates the configuration file at `path`.
    ///
    /// # Errors
    /// [`ConfigError::Read`] / [`ConfigError::Parse`] when the file is
    /// unreadable or malformed, [`ConfigError::Invalid`] when it parsed
    /// but cannot describe a working daemon.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde cannot express.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candidate_mirrors().next().is_none() {
            return Err(ConfigError::Invalid {
                reason: "mirrors_predefined must contain at least one non-blacklisted mirror"
                    .to_string(),
            });
        }
        for mirror in &self.mirrors_predefined {
            let parsed = url::Url::parse(mirror).map_err(|error| ConfigError::Invalid {
                reason: format!("mirror {mirror:?} is not a valid URL: {error}"),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid {
                    reason: format!("mirror {mirror:?} must use http or https"),
                });
            }
        }
        if let Some(recv) = &self.recv_packages {
            if recv.key.is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "recv_packages.key must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Configured mirrors minus the blacklist, in configuration order,
    /// with trailing slashes trimmed.
    pub fn candidate_mirrors(&self) -> impl Iterator<Item = String> + '_ {
        self.mirrors_predefined
            .iter()
            .filter(|mirror| !self.mirrors_blacklist.contains(mirror))
            .map(|mirror| mirror.trim_end_matches('/').to_string())
    }

    /// Mirror scoring settings, falling back to defaults when the
    /// `[mirrors_auto]` section is absent.
    pub fn mirrors_auto(&self) -> MirrorsAutoConfig {
        self.mirrors_auto.clone().unwrap_or_default()
    }

    /// Directory receiving signed wanted-packages uploads.
    pub fn wanted_packages_dir(&self) -> PathBuf {
        self.recv_packages
            .as_ref()
            .and_then(|recv| recv.wanted_packages_dir.clone())
            .unwrap_or_else(|| self.cache_directory.join("wanted_packages"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        port = 7078
        cache_directory = "/var/cache/cpcache"
        ipv6_enabled = true
        mirrors_predefined = ["https://mirror.one/archlinux/", "http://mirror.two/arch"]
        mirrors_blacklist = ["http://mirror.two/arch"]
        mirror_selection_method = "auto"

        [recv_packages]
        key = "deadbeef"

        [mirrors_auto]
        https_required = true
        ipv4 = true
        ipv6 = false
        max_score = 1.5
        timeout = 3
        test_interval = 600
    "#;

    #[test]
    fn parses_full_configuration() {
        let config: Config = toml::from_str(FULL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.port, 7078);
        assert_eq!(config.mirror_selection_method, MirrorSelectionMethod::Auto);
        assert_eq!(
            config.candidate_mirrors().collect::<Vec<_>>(),
            vec!["https://mirror.one/archlinux".to_string()]
        );
        assert_eq!(config.mirrors_auto().max_score, 1.5);
        assert_eq!(config.mirrors_auto().test_interval(), Duration::from_secs(600));
    }

    #[test]
    fn minimal_configuration_gets_defaults() {
        let config: Config = toml::from_str(
            r#"
            port = 7078
            cache_directory = "/tmp/cpcache"
            mirrors_predefined = ["https://mirror.one/archlinux"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert!(!config.ipv6_enabled);
        assert_eq!(
            config.mirror_selection_method,
            MirrorSelectionMethod::Predefined
        );
        assert!(config.recv_packages.is_none());
        assert_eq!(
            config.wanted_packages_dir(),
            PathBuf::from("/tmp/cpcache/wanted_packages")
        );
    }

    #[test]
    fn rejects_empty_mirror_list() {
        let config: Config = toml::from_str(
            r#"
            port = 7078
            cache_directory = "/tmp/cpcache"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn rejects_non_http_mirror() {
        let config: Config = toml::from_str(
            r#"
            port = 7078
            cache_directory = "/tmp/cpcache"
            mirrors_predefined = ["ftp://mirror.one/archlinux"]
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn secret_accepts_hex_and_raw() {
        let hex_key = RecvPackagesConfig {
            key: "deadbeef".to_string(),
            wanted_packages_dir: None,
        };
        assert_eq!(hex_key.secret_bytes(), vec![0xde, 0xad, 0xbe, 0xef]);

        let raw_key = RecvPackagesConfig {
            key: "not hex!".to_string(),
            wanted_packages_dir: None,
        };
        assert_eq!(raw_key.secret_bytes(), b"not hex!".to_vec());
    }
}
