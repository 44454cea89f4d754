//! User configuration.
//!
//! A single TOML file; every key is optional. Location priority:
//!
//! 1. `--config <path>`
//! 2. `MINITRACE_CONFIG_PATH`
//! 3. `<platform config dir>/minitrace/config.toml`
//!
//! A missing file means defaults. CLI flags override file values.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use etcetera::base_strategy::{BaseStrategy, choose_base_strategy};
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateOptions;
use crate::device::{Adb, OfflineRetry};

pub const CONFIG_PATH_ENV: &str = "MINITRACE_CONFIG_PATH";

/// Device log tags captured alongside a trace run.
pub const DEFAULT_LOGCAT_FILTER: &str = "art:I AndroidRuntime:E CrashAnrDetector:D ActivityManager:E SQLiteDatabase:E WindowManager:E ActivityThread:E Parcel:E *:F *:S";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// adb binary
    pub adb: String,
    /// Device serial (`adb -s`); unset uses adb's default device
    pub serial: Option<String>,
    /// Trace server binary on the device
    pub server_path: String,
    /// Hex log-flag word passed to the server
    pub log_flags: String,
    pub ready_timeout_secs: u64,
    pub offline_retries: u32,
    pub offline_backoff_ms: u64,
    /// Minimum gap between short adb commands; 0 disables pacing
    pub command_interval_ms: u64,
    pub logcat_filter: String,
    pub output_dir: PathBuf,
    pub main_thread: String,
    pub dispatch_class: String,
    pub dispatch_method: String,
}

impl Default for Config {
    fn default() -> Self {
        let aggregate = AggregateOptions::default();
        Self {
            adb: "adb".to_string(),
            serial: None,
            server_path: "/data/local/tmp/mtserver".to_string(),
            log_flags: "00010180".to_string(),
            ready_timeout_secs: 30,
            offline_retries: 2,
            offline_backoff_ms: 200,
            command_interval_ms: 0,
            logcat_filter: DEFAULT_LOGCAT_FILTER.to_string(),
            output_dir: PathBuf::from("mt_output"),
            main_thread: aggregate.main_thread,
            dispatch_class: aggregate.dispatch_class,
            dispatch_method: aggregate.dispatch_method,
        }
    }
}

impl Config {
    /// Load from the resolved location, or defaults when there is no file.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match config_path(explicit) {
            Some(path) => Self::load_from(&path, explicit.is_some()),
            None => Ok(Self::default()),
        }
    }

    /// Load `path`. A missing file is an error only when `required`.
    pub fn load_from(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                log::debug!("No config at {}; using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        log::debug!("Loading config from {}", path.display());
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_log_flags(&self.log_flags)?;
        if self.server_path.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "server_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.ready_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "ready_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn offline_retry(&self) -> OfflineRetry {
        OfflineRetry {
            retries: self.offline_retries,
            backoff: Duration::from_millis(self.offline_backoff_ms),
        }
    }

    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            main_thread: self.main_thread.clone(),
            dispatch_class: self.dispatch_class.clone(),
            dispatch_method: self.dispatch_method.clone(),
        }
    }

    /// adb handle configured from this file.
    pub fn adb(&self) -> Adb {
        Adb::new(&self.adb)
            .with_serial(self.serial.clone())
            .with_offline_retry(self.offline_retry())
            .with_command_interval(Duration::from_millis(self.command_interval_ms))
    }
}

/// The log-flag word, validated as up to eight hex digits.
pub fn parse_log_flags(flags: &str) -> Result<u32, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key: "log_flags",
        reason: format!("{reason}: {flags:?}"),
    };
    if flags.is_empty() || flags.len() > 8 {
        return Err(invalid("expected 1-8 hex digits"));
    }
    u32::from_str_radix(flags, 16).map_err(|_| invalid("not hexadecimal"))
}

/// Where the config file is, if anywhere.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    resolve_config_path(explicit, std::env::var_os(CONFIG_PATH_ENV), || {
        let strategy = choose_base_strategy().ok()?;
        Some(strategy.config_dir().join("minitrace").join("config.toml"))
    })
}

fn resolve_config_path(
    explicit: Option<&Path>,
    env: Option<OsString>,
    platform: impl FnOnce() -> Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    platform()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_path_priority() {
        let platform = || Some(PathBuf::from("/home/u/.config/minitrace/config.toml"));
        assert_eq!(
            resolve_config_path(Some(Path::new("/flag.toml")), Some("/env.toml".into()), platform),
            Some(PathBuf::from("/flag.toml"))
        );
        assert_eq!(
            resolve_config_path(None, Some("/env.toml".into()), platform),
            Some(PathBuf::from("/env.toml"))
        );
        assert_eq!(
            resolve_config_path(None, Some("".into()), platform),
            platform()
        );
        assert_eq!(resolve_config_path(None, None, || None), None);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "serial = \"emulator-5554\"\nready_timeout_secs = 5\nmain_thread = \"ui\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path, true).unwrap();
        assert_eq!(config.serial.as_deref(), Some("emulator-5554"));
        assert_eq!(config.ready_timeout(), Duration::from_secs(5));
        assert_eq!(config.aggregate_options().main_thread, "ui");
        assert_eq!(config.server_path, "/data/local/tmp/mtserver");
        assert_eq!(config.logcat_filter, DEFAULT_LOGCAT_FILTER);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert_eq!(Config::load_from(&path, false).unwrap(), Config::default());
        assert!(matches!(
            Config::load_from(&path, true),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "adb_path = \"/opt/adb\"\n").unwrap();
        assert!(matches!(
            Config::load_from(&path, true),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[rstest]
    #[case("00010180", Some(0x0001_0180))]
    #[case("ff", Some(0xff))]
    #[case("", None)]
    #[case("123456789", None)]
    #[case("xyz", None)]
    fn test_parse_log_flags(#[case] flags: &str, #[case] expected: Option<u32>) {
        assert_eq!(parse_log_flags(flags).ok(), expected);
    }

    #[test]
    fn test_invalid_flags_fail_validation() {
        let config = Config {
            log_flags: "nope".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().starts_with("invalid `log_flags`"), "{err}");
    }
}
