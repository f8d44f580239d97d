// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a provisioner
//! configuration

use camino::Utf8Path;
use camino::Utf8PathBuf;
use parallel_task_set::DEFAULT_MAX_PARALLELISM;
use provisioner_common::logging::ConfigLogging;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Configuration for the provisioner
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Process-wide logging configuration.
    pub log: ConfigLogging,
    /// Where provisioning state is stored.
    pub database: provisioner_db::Config,
    /// How work is fanned out across instances.
    #[serde(default)]
    pub fanout: FanoutConfig,
    /// Timing of the decommission drain wait.
    #[serde(default)]
    pub decommission: DecommissionConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        if config_parsed.decommission.poll_interval_secs == 0 {
            return Err(LoadError::Invalid {
                path: path.into(),
                message: String::from(
                    "decommission.poll_interval_secs must be at least 1",
                ),
            });
        }
        Ok(config_parsed)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FanoutConfig {
    /// Upper bound on tasks running at once within one step
    pub max_parallelism: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        FanoutConfig { max_parallelism: DEFAULT_MAX_PARALLELISM }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DecommissionConfig {
    /// How often to ask whether the removed instances have drained
    pub poll_interval_secs: u64,
    /// How long to wait for them to drain before giving up
    pub timeout_secs: u64,
}

impl DecommissionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DecommissionConfig {
    fn default() -> Self {
        DecommissionConfig { poll_interval_secs: 5, timeout_secs: 3600 }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\"")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\"")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("invalid configuration in \"{path}\": {message}")]
    Invalid { path: Utf8PathBuf, message: String },
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;
    use provisioner_common::logging::ConfigLoggingIfExists;
    use provisioner_common::logging::ConfigLoggingLevel;

    fn write_config(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_config_nonexistent() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let error = Config::from_file(&path).unwrap_err();
        assert_matches!(error, LoadError::Io { path: p, err } => {
            assert_eq!(p, path);
            assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        });
    }

    #[test]
    fn test_config_bad_toml() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(&dir, "foo =");
        assert_matches!(Config::from_file(&path), Err(LoadError::Parse { .. }));
    }

    #[test]
    fn test_config_missing_database() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        );
        assert_matches!(Config::from_file(&path), Err(LoadError::Parse { err, .. }) => {
            assert!(err.to_string().contains("missing field `database`"));
        });
    }

    #[test]
    fn test_config_minimal_uses_defaults() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "debug"

            [database]
            path = "/var/db/provisioner.db"
            "#,
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(
            config.log,
            ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Debug }
        );
        assert_eq!(
            config.database,
            provisioner_db::Config::new("/var/db/provisioner.db".into())
        );
        assert_eq!(config.fanout.max_parallelism, DEFAULT_MAX_PARALLELISM);
        assert_eq!(config.decommission, DecommissionConfig::default());
    }

    #[test]
    fn test_config_zero_poll_interval() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [database]
            path = "/var/db/provisioner.db"

            [decommission]
            poll_interval_secs = 0
            timeout_secs = 60
            "#,
        );
        assert_matches!(
            Config::from_file(&path),
            Err(LoadError::Invalid { message, .. }) => {
                assert!(message.contains("poll_interval_secs"));
            }
        );
    }

    #[test]
    fn test_config_full() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "file"
            level = "trace"
            path = "/var/log/provisioner.log"
            if_exists = "append"

            [database]
            path = "/var/db/provisioner.db"
            pool_size = 4
            busy_timeout_ms = 250

            [fanout]
            max_parallelism = 32

            [decommission]
            poll_interval_secs = 10
            timeout_secs = 600
            "#,
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(
            config,
            Config {
                log: ConfigLogging::File {
                    level: ConfigLoggingLevel::Trace,
                    path: "/var/log/provisioner.log".into(),
                    if_exists: ConfigLoggingIfExists::Append,
                },
                database: provisioner_db::Config {
                    path: "/var/db/provisioner.db".into(),
                    pool_size: 4,
                    busy_timeout_ms: 250,
                },
                fanout: FanoutConfig { max_parallelism: 32 },
                decommission: DecommissionConfig {
                    poll_interval_secs: 10,
                    timeout_secs: 600,
                },
            }
        );
        assert_eq!(config.decommission.timeout(), Duration::from_secs(600));
    }
}
