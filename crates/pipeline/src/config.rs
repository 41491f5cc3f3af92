//! Configuration file.
//!
//! Every field has a default, so a missing file (or an empty one) is a
//! valid configuration.

use std::{path::PathBuf, time::Duration};

use snafu::prelude::*;

use crate::{wait::WaitConfig, Error, ParseConfigSnafu, ReadConfigSnafu};

pub const DEFAULT_CONFIG_FILE: &str = "pipeline.toml";

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Prefix of every resource name and parameter key.
    pub project: String,
    /// Region used when neither the command line nor the environment set one.
    pub region: Option<String>,
    pub templates_dir: PathBuf,
    pub dockerfile: PathBuf,
    pub build_context: PathBuf,
    pub container_port: u16,
    pub storage: StorageConfig,
    pub logs: LogsConfig,
    pub firehose: FirehoseConfig,
    pub wait: WaitSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: "data-pipeline".to_owned(),
            region: None,
            templates_dir: PathBuf::from("task-definitions"),
            dockerfile: PathBuf::from("Dockerfile"),
            build_context: PathBuf::from("."),
            container_port: 8080,
            storage: Default::default(),
            logs: Default::default(),
            firehose: Default::default(),
            wait: Default::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub archive_after_days: i32,
    pub expire_after_days: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            archive_after_days: 90,
            expire_after_days: 365,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogsConfig {
    pub retention_days: i32,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self { retention_days: 14 }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirehoseConfig {
    pub buffer_size_mb: i32,
    pub buffer_interval_secs: i32,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            buffer_size_mb: 5,
            buffer_interval_secs: 300,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitSettings {
    pub interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for WaitSettings {
    fn default() -> Self {
        let WaitConfig {
            interval,
            max_attempts,
        } = WaitConfig::default();
        Self {
            interval_secs: interval.as_secs(),
            max_attempts,
        }
    }
}

impl From<&WaitSettings> for WaitConfig {
    fn from(settings: &WaitSettings) -> Self {
        WaitConfig {
            interval: Duration::from_secs(settings.interval_secs),
            max_attempts: settings.max_attempts,
        }
    }
}

impl Config {
    pub fn from_toml_str(path: impl Into<PathBuf>, contents: &str) -> Result<Self, Error> {
        toml::from_str(contents).context(ParseConfigSnafu { path: path.into() })
    }

    /// Load the config at `path`, falling back to defaults when it does not
    /// exist.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                log::debug!("read config from {path:?}");
                Self::from_toml_str(path, &contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no config at {path:?}, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(source).context(ReadConfigSnafu { path }),
        }
    }

    pub fn wait_config(&self) -> WaitConfig {
        WaitConfig::from(&self.wait)
    }

    /// Full path to a service's task-definition template.
    pub fn template_path(&self, service: crate::names::Service) -> PathBuf {
        self.templates_dir.join(service.template_file())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = Config::from_toml_str("pipeline.toml", "").unwrap();
        assert_eq!(Config::default(), config);
        assert_eq!(14, config.logs.retention_days);
        assert_eq!("data-pipeline", config.project);
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let config = Config::from_toml_str(
            "pipeline.toml",
            r#"
            project = "acme"
            region = "eu-central-1"

            [storage]
            expire_after_days = 730

            [wait]
            interval_secs = 2
            "#,
        )
        .unwrap();
        assert_eq!("acme", config.project);
        assert_eq!(Some("eu-central-1".to_owned()), config.region);
        assert_eq!(90, config.storage.archive_after_days);
        assert_eq!(730, config.storage.expire_after_days);
        assert_eq!(
            WaitConfig {
                interval: Duration::from_secs(2),
                max_attempts: 60,
            },
            config.wait_config()
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str("pipeline.toml", "projet = \"typo\"").unwrap_err();
        assert!(matches!(err, Error::ParseConfig { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_default() {
        let config = Config::load("/definitely/not/here/pipeline.toml")
            .await
            .unwrap();
        assert_eq!(Config::default(), config);
    }
}
