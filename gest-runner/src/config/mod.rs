// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for gest.
//!
//! Configuration is read from an embedded default, overlaid with an optional `gest.toml` at the
//! project root (or an explicit file passed in on the command line).

mod parallel;

pub use parallel::*;

use crate::{errors::ConfigParseError, runner::AfterAllPolicy};
use camino::Utf8Path;
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::time::Duration;

/// Overall configuration for gest.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GestConfig {
    /// The number of runner slots.
    pub parallel: Parallel,

    /// The per-unit timeout, unless a module overrides it.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Whether to run test files in worker processes.
    pub multiprocessing: bool,

    /// How `after_all` failures affect their suite.
    pub after_all_policy: AfterAllPolicy,
}

impl GestConfig {
    /// The default location of the config within the project root.
    pub const CONFIG_PATH: &'static str = "gest.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// Reads the config from `root/gest.toml`, or from `config_file` if given.
    ///
    /// A missing `gest.toml` is fine and yields the defaults, but an explicit `config_file` must
    /// exist.
    pub fn from_sources(
        root: impl AsRef<Utf8Path>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let file = root.as_ref().join(Self::CONFIG_PATH);
                let source = File::new(file.as_str(), FileFormat::Toml).required(false);
                (file, source)
            }
        };

        Self::make_default_config()
            .add_source(source)
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| ConfigParseError::new(config_file, err))
    }

    /// Returns the default config.
    pub fn default_config() -> Self {
        let config = Self::make_default_config()
            .build()
            .and_then(|config| config.try_deserialize());
        match config {
            Ok(config) => config,
            Err(err) => panic!("default config is always valid: {err}"),
        }
    }

    fn make_default_config() -> config::ConfigBuilder<config::builder::DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config = GestConfig::default_config();
        assert_eq!(config.parallel, Parallel::Count(2));
        assert_eq!(config.default_timeout, Duration::from_secs(5));
        assert!(!config.multiprocessing);
        assert_eq!(config.after_all_policy, AfterAllPolicy::ReportOnly);
    }

    #[test]
    fn missing_project_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = GestConfig::from_sources(dir.path(), None).unwrap();
        assert_eq!(config.parallel, Parallel::Count(2));
        assert!(!config.multiprocessing);
    }

    #[test]
    fn project_config_overrides_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(GestConfig::CONFIG_PATH),
            indoc! {r#"
                parallel = "num-cpus"
                default-timeout = "250ms"
                multiprocessing = true
                after-all-policy = "fail-suite"
            "#},
        )
        .unwrap();

        let config = GestConfig::from_sources(dir.path(), None).unwrap();
        assert_eq!(config.parallel, Parallel::NumCpus);
        assert_eq!(config.default_timeout, Duration::from_millis(250));
        assert!(config.multiprocessing);
        assert_eq!(config.after_all_policy, AfterAllPolicy::FailSuite);
    }

    #[test]
    fn zero_parallel_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, "parallel = 0\n").unwrap();

        let err = GestConfig::from_sources(dir.path(), Some(&file)).unwrap_err();
        assert_eq!(err.config_file(), &file);
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("missing.toml");
        GestConfig::from_sources(dir.path(), Some(&file)).unwrap_err();
    }
}
