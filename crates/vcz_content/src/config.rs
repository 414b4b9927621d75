//! Configuration file and environment.
//!
//! In order of priority:
//!
//! CLI Flags --overrides--> `VCZ_*` env vars --overrides--> File --overrides-->
//! Defaults
//!
//! The CLI is merged by the binary, this module loads the rest.
use std::path::{Path, PathBuf};

use config::{Environment, File};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::Error, wire::MAX_MESSAGE_SIZE};

const ENV_PREFIX: &str = "VCZ";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Where the files of every download are written, each one under a dir
    /// of its own.
    pub download_dir: PathBuf,

    /// Peers that send a message larger than this are disconnected.
    pub max_message_size: u32,

    /// Resize files to their full size when they are opened.
    pub allocate: bool,

    /// Outstanding block requests for each peer.
    pub max_requests: u32,

    /// Block requests of each peer that are queued until they are served,
    /// requests past this are ignored.
    pub max_incoming_requests: u32,

    /// One of `trace`, `debug`, `info`, `warn` or `error`.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = UserDirs::new()
            .and_then(|d| d.download_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            download_dir,
            max_message_size: MAX_MESSAGE_SIZE,
            allocate: false,
            max_requests: 10,
            max_incoming_requests: 250,
            log_level: "info".to_owned(),
        }
    }
}

impl Config {
    /// `~/.config/vcz`, or the equivalent of the platform.
    pub fn config_dir() -> Result<PathBuf, Error> {
        let dirs = ProjectDirs::from("", "", "vcz").ok_or(Error::HomeInvalid)?;
        Ok(dirs.config_dir().to_path_buf())
    }

    /// Load the configuration file of the user and the env vars.
    ///
    /// If the configuration file does not exist, one with the default values
    /// is created.
    pub fn load() -> Result<Self, Error> {
        let path = Self::config_dir()?.join("config.toml");

        if !path.exists() {
            Self::default().write(&path)?;
        }

        Self::load_from(&path)
    }

    /// Load the configuration file at `path`, which may not exist, and the
    /// env vars.
    pub fn load_from(path: &Path) -> Result<Self, Error> {
        Self::load_with_env(path, ENV_PREFIX)
    }

    /// Write the configuration as TOML to `path`, creating its dir.
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let s = toml::to_string(self)?;
        std::fs::write(path, s)?;

        debug!("wrote configuration to {path:?}");

        Ok(())
    }

    fn load_with_env(path: &Path, prefix: &str) -> Result<Self, Error> {
        let config = config::Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix(prefix).try_parsing(true))
            .build()?
            .try_deserialize::<Config>()?;

        debug!("loaded configuration {config:?}");

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use rand::{distributions::Alphanumeric, Rng};

    use super::*;

    fn random_name() -> String {
        rand::thread_rng()
            .sample_iter(Alphanumeric)
            .take(16)
            .map(char::from)
            .collect()
    }

    #[test]
    fn missing_file_gives_defaults() -> Result<(), Error> {
        let path = std::env::temp_dir().join(random_name()).join("config.toml");
        let config = Config::load_from(&path)?;
        assert_eq!(config, Config::default());
        assert_eq!(config.max_message_size, 2 * 1024 * 1024);
        Ok(())
    }

    #[test]
    fn file_and_env() -> Result<(), Error> {
        let dir = std::env::temp_dir().join(random_name());
        let path = dir.join("config.toml");

        std::fs::create_dir_all(&dir)?;
        std::fs::write(&path, "download_dir = \"/tmp/vcz\"\nmax_requests = 3\n")?;

        let prefix = format!("VCZ{}", random_name().to_uppercase());
        std::env::set_var(format!("{prefix}_ALLOCATE"), "true");
        std::env::set_var(format!("{prefix}_MAX_REQUESTS"), "7");

        let config = Config::load_with_env(&path, &prefix)?;

        assert_eq!(config.download_dir, PathBuf::from("/tmp/vcz"));
        // env wins over the file.
        assert_eq!(config.max_requests, 7);
        assert!(config.allocate);
        assert_eq!(config.log_level, "info");

        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn write_then_load() -> Result<(), Error> {
        let dir = std::env::temp_dir().join(random_name());
        let path = dir.join("nested/config.toml");

        let config = Config {
            allocate: true,
            log_level: "debug".into(),
            ..Default::default()
        };
        config.write(&path)?;

        assert_eq!(Config::load_from(&path)?, config);

        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}
