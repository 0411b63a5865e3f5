//! Configuration for the container init.
//!
//! The launcher may pass overrides via the `CONTAINER_INIT_CONFIG`
//! environment variable as JSON. Every field has a default, so an unset
//! variable yields the stock layout.

use std::os::fd::RawFd;
use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::process::KillScope;
use crate::transport::MAX_MESSAGE_SIZE;

pub const CONFIG_ENV: &str = "CONTAINER_INIT_CONFIG";

/// Smallest receive buffer that still holds a realistic execve command.
const MIN_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Inherited descriptor of the control socket.
    #[serde(default = "default_socket_fd")]
    pub socket_fd: RawFd,

    /// Scratch directory emptied by `reset`.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// Working directory of supervised programs, also emptied by `reset`.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Receive buffer size; messages larger than this are rejected.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// What a kill during execve reaches.
    #[serde(default)]
    pub kill_scope: KillScope,

    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

const fn default_socket_fd() -> RawFd {
    3
}

fn default_tmp_dir() -> PathBuf {
    "/tmp".into()
}

fn default_work_dir() -> PathBuf {
    "/w".into()
}

const fn default_buffer_size() -> usize {
    MAX_MESSAGE_SIZE
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_fd: default_socket_fd(),
            tmp_dir: default_tmp_dir(),
            work_dir: default_work_dir(),
            buffer_size: default_buffer_size(),
            kill_scope: KillScope::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from `CONTAINER_INIT_CONFIG`, falling back to defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json).with_context(|| format!("invalid {CONFIG_ENV}")),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("cannot read {CONFIG_ENV}")),
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.socket_fd >= 0, "socket_fd must not be negative");
        ensure!(
            self.tmp_dir.is_absolute() && self.work_dir.is_absolute(),
            "tmp_dir and work_dir must be absolute paths"
        );
        ensure!(
            (MIN_BUFFER_SIZE..=MAX_MESSAGE_SIZE).contains(&self.buffer_size),
            "buffer_size must be between {MIN_BUFFER_SIZE} and {MAX_MESSAGE_SIZE}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.socket_fd, 3);
        assert_eq!(config.tmp_dir, PathBuf::from("/tmp"));
        assert_eq!(config.work_dir, PathBuf::from("/w"));
        assert_eq!(config.buffer_size, MAX_MESSAGE_SIZE);
        assert_eq!(config.kill_scope, KillScope::Namespace);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn overrides() {
        let json = r#"{
            "socket_fd": 5,
            "tmp_dir": "/scratch",
            "work_dir": "/job",
            "buffer_size": 8192,
            "kill_scope": "process_group",
            "log_level": "debug"
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.socket_fd, 5);
        assert_eq!(config.tmp_dir, PathBuf::from("/scratch"));
        assert_eq!(config.work_dir, PathBuf::from("/job"));
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.kill_scope, KillScope::ProcessGroup);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn rejects_relative_dirs() {
        assert!(Config::from_json(r#"{"work_dir": "w"}"#).is_err());
    }

    #[test]
    fn rejects_bad_buffer_size() {
        assert!(Config::from_json(r#"{"buffer_size": 16}"#).is_err());
        assert!(Config::from_json(r#"{"buffer_size": 1048576}"#).is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(Config::from_json(r#"{"max_fds": 4}"#).is_err());
    }

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }
}
