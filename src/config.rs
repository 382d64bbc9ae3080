//! Gateway configuration
//!
//! Deployment settings come from an optional TOML file; the CLI may
//! override individual fields after loading. Account data lives here too:
//! persistent storage is an external collaborator, so the `accounts` table
//! is what seeds the in-memory credential store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{GatewayError, Result};

/// How gateway processes are arranged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// One process serving all client connections
    #[default]
    Daemon,
    /// A coordinator process plus one forked worker per connection
    ForkDaemon,
    /// One process per invocation, client socket on stdin
    Inetd,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to listen on
    pub interface: String,
    pub port: u16,
    pub run_mode: RunMode,

    /// Name the gateway presents in replies and prefixes
    pub hostname: String,
    /// Nick of the control-channel service user
    pub service_nick: String,
    /// Name of the control channel every client joins at login
    pub control_channel: String,

    /// Global pre-shared secret; when set, clients must PASS it before
    /// registration completes
    pub auth_password: Option<String>,
    /// Secret for the OPER command
    pub oper_password: Option<String>,

    /// Message-of-the-day file
    pub motd_file: Option<PathBuf>,

    /// Unix socket path the coordinator listens on for detached workers
    pub ipc_socket: Option<PathBuf>,

    /// Seconds without a PONG before a client is dropped
    pub ping_timeout: u64,

    /// Whether live sessions may be taken over by a new connection
    /// presenting the same credentials
    pub allow_takeover: bool,

    /// Known accounts (nick -> password), standing in for external storage
    pub accounts: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: "127.0.0.1".to_string(),
            port: 6667,
            run_mode: RunMode::default(),
            hostname: "localhost".to_string(),
            service_nick: "root".to_string(),
            control_channel: "&gateway".to_string(),
            auth_password: None,
            oper_password: None,
            motd_file: None,
            ipc_socket: None,
            ping_timeout: 300,
            allow_takeover: true,
            accounts: HashMap::new(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let config: Config =
                    toml::from_str(&content).map_err(|source| GatewayError::ConfigParse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                config.validate()?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() || self.hostname.contains(' ') {
            return Err(GatewayError::Config(format!(
                "invalid hostname: {:?}",
                self.hostname
            )));
        }
        if !self.control_channel.starts_with(['&', '#']) {
            return Err(GatewayError::Config(format!(
                "control channel must start with & or #: {:?}",
                self.control_channel
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.interface, self.port)
    }
}
