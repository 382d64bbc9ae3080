use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur while running the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot open IPC socket {path}: {source}")]
    IpcSocket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("restart state file {path} is malformed")]
    StateFile { path: PathBuf },

    #[error("fork failed: {0}")]
    Fork(nix::Error),

    #[error("exec failed: {0}")]
    Exec(nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
