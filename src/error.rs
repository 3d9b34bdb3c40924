//! Typed errors for the layers that want to match on a specific variant.
//! Everything above these layers collapses into `anyhow::Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no command to start in child terminal")]
    MissingCommand,

    #[error("invalid credential, format: username:password")]
    InvalidCredential,

    #[error("invalid reconnect time: {0}")]
    InvalidReconnect(String),

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("client-option must be valid JSON: {0}")]
    InvalidClientOption(#[from] serde_json::Error),

    #[error("client-option JSON exceeds 254 characters")]
    ClientOptionTooLong,

    #[error("cannot stat index path {path}: {source}")]
    IndexNotFound {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("index path {0} is a directory")]
    IndexIsDirectory(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to allocate pty: {0}")]
    Alloc(String),

    #[error("failed to spawn command: {0}")]
    Spawn(String),

    #[error("failed to resize pty: {0}")]
    Resize(String),

    #[error("short write to pty ({written} of {requested} bytes)")]
    ShortWrite { written: usize, requested: usize },

    #[error("pty read error: {0}")]
    Read(String),

    #[error("failed to signal child {pid}: {source}")]
    Signal { pid: i32, source: nix::Error },
}
