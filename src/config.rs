//! Command-line parsing and the immutable [`Config`] derived from it.

use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::{ArgAction, Parser};

use crate::error::ConfigError;

/// ttyd-style argv, long/short flags matching the wire spec one-for-one.
#[derive(Debug, Parser)]
#[command(
    name = "webtty",
    version,
    about = "Share a local terminal over the web",
    disable_version_flag = true
)]
pub struct Cli {
    /// Print version information and exit
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    pub version: (),

    /// Port to listen on (use 0 for a random port)
    #[arg(short = 'p', long = "port", default_value_t = 7681)]
    pub port: u16,

    /// Network interface to bind (eg: eth0), or a UNIX domain socket path (eg: /var/run/webtty.sock)
    #[arg(short = 'i', long = "interface")]
    pub interface: Option<String>,

    /// Credential for Basic Authentication (format: username:password)
    #[arg(short = 'c', long = "credential")]
    pub credential: Option<String>,

    /// User id to run the child process with
    #[arg(short = 'u', long = "uid")]
    pub uid: Option<u32>,

    /// Group id to run the child process with
    #[arg(short = 'g', long = "gid")]
    pub gid: Option<u32>,

    /// Signal to send the command on close (default: SIGHUP)
    #[arg(short = 's', long = "signal", default_value = "SIGHUP")]
    pub signal: String,

    /// Seconds the client should wait before reconnecting
    #[arg(short = 'r', long = "reconnect", default_value_t = 10)]
    pub reconnect: i64,

    /// Custom index.html path
    #[arg(short = 'I', long = "index")]
    pub index: Option<String>,

    /// Enable TLS
    #[arg(short = 'S', long = "ssl")]
    pub ssl: bool,

    /// TLS certificate file path
    #[arg(short = 'C', long = "ssl-cert")]
    pub ssl_cert: Option<PathBuf>,

    /// TLS key file path
    #[arg(short = 'K', long = "ssl-key")]
    pub ssl_key: Option<PathBuf>,

    /// TLS CA file path, for client certificate verification
    #[arg(short = 'A', long = "ssl-ca")]
    pub ssl_ca: Option<PathBuf>,

    /// Do not allow clients to write to the TTY
    #[arg(short = 'R', long = "readonly")]
    pub readonly: bool,

    /// JSON sent to the client as its preferences (e.g. '{"fontSize": 14}')
    #[arg(short = 't', long = "client-option")]
    pub client_option: Option<String>,

    /// Reject WebSocket connections whose Origin doesn't match Host
    #[arg(short = 'O', long = "check-origin")]
    pub check_origin: bool,

    /// Maximum concurrent clients to support (0 = no limit)
    #[arg(short = 'm', long = "max-clients", default_value_t = 0)]
    pub max_clients: usize,

    /// Accept only one client, exiting after it disconnects
    #[arg(short = 'o', long = "once")]
    pub once: bool,

    /// Open the default browser once the server starts
    #[arg(short = 'B', long = "browser")]
    pub browser: bool,

    /// Log level: error, warn, info, debug, trace
    #[arg(short = 'l', long = "log", default_value = "info")]
    pub log: String,

    /// The command (and its arguments) to run in the terminal
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

/// Where to bind the listening socket.
#[derive(Debug, Clone)]
pub enum BindTarget {
    Tcp { iface: Option<String>, port: u16 },
    UnixSocket(PathBuf),
}

/// TLS material, loaded lazily by the server from the paths here.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: Option<PathBuf>,
}

/// Immutable, validated configuration shared by the registry and every session.
#[derive(Debug, Clone)]
pub struct Config {
    pub argv: Vec<String>,
    pub credential: Option<String>,
    pub client_opt: String,
    pub reconnect: i64,
    pub sig_code: nix::sys::signal::Signal,
    pub sig_name: String,
    pub readonly: bool,
    pub check_origin: bool,
    pub max_clients: usize,
    pub once: bool,
    pub bind: BindTarget,
    pub tls: Option<TlsConfig>,
    pub index: Option<PathBuf>,
    pub browser: bool,
    pub log: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }

        let credential = match cli.credential {
            Some(raw) => {
                if !raw.contains(':') {
                    return Err(ConfigError::InvalidCredential);
                }
                Some(BASE64.encode(raw.as_bytes()))
            }
            None => None,
        };

        let client_opt = match cli.client_option {
            Some(raw) => {
                if raw.len() > 254 {
                    return Err(ConfigError::ClientOptionTooLong);
                }
                // Validate only; the stored value is the original string, matching
                // what the wire protocol sends verbatim to the client.
                let _: serde_json::Value = serde_json::from_str(&raw)?;
                raw
            }
            None => "{}".to_string(),
        };

        if cli.reconnect <= 0 {
            return Err(ConfigError::InvalidReconnect(cli.reconnect.to_string()));
        }

        let sig_code = parse_signal(&cli.signal)
            .ok_or_else(|| ConfigError::InvalidSignal(cli.signal.clone()))?;
        let sig_name = cli.signal.to_uppercase();

        let index = match cli.index {
            Some(raw) => {
                let expanded = shellexpand::tilde(&raw).into_owned();
                let path = PathBuf::from(expanded);
                let meta = std::fs::metadata(&path).map_err(|source| ConfigError::IndexNotFound {
                    path: path.display().to_string(),
                    source,
                })?;
                if meta.is_dir() {
                    return Err(ConfigError::IndexIsDirectory(path.display().to_string()));
                }
                Some(path)
            }
            None => None,
        };

        let bind = match &cli.interface {
            Some(iface) if iface.ends_with(".sock") || iface.ends_with(".socket") => {
                BindTarget::UnixSocket(PathBuf::from(iface))
            }
            iface => BindTarget::Tcp {
                iface: iface.clone(),
                port: cli.port,
            },
        };

        let tls = if cli.ssl {
            let cert_path = cli
                .ssl_cert
                .ok_or_else(|| ConfigError::Tls("--ssl-cert is required with --ssl".into()))?;
            let key_path = cli
                .ssl_key
                .ok_or_else(|| ConfigError::Tls("--ssl-key is required with --ssl".into()))?;
            Some(TlsConfig {
                cert_path,
                key_path,
                ca_path: cli.ssl_ca,
            })
        } else {
            None
        };

        Ok(Config {
            argv: cli.command,
            credential,
            client_opt,
            reconnect: cli.reconnect,
            sig_code,
            sig_name,
            readonly: cli.readonly,
            check_origin: cli.check_origin,
            max_clients: cli.max_clients,
            once: cli.once,
            bind,
            tls,
            index,
            browser: cli.browser,
            log: cli.log,
            uid: cli.uid,
            gid: cli.gid,
        })
    }

    /// Compares a client-supplied auth token against the stored credential.
    pub fn check_auth_token(&self, token: Option<&str>) -> bool {
        match (&self.credential, token) {
            (None, _) => true,
            (Some(expected), Some(token)) => expected == token,
            (Some(_), None) => false,
        }
    }
}

fn parse_signal(name: &str) -> Option<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;
    let normalized = name.trim_start_matches("SIG").to_uppercase();
    Signal::iterator().find(|s| s.as_str().trim_start_matches("SIG") == normalized)
}

/// A ready-made [`Config`] for unit tests elsewhere in the crate that need
/// one but aren't testing configuration parsing itself.
#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn minimal_config() -> Config {
        Config {
            argv: vec!["/bin/echo".into()],
            credential: None,
            client_opt: "{}".into(),
            reconnect: 10,
            sig_code: nix::sys::signal::Signal::SIGHUP,
            sig_name: "SIGHUP".into(),
            readonly: false,
            check_origin: false,
            max_clients: 0,
            once: false,
            bind: BindTarget::Tcp {
                iface: None,
                port: 0,
            },
            tls: None,
            index: None,
            browser: false,
            log: "info".into(),
            uid: None,
            gid: None,
        }
    }
}
