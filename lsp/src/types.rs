//! Public configuration and event types.
//!
//! Callers build a [`ClientConfig`] (usually from `lsprobe-config`), describe
//! the server with a [`ServerConfig`], and observe the connection through
//! [`ClientEvent`]s.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use lsprobe_types::{Anomaly, ExitReason, SessionState};
use serde::Deserialize;

use crate::transport::{ConnectRetry, ServerCommand, ServerEndpoint};

/// Tunables for one client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default per-request deadline. `None` disables deadlines.
    pub request_timeout: Option<Duration>,
    /// Deadline for the `initialize` request.
    pub initialize_timeout: Option<Duration>,
    /// Grace period for the `shutdown` response and, separately, for the
    /// process to exit after `exit`.
    pub shutdown_timeout: Duration,
    /// How long a cancelled or timed-out id is remembered.
    pub quarantine: Duration,
    /// Report notifications nobody handles as anomalies.
    pub strict_notifications: bool,
    pub connect_retry: ConnectRetry,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(5)),
            initialize_timeout: Some(Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(5),
            quarantine: Duration::from_secs(60),
            strict_notifications: false,
            connect_retry: ConnectRetry::default(),
        }
    }
}

/// Configuration for a single language server.
///
/// Exactly one of `command`, `tcp` or `unix` selects the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Executable command (e.g. "pyrefly").
    pub command: Option<String>,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the spawned process.
    pub cwd: Option<PathBuf>,
    /// Extra environment for the spawned process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// `host:port` of a server already listening on TCP.
    pub tcp: Option<String>,
    /// Path of a unix domain socket.
    pub unix: Option<PathBuf>,
}

impl ServerConfig {
    pub fn endpoint(&self) -> Result<ServerEndpoint, String> {
        match (&self.command, &self.tcp, &self.unix) {
            (Some(command), None, None) => {
                let mut cmd = ServerCommand::new(command.clone()).args(self.args.iter().cloned());
                cmd.cwd.clone_from(&self.cwd);
                cmd.env = self
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Ok(ServerEndpoint::Process(cmd))
            }
            (None, Some(addr), None) => {
                let (host, port) = addr
                    .rsplit_once(':')
                    .ok_or_else(|| format!("tcp address {addr:?} is not host:port"))?;
                let port = port
                    .parse()
                    .map_err(|_| format!("invalid port in tcp address {addr:?}"))?;
                Ok(ServerEndpoint::Tcp {
                    host: host.trim_matches(['[', ']']).to_string(),
                    port,
                })
            }
            #[cfg(unix)]
            (None, None, Some(path)) => Ok(ServerEndpoint::Unix(path.clone())),
            #[cfg(not(unix))]
            (None, None, Some(_)) => Err("unix sockets are not supported on this platform".into()),
            (None, None, None) => Err("no server configured: set command, tcp or unix".into()),
            _ => Err("set only one of command, tcp or unix".into()),
        }
    }
}

/// Something that happened on the connection, for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Anomaly(Anomaly),
    StateChanged(SessionState),
    /// The session ended. Always the last event.
    Exited(ExitReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ServerConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn command_endpoint() {
        let cfg = parse(r#"{"command": "pyrefly", "args": ["lsp"], "env": {"RUST_LOG": "off"}}"#);
        let ServerEndpoint::Process(cmd) = cfg.endpoint().unwrap() else {
            panic!("expected process endpoint");
        };
        assert_eq!(cmd.command, "pyrefly");
        assert_eq!(cmd.args, ["lsp"]);
        assert_eq!(cmd.env, [("RUST_LOG".to_string(), "off".to_string())]);
    }

    #[test]
    fn tcp_endpoint() {
        let cfg = parse(r#"{"tcp": "127.0.0.1:2087"}"#);
        assert_eq!(
            cfg.endpoint().unwrap(),
            ServerEndpoint::Tcp {
                host: "127.0.0.1".into(),
                port: 2087
            }
        );
        let v6 = parse(r#"{"tcp": "[::1]:2087"}"#);
        assert!(matches!(
            v6.endpoint().unwrap(),
            ServerEndpoint::Tcp { host, .. } if host == "::1"
        ));
    }

    #[test]
    fn endpoint_requires_exactly_one_source() {
        assert!(ServerConfig::default().endpoint().is_err());
        let both = parse(r#"{"command": "x", "tcp": "h:1"}"#);
        assert!(both.endpoint().is_err());
        assert!(parse(r#"{"tcp": "nohost"}"#).endpoint().is_err());
    }

    #[test]
    fn default_client_config() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.request_timeout, Some(Duration::from_secs(5)));
        assert!(!cfg.strict_notifications);
    }
}
