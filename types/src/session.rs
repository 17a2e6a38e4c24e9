use std::fmt;

/// Protocol lifecycle of one client/server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Initialized,
    ShuttingDown,
    Exited,
}

impl SessionState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::ShuttingDown => "shutting down",
            Self::Exited => "exited",
        }
    }

    #[must_use]
    pub fn is_exited(self) -> bool {
        self == Self::Exited
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Exit status of a server process.
///
/// `signal` is only ever populated on unix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    #[must_use]
    pub fn success(self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// How the session reached [`SessionState::Exited`]. Recorded exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// shutdown → exit sequence completed (or the caller closed the connection).
    Graceful,
    /// `exit` was sent without a successful `shutdown` response first.
    Forced(String),
    InitializeFailed(String),
    /// The server process exited without being asked to.
    ProcessExited(ExitInfo),
    /// The byte stream closed or failed with no process exit to attribute it to.
    TransportLost(String),
}

impl ExitReason {
    #[must_use]
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, Self::Graceful)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => f.write_str("graceful shutdown"),
            Self::Forced(reason) => write!(f, "forced exit: {reason}"),
            Self::InitializeFailed(reason) => write!(f, "initialize failed: {reason}"),
            Self::ProcessExited(info) => write!(f, "server exited unexpectedly ({info})"),
            Self::TransportLost(reason) => write!(f, "transport lost: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_info_display() {
        let code = ExitInfo {
            code: Some(1),
            signal: None,
        };
        assert_eq!(code.to_string(), "exit code 1");
        let signal = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(signal.to_string(), "killed by signal 9");
        assert_eq!(ExitInfo::default().to_string(), "unknown exit status");
    }

    #[test]
    fn graceful_is_not_abnormal() {
        assert!(!ExitReason::Graceful.is_abnormal());
        assert!(ExitReason::ProcessExited(ExitInfo::default()).is_abnormal());
        let forced = ExitReason::Forced("no shutdown response".into());
        assert!(forced.is_abnormal());
        assert_eq!(forced.to_string(), "forced exit: no shutdown response");
    }
}
