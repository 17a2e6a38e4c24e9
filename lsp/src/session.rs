//! Protocol lifecycle state machine.
//!
//! The connection loop owns the [`Session`] and is the only writer. Client
//! handles read through a [`SessionView`]: state via a `watch` channel,
//! capabilities and the exit reason through write-once cells.

use std::sync::{Arc, OnceLock};

use lsprobe_types::{ClientError, ExitReason, ServerCapabilities, SessionState};
use serde_json::Value;
use tokio::sync::watch;

pub(crate) const INITIALIZE: &str = "initialize";
pub(crate) const INITIALIZED: &str = "initialized";
pub(crate) const SHUTDOWN: &str = "shutdown";
pub(crate) const EXIT: &str = "exit";
pub(crate) const CANCEL_REQUEST: &str = "$/cancelRequest";

/// Whether the client may send request `method` in `state`.
#[must_use]
pub fn request_allowed(state: SessionState, method: &str) -> bool {
    match state {
        SessionState::Uninitialized => method == INITIALIZE,
        SessionState::Initialized => method != INITIALIZE,
        SessionState::Initializing | SessionState::ShuttingDown | SessionState::Exited => false,
    }
}

/// Whether the client may send notification `method` in `state`.
#[must_use]
pub fn notification_allowed(state: SessionState, method: &str) -> bool {
    match state {
        SessionState::Uninitialized => method == EXIT,
        SessionState::Initializing => method == EXIT || method.starts_with("$/"),
        SessionState::Initialized => method != INITIALIZED,
        SessionState::ShuttingDown => method == EXIT || method == CANCEL_REQUEST,
        SessionState::Exited => false,
    }
}

/// The server capability a request method depends on, for the methods that
/// have one.
#[must_use]
pub fn required_capability(method: &str) -> Option<&'static str> {
    Some(match method {
        "textDocument/hover" => "hoverProvider",
        "textDocument/definition" => "definitionProvider",
        "textDocument/declaration" => "declarationProvider",
        "textDocument/typeDefinition" => "typeDefinitionProvider",
        "textDocument/implementation" => "implementationProvider",
        "textDocument/references" => "referencesProvider",
        "textDocument/completion" => "completionProvider",
        "textDocument/signatureHelp" => "signatureHelpProvider",
        "textDocument/documentSymbol" => "documentSymbolProvider",
        "textDocument/documentHighlight" => "documentHighlightProvider",
        "textDocument/codeAction" => "codeActionProvider",
        "textDocument/formatting" => "documentFormattingProvider",
        "textDocument/rename" => "renameProvider",
        "textDocument/foldingRange" => "foldingRangeProvider",
        "textDocument/inlayHint" => "inlayHintProvider",
        "textDocument/semanticTokens/full" => "semanticTokensProvider",
        "textDocument/prepareCallHierarchy" => "callHierarchyProvider",
        "workspace/symbol" => "workspaceSymbolProvider",
        _ => return None,
    })
}

pub(crate) struct Session {
    state_tx: watch::Sender<SessionState>,
    capabilities: Arc<OnceLock<ServerCapabilities>>,
    exit_reason: Arc<OnceLock<ExitReason>>,
}

/// Read-only side of the session for client handles.
#[derive(Clone)]
pub(crate) struct SessionView {
    state_rx: watch::Receiver<SessionState>,
    capabilities: Arc<OnceLock<ServerCapabilities>>,
    exit_reason: Arc<OnceLock<ExitReason>>,
}

impl Session {
    pub fn new() -> (Self, SessionView) {
        let (state_tx, state_rx) = watch::channel(SessionState::Uninitialized);
        let capabilities = Arc::new(OnceLock::new());
        let exit_reason = Arc::new(OnceLock::new());
        let view = SessionView {
            state_rx,
            capabilities: capabilities.clone(),
            exit_reason: exit_reason.clone(),
        };
        (
            Self {
                state_tx,
                capabilities,
                exit_reason,
            },
            view,
        )
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn check_request(&self, method: &str) -> Result<(), ClientError> {
        let state = self.state();
        if request_allowed(state, method) {
            Ok(())
        } else {
            Err(self.not_ready(method, state))
        }
    }

    pub fn check_notification(&self, method: &str) -> Result<(), ClientError> {
        let state = self.state();
        if notification_allowed(state, method) {
            Ok(())
        } else {
            Err(self.not_ready(method, state))
        }
    }

    /// Error for an operation the current state forbids. Once the session
    /// has died with its transport, callers see the transport failure.
    fn not_ready(&self, method: &str, state: SessionState) -> ClientError {
        match self.exit_reason.get() {
            Some(ExitReason::ProcessExited(info)) => ClientError::ProcessExited(*info),
            Some(ExitReason::TransportLost(reason)) => ClientError::TransportClosed(reason.clone()),
            _ => ClientError::SessionNotReady {
                method: method.to_string(),
                state,
            },
        }
    }

    /// Record that a request has been written. Returns the new state if the
    /// method moved the lifecycle forward.
    pub fn on_request_sent(&mut self, method: &str) -> Option<SessionState> {
        match (self.state(), method) {
            (SessionState::Uninitialized, INITIALIZE) => {
                self.transition(SessionState::Initializing)
            }
            (SessionState::Initialized, SHUTDOWN) => self.transition(SessionState::ShuttingDown),
            _ => None,
        }
    }

    /// Freeze capabilities from a successful `initialize` result.
    pub fn complete_initialize(&mut self, result: &Value) -> Result<SessionState, ClientError> {
        let capabilities = ServerCapabilities::from_initialize_result(result).map_err(|reason| {
            ClientError::InitializeFailed {
                cause: Box::new(ClientError::Protocol(lsprobe_types::ResponseError::new(
                    lsprobe_types::error_codes::INVALID_REQUEST,
                    reason,
                ))),
            }
        })?;
        if let Some(info) = capabilities.server_info() {
            tracing::info!(server = %info.name, version = ?info.version, "server initialized");
        }
        // Only the first initialize can get here; the state gate rejects a second.
        let _ = self.capabilities.set(capabilities);
        self.transition(SessionState::Initialized);
        Ok(SessionState::Initialized)
    }

    /// Enter `Exited`, recording why. Returns `false` if already exited.
    pub fn exit(&mut self, reason: ExitReason) -> bool {
        if self.state().is_exited() {
            return false;
        }
        if reason.is_abnormal() {
            tracing::warn!(%reason, "session ended");
        } else {
            tracing::info!(%reason, "session ended");
        }
        let _ = self.exit_reason.set(reason);
        self.transition(SessionState::Exited);
        true
    }

    fn transition(&mut self, to: SessionState) -> Option<SessionState> {
        let from = self.state_tx.send_replace(to);
        if from == to {
            return None;
        }
        tracing::debug!(%from, %to, "session state");
        Some(to)
    }
}

impl SessionView {
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.capabilities.get()
    }

    pub fn exit_reason(&self) -> Option<&ExitReason> {
        self.exit_reason.get()
    }

    /// Wait until the state satisfies `pred`. Returns the matching state, or
    /// the final state if the connection loop is gone.
    pub async fn wait_for(&self, mut pred: impl FnMut(SessionState) -> bool) -> SessionState {
        let mut rx = self.state_rx.clone();
        let reached = rx.wait_for(|state| pred(*state)).await.map(|state| *state);
        match reached {
            Ok(state) => state,
            Err(_) => *rx.borrow(),
        }
    }
}
