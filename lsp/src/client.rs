//! `LspClient` facade. The public API the harness and tests drive.
//!
//! A client is a cheap handle onto the connection loop. Every operation is a
//! command sent to the loop; the loop stays the only owner of protocol state,
//! so handles can be cloned freely and used from any task.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use lsprobe_types::{
    ClientError, ExitReason, Notification, RequestId, ResponseError, ServerCapabilities,
    SessionState, error_codes,
};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::connection::{self, Command, Handles};
use crate::documents::DocumentState;
use crate::pending::Reply;
use crate::registry::{Handler, validate_method};
use crate::session::{EXIT, INITIALIZE, SHUTDOWN, SessionView, required_capability};
use crate::transport::{ServerEndpoint, Transport};
use crate::types::{ClientConfig, ClientEvent};
use crate::workspace_edit;

fn loop_gone() -> ClientError {
    ClientError::TransportClosed("connection task has stopped".into())
}

/// A request that has been written to the server and is awaiting its reply.
///
/// Resolves to the result, the server's error, a timeout, a cancellation or
/// the connection failure that ended the session. Dropping it does not cancel
/// the request; use [`LspClient::cancel`] with [`PendingRequest::id`].
#[must_use = "a pending request does nothing unless awaited"]
pub struct PendingRequest {
    id: RequestId,
    method: String,
    rx: oneshot::Receiver<Reply>,
}

impl PendingRequest {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Future for PendingRequest {
    type Output = Result<Value, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or_else(|_| Err(loop_gone())))
    }
}

#[derive(Clone)]
pub struct LspClient {
    commands: mpsc::UnboundedSender<Command>,
    session: SessionView,
    notifications: broadcast::Sender<Notification>,
    events: broadcast::Sender<ClientEvent>,
    pid: Option<u32>,
    config: ClientConfig,
}

impl LspClient {
    /// Connect to a server: spawn the process or dial the socket.
    pub async fn connect(
        endpoint: &ServerEndpoint,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        tracing::info!(%endpoint, "connecting to language server");
        let transport =
            Transport::start(endpoint, config.connect_retry, config.shutdown_timeout).await?;
        Ok(Self::from_transport(transport, config))
    }

    /// Run the client over an existing byte stream pair.
    pub fn attach<R, W>(reader: R, writer: W, config: ClientConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let transport = Transport::attach(reader, writer, config.shutdown_timeout);
        Self::from_transport(transport, config)
    }

    fn from_transport(transport: Transport, config: ClientConfig) -> Self {
        let Handles {
            commands,
            session,
            notifications,
            events,
            pid,
        } = connection::spawn(transport, config.clone());
        Self {
            commands,
            session,
            notifications,
            events,
            pid,
            config,
        }
    }

    fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.commands.send(cmd).map_err(|_| loop_gone())
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| loop_gone())
    }

    /// Write a request and return a handle to its reply. Fails immediately
    /// if the session state forbids the method or the transport is gone.
    ///
    /// `timeout` overrides the configured default for this call.
    pub async fn start_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<PendingRequest, ClientError> {
        validate_method(method)?;
        let (reply, rx) = oneshot::channel();
        let id = self
            .ask(|accepted| Command::Request {
                method: method.to_string(),
                params,
                timeout,
                reply,
                accepted,
            })
            .await??;
        Ok(PendingRequest {
            id,
            method: method.to_string(),
            rx,
        })
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.start_request(method, params, None).await?.await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        self.start_request(method, params, Some(timeout)).await?.await
    }

    /// Send a notification. Returns once it has been queued for writing.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        validate_method(method)?;
        self.ask(|done| Command::Notify {
            method: method.to_string(),
            params,
            done,
        })
        .await?
    }

    /// Add a handler for server notifications of `method`. Handlers run on
    /// the connection task in arrival order and must not block.
    pub fn on_notification<F>(&self, method: &str, handler: F) -> Result<(), ClientError>
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        validate_method(method)?;
        self.send(Command::Register {
            method: method.to_string(),
            handler: Handler::Notification(Box::new(handler)),
        })
    }

    /// Set the handler for server requests of `method`, replacing any
    /// earlier one. The returned future becomes the reply. Server requests
    /// are handled one at a time and answered in arrival order.
    pub fn on_request<F, Fut>(&self, method: &str, mut handler: F) -> Result<(), ClientError>
    where
        F: FnMut(Option<Value>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ResponseError>> + Send + 'static,
    {
        validate_method(method)?;
        self.send(Command::Register {
            method: method.to_string(),
            handler: Handler::Request(Box::new(move |params| handler(params).boxed())),
        })
    }

    /// Cancel an outstanding request. Its waiter resolves with
    /// [`ClientError::Cancelled`] and `$/cancelRequest` is sent to the
    /// server. Returns `false` if the id was not outstanding.
    pub async fn cancel(&self, id: &RequestId) -> Result<bool, ClientError> {
        self.ask(|done| Command::Cancel {
            id: id.clone(),
            done,
        })
        .await
    }

    /// Run the `initialize` request. On success the client has already sent
    /// `initialized` and capabilities are available.
    pub async fn initialize(&self, params: Value) -> Result<Value, ClientError> {
        self.request(INITIALIZE, Some(params)).await
    }

    /// Graceful stop: `shutdown`, then `exit`, then close the transport.
    ///
    /// `exit` is still sent when the server rejects or ignores `shutdown`,
    /// and the session then ends with `ExitReason::Forced`. The transport is
    /// always closed and the first failure is returned.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let shutdown = self
            .request_with_timeout(SHUTDOWN, None, self.config.shutdown_timeout)
            .await;
        let exit = match &shutdown {
            Ok(_) | Err(ClientError::Protocol(_) | ClientError::Timeout { .. }) => {
                self.notify(EXIT, None).await
            }
            Err(_) => Ok(()),
        };
        self.close().await;
        shutdown.map(|_| ())?;
        exit
    }

    /// Forceful stop. Safe to call in any state and more than once.
    pub async fn close(&self) {
        let _ = self.ask(|done| Command::Close { done }).await;
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Wait until the session reaches `target`, or has exited.
    pub async fn wait_for_state(&self, target: SessionState) -> SessionState {
        self.session
            .wait_for(|state| state == target || state.is_exited())
            .await
    }

    pub async fn wait_for_exit(&self) -> Option<ExitReason> {
        self.session.wait_for(SessionState::is_exited).await;
        self.exit_reason()
    }

    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.session.capabilities()
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.session.exit_reason().cloned()
    }

    /// Check that the server advertised `capability` (a dotted path such as
    /// `completionProvider.resolveProvider`).
    pub fn require_capability(&self, capability: &str) -> Result<(), ClientError> {
        let Some(caps) = self.capabilities() else {
            return Err(ClientError::SessionNotReady {
                method: capability.to_string(),
                state: self.state(),
            });
        };
        if caps.supports(capability) {
            Ok(())
        } else {
            Err(ClientError::CapabilityNotSupported(capability.to_string()))
        }
    }

    /// Like [`require_capability`](Self::require_capability), keyed by the
    /// request method. Methods with no associated capability always pass.
    pub fn require_method_support(&self, method: &str) -> Result<(), ClientError> {
        match required_capability(method) {
            Some(capability) => self.require_capability(capability),
            None => Ok(()),
        }
    }

    /// Ids of requests still waiting for a reply, in issue order.
    pub async fn outstanding_requests(&self) -> Result<Vec<RequestId>, ClientError> {
        self.ask(Command::Outstanding).await
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.pid
    }

    /// Observe every inbound notification, whether or not a handler claims it.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn set_strict_notifications(&self, strict: bool) -> Result<(), ClientError> {
        self.send(Command::SetStrict(strict))
    }

    /// Open a document. `didOpen` (version 0) goes out only on the first
    /// open of a URI; later opens just take another reference.
    pub async fn open_document(
        &self,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> Result<bool, ClientError> {
        self.ask(|done| Command::OpenDocument {
            uri: uri.to_string(),
            language_id: language_id.to_string(),
            text: text.to_string(),
            done,
        })
        .await?
    }

    /// Replace the document text, bump its version and send a full-text
    /// `didChange`. Returns the new version.
    pub async fn change_document(&self, uri: &str, text: &str) -> Result<i32, ClientError> {
        self.ask(|done| Command::ChangeDocument {
            uri: uri.to_string(),
            text: text.to_string(),
            base_version: None,
            done,
        })
        .await?
    }

    /// Drop a reference. `didClose` goes out when the last one is released.
    pub async fn close_document(&self, uri: &str) -> Result<bool, ClientError> {
        self.ask(|done| Command::CloseDocument {
            uri: uri.to_string(),
            done,
        })
        .await?
    }

    pub async fn document_version(&self, uri: &str) -> Result<Option<i32>, ClientError> {
        Ok(self.document(uri).await?.map(|doc| doc.version))
    }

    /// The tracked state of an open document.
    pub async fn document(&self, uri: &str) -> Result<Option<DocumentState>, ClientError> {
        self.ask(|done| Command::Document {
            uri: uri.to_string(),
            done,
        })
        .await
    }

    /// Answer `workspace/applyEdit` requests from the server.
    ///
    /// Edits to open documents are applied to the tracked text and sent as
    /// `didChange`; other files are rewritten on disk. A versioned
    /// `TextDocumentEdit` is refused unless the document is open at exactly
    /// that version. Nothing is committed until every edit has been staged.
    pub fn handle_workspace_edits(&self) -> Result<(), ClientError> {
        let commands = self.commands.downgrade();
        self.on_request(workspace_edit::APPLY_EDIT, move |params| {
            let commands = commands.clone();
            async move {
                let Some(commands) = commands.upgrade() else {
                    return Err(ResponseError::new(
                        error_codes::INTERNAL_ERROR,
                        "client has been dropped",
                    ));
                };
                Ok(workspace_edit::apply(&commands, params).await.to_value())
            }
        })
    }
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("state", &self.state())
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}
