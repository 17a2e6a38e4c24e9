//! The per-connection event loop.
//!
//! One task owns the transport, the frame decoder, the dispatcher (pending
//! table and handler registry), the session and the document store. It
//! multiplexes client commands, transport events, server-request handler
//! futures and the earliest pending deadline in a single `select!`, so none
//! of that state needs a lock.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::future::BoxFuture;
use lsprobe_types::{
    ClientError, ExitInfo, ExitReason, Message, Notification, Request, RequestId, Response,
    ResponseOutcome, SessionState,
};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::codec::{self, FrameDecoder};
use crate::dispatch::{BROADCAST_CAPACITY, Dispatcher, Routed};
use crate::documents::{DocumentState, DocumentStore};
use crate::pending::{PendingCall, PendingTable, Reply};
use crate::protocol;
use crate::registry::{Handler, validate_method};
use crate::session::{
    CANCEL_REQUEST, EXIT, INITIALIZE, INITIALIZED, SHUTDOWN, Session, SessionView,
};
use crate::transport::{Transport, TransportEvent};
use crate::types::{ClientConfig, ClientEvent};

/// How long to wait for an exit status after the server closes its output,
/// so the loss can be attributed to the process.
const EXIT_ATTRIBUTION_WAIT: Duration = Duration::from_millis(500);

type Ack<T> = oneshot::Sender<Result<T, ClientError>>;

pub(crate) enum Command {
    Request {
        method: String,
        params: Option<Value>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Reply>,
        accepted: Ack<RequestId>,
    },
    Notify {
        method: String,
        params: Option<Value>,
        done: Ack<()>,
    },
    Register {
        method: String,
        handler: Handler,
    },
    Cancel {
        id: RequestId,
        done: oneshot::Sender<bool>,
    },
    SetStrict(bool),
    Outstanding(oneshot::Sender<Vec<RequestId>>),
    OpenDocument {
        uri: String,
        language_id: String,
        text: String,
        done: Ack<bool>,
    },
    /// Replace a document's text. With `base_version` set, only while the
    /// document is still at that version.
    ChangeDocument {
        uri: String,
        text: String,
        base_version: Option<i32>,
        done: Ack<i32>,
    },
    CloseDocument {
        uri: String,
        done: Ack<bool>,
    },
    Document {
        uri: String,
        done: oneshot::Sender<Option<DocumentState>>,
    },
    /// Tear down now. Acknowledged once the transport is closed.
    Close { done: oneshot::Sender<()> },
}

/// Everything a client handle needs to talk to a running loop.
pub(crate) struct Handles {
    pub commands: mpsc::UnboundedSender<Command>,
    pub session: SessionView,
    pub notifications: broadcast::Sender<Notification>,
    pub events: broadcast::Sender<ClientEvent>,
    pub pid: Option<u32>,
}

pub(crate) struct Connection {
    transport: Transport,
    transport_open: bool,
    decoder: FrameDecoder,
    dispatcher: Dispatcher,
    session: Session,
    documents: DocumentStore,
    config: ClientConfig,
    /// The server answered `shutdown` successfully.
    shutdown_acknowledged: bool,
    /// Server-request handlers in arrival order. Only the front one runs.
    handlers: VecDeque<BoxFuture<'static, Response>>,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// Spawn the loop for `transport` on the current runtime.
pub(crate) fn spawn(transport: Transport, config: ClientConfig) -> Handles {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (notifications, _) = broadcast::channel(BROADCAST_CAPACITY);
    let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
    let (session, view) = Session::new();
    let pid = transport.pid();

    let dispatcher = Dispatcher::new(
        PendingTable::new(config.quarantine),
        config.strict_notifications,
        notifications.clone(),
        events.clone(),
    );
    let connection = Connection {
        transport,
        transport_open: true,
        decoder: FrameDecoder::new(),
        dispatcher,
        session,
        documents: DocumentStore::default(),
        config,
        shutdown_acknowledged: false,
        handlers: VecDeque::new(),
        commands,
    };
    tokio::spawn(connection.run());

    Handles {
        commands: commands_tx,
        session: view,
        notifications,
        events,
        pid,
    }
}

impl Connection {
    async fn run(mut self) {
        loop {
            let deadline = self.dispatcher.pending.next_deadline();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = self.transport.next_event(), if self.transport_open => {
                    self.handle_transport_event(event).await;
                }
                reply = next_reply(&mut self.handlers), if !self.handlers.is_empty() => {
                    self.handlers.pop_front();
                    self.send_reply(&reply);
                }
                () = sleep_until(deadline), if deadline.is_some() => {
                    self.expire_deadlines().await;
                }
            }
        }

        // Every client handle is gone.
        self.terminate(
            ExitReason::Graceful,
            ClientError::TransportClosed("client dropped".into()),
            Some(Duration::ZERO),
        )
        .await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Request {
                method,
                params,
                timeout,
                reply,
                accepted,
            } => {
                let result = self.send_request(method, params, timeout, reply);
                let _ = accepted.send(result);
            }
            Command::Notify {
                method,
                params,
                done,
            } => {
                let result = self.send_notification(&method, params);
                let exiting = result.is_ok() && method == EXIT;
                let _ = done.send(result);
                if exiting {
                    let reason = if self.shutdown_acknowledged {
                        ExitReason::Graceful
                    } else {
                        ExitReason::Forced("exit sent without a shutdown response".into())
                    };
                    self.terminate(
                        reason,
                        ClientError::TransportClosed("session exited".into()),
                        None,
                    )
                    .await;
                }
            }
            Command::Register { method, handler } => {
                if let Err(e) = self.dispatcher.registry.register(&method, handler) {
                    tracing::warn!("rejected handler registration: {e}");
                }
            }
            Command::Cancel { id, done } => {
                let _ = done.send(self.cancel(&id));
            }
            Command::SetStrict(strict) => self.dispatcher.strict = strict,
            Command::Outstanding(done) => {
                let _ = done.send(self.dispatcher.pending.outstanding_ids());
            }
            Command::OpenDocument {
                uri,
                language_id,
                text,
                done,
            } => {
                let _ = done.send(self.open_document(&uri, &language_id, &text));
            }
            Command::ChangeDocument {
                uri,
                text,
                base_version,
                done,
            } => {
                let _ = done.send(self.change_document(&uri, &text, base_version));
            }
            Command::CloseDocument { uri, done } => {
                let _ = done.send(self.close_document(&uri));
            }
            Command::Document { uri, done } => {
                let _ = done.send(self.documents.get(&uri).ok().cloned());
            }
            Command::Close { done } => {
                self.terminate(
                    ExitReason::Graceful,
                    ClientError::TransportClosed("connection closed by client".into()),
                    Some(Duration::ZERO),
                )
                .await;
                let _ = done.send(());
            }
        }
    }

    fn send_request(
        &mut self,
        method: String,
        params: Option<Value>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Reply>,
    ) -> Result<RequestId, ClientError> {
        validate_method(&method)?;
        self.session.check_request(&method)?;

        let timeout = timeout.or(if method == INITIALIZE {
            self.config.initialize_timeout
        } else {
            self.config.request_timeout
        });
        let id = self.dispatcher.pending.insert(&method, timeout, reply);
        let message = Message::Request(Request::new(id, method.as_str(), params));
        if let Err(e) = self.transport.write(codec::encode(&message)) {
            self.dispatcher.pending.forget(id);
            return Err(e);
        }
        tracing::debug!(id, %method, "request");
        if let Some(state) = self.session.on_request_sent(&method) {
            self.dispatcher.publish(ClientEvent::StateChanged(state));
        }
        Ok(RequestId::Number(id))
    }

    fn send_notification(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ClientError> {
        validate_method(method)?;
        self.session.check_notification(method)?;
        self.write_notification(method, params)
    }

    /// Write a notification without consulting the session.
    fn write_notification(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ClientError> {
        tracing::debug!(%method, "send notification");
        let message = Message::Notification(Notification::new(method, params));
        self.transport.write(codec::encode(&message))
    }

    fn send_reply(&mut self, reply: &Response) {
        if self.session.state().is_exited() {
            return;
        }
        if let Err(e) = self.transport.write(codec::encode(&Message::Response(reply.clone()))) {
            tracing::warn!(id = %reply.id, "failed to send reply: {e}");
        }
    }

    fn cancel(&mut self, id: &RequestId) -> bool {
        let Some(number) = id.as_number() else {
            return false;
        };
        let Some(call) = self.dispatcher.pending.cancel(number) else {
            return false;
        };
        tracing::debug!(%id, method = %call.method, "cancelled");
        call.resolve(Err(ClientError::Cancelled { id: id.clone() }));
        self.notify_server_cancel(number);
        true
    }

    /// Best effort: the server is free to ignore it, and some states forbid it.
    fn notify_server_cancel(&mut self, id: i64) {
        if self.session.check_notification(CANCEL_REQUEST).is_ok() {
            let _ = self.write_notification(CANCEL_REQUEST, Some(protocol::cancel_params(id)));
        }
    }

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Data(bytes)) => {
                for decoded in self.decoder.feed(&bytes) {
                    match decoded {
                        Ok(message) => self.route(message).await,
                        Err(e) => self.dispatcher.report(e.into()),
                    }
                }
            }
            Some(TransportEvent::ReadClosed(error)) => {
                if self.session.state().is_exited() {
                    return;
                }
                let info = if self.transport.pid().is_some() {
                    self.transport.wait_exit(EXIT_ATTRIBUTION_WAIT).await
                } else {
                    None
                };
                match info {
                    Some(info) => self.process_exited(info).await,
                    None => {
                        let reason =
                            error.unwrap_or_else(|| "server closed the connection".to_string());
                        self.terminate(
                            ExitReason::TransportLost(reason.clone()),
                            ClientError::TransportClosed(reason),
                            None,
                        )
                        .await;
                    }
                }
            }
            Some(TransportEvent::Exited(info)) => {
                if !self.session.state().is_exited() {
                    self.process_exited(info).await;
                }
            }
            None => {
                self.transport_open = false;
                if !self.session.state().is_exited() {
                    let reason = "transport ended".to_string();
                    self.terminate(
                        ExitReason::TransportLost(reason.clone()),
                        ClientError::TransportClosed(reason),
                        None,
                    )
                    .await;
                }
            }
        }
    }

    async fn process_exited(&mut self, info: ExitInfo) {
        self.terminate(
            ExitReason::ProcessExited(info),
            ClientError::ProcessExited(info),
            None,
        )
        .await;
    }

    async fn route(&mut self, message: Message) {
        match self.dispatcher.route(message) {
            Routed::Matched {
                method,
                call,
                outcome,
            } => self.resolve(&method, call, outcome).await,
            Routed::Reply(reply) => self.send_reply(&reply),
            Routed::Handling(fut) => self.handlers.push_back(fut),
            Routed::Done => {}
        }
    }

    async fn resolve(&mut self, method: &str, call: PendingCall, outcome: ResponseOutcome) {
        if method == SHUTDOWN && matches!(outcome, ResponseOutcome::Result(_)) {
            self.shutdown_acknowledged = true;
        }
        if method != INITIALIZE || self.session.state() != SessionState::Initializing {
            call.resolve(match outcome {
                ResponseOutcome::Result(value) => Ok(value),
                ResponseOutcome::Error(error) => Err(ClientError::Protocol(error)),
            });
            return;
        }

        let completed = match outcome {
            ResponseOutcome::Result(value) => self
                .session
                .complete_initialize(&value)
                .map(|state| (state, value)),
            ResponseOutcome::Error(error) => Err(ClientError::InitializeFailed {
                cause: Box::new(ClientError::Protocol(error)),
            }),
        };
        match completed {
            Ok((state, value)) => {
                self.dispatcher.publish(ClientEvent::StateChanged(state));
                // The server must see `initialized` before anything the caller
                // sends in reaction to the result.
                if let Err(e) = self.write_notification(INITIALIZED, Some(json!({}))) {
                    tracing::warn!("failed to send initialized: {e}");
                }
                call.resolve(Ok(value));
            }
            Err(error) => self.fail_initialize(call, error).await,
        }
    }

    async fn fail_initialize(&mut self, call: PendingCall, error: ClientError) {
        call.resolve(Err(error.clone()));
        self.terminate(
            ExitReason::InitializeFailed(error.to_string()),
            ClientError::TransportClosed("initialize failed".into()),
            None,
        )
        .await;
    }

    async fn expire_deadlines(&mut self) {
        let expired = self.dispatcher.pending.expire(Instant::now());
        for (id, call) in expired {
            let error = ClientError::Timeout {
                method: call.method.clone(),
                id: RequestId::Number(id),
                after: call.timeout.unwrap_or_default(),
            };
            tracing::debug!(id, method = %call.method, "request timed out");
            self.notify_server_cancel(id);
            if call.method == INITIALIZE && self.session.state() == SessionState::Initializing {
                let error = ClientError::InitializeFailed {
                    cause: Box::new(error),
                };
                self.fail_initialize(call, error).await;
            } else {
                call.resolve(Err(error));
            }
        }
    }

    fn open_document(
        &mut self,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> Result<bool, ClientError> {
        // Validate before taking a reference so a refused open leaves no trace.
        if self.documents.open_count(uri) == 0 {
            self.session.check_notification("textDocument/didOpen")?;
        }
        let Some(doc) = self.documents.open(uri, language_id, text) else {
            return Ok(false);
        };
        let params = protocol::did_open_params(uri, &doc.language_id, doc.version, &doc.content);
        if let Err(e) = self.write_notification("textDocument/didOpen", Some(params)) {
            let _ = self.documents.close(uri);
            return Err(e);
        }
        Ok(true)
    }

    fn change_document(
        &mut self,
        uri: &str,
        text: &str,
        base_version: Option<i32>,
    ) -> Result<i32, ClientError> {
        self.documents.get(uri)?;
        self.session.check_notification("textDocument/didChange")?;
        let version = self.documents.update_content(uri, text, base_version)?;
        self.write_notification(
            "textDocument/didChange",
            Some(protocol::did_change_params(uri, version, text)),
        )?;
        Ok(version)
    }

    fn close_document(&mut self, uri: &str) -> Result<bool, ClientError> {
        self.documents.get(uri)?;
        if self.documents.open_count(uri) == 1 {
            self.session.check_notification("textDocument/didClose")?;
        }
        let last = self.documents.close(uri)?;
        if last {
            self.write_notification(
                "textDocument/didClose",
                Some(protocol::did_close_params(uri)),
            )?;
        }
        Ok(last)
    }

    /// Enter `Exited` (once), fail every outstanding call and close the
    /// transport. `grace` overrides the configured shutdown grace period.
    async fn terminate(&mut self, reason: ExitReason, error: ClientError, grace: Option<Duration>) {
        if self.session.exit(reason.clone()) {
            self.dispatcher.pending.fail_all(&error);
            self.handlers.clear();
            self.dispatcher
                .publish(ClientEvent::StateChanged(SessionState::Exited));
            self.dispatcher.publish(ClientEvent::Exited(reason));
        }
        let grace = grace.unwrap_or(self.config.shutdown_timeout);
        self.transport.close_within(grace).await;
    }
}

/// Drive the oldest handler. The next one is not polled until this one's
/// reply has been written.
async fn next_reply(handlers: &mut VecDeque<BoxFuture<'static, Response>>) -> Response {
    match handlers.front_mut() {
        Some(handler) => handler.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
