//! Scripted in-memory language server.
//!
//! [`mock_pair`] wires an [`LspClient`] to a [`MockServer`] over a
//! `tokio::io::duplex` pipe. The test plays the server: it reads what the
//! client wrote and injects replies, notifications, server requests or raw
//! bytes in whatever order the scenario needs.

use std::time::Duration;

use lsprobe_lsp::codec::{self, FrameReader, FrameWriter};
use lsprobe_lsp::{ClientConfig, LspClient};
use lsprobe_types::{Message, Notification, Request, RequestId, Response, ResponseError};
use serde_json::{Value, json};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

use crate::error::HarnessError;

const PIPE_CAPACITY: usize = 1 << 20;

/// How long `recv` waits for the client before failing the test.
pub const DEFAULT_RECV_WAIT: Duration = Duration::from_secs(5);

pub struct MockServer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
    recv_wait: Duration,
}

/// A client attached to a fresh mock server.
#[must_use]
pub fn mock_pair(config: ClientConfig) -> (LspClient, MockServer) {
    let (client_io, server_io) = duplex(PIPE_CAPACITY);
    let (client_read, client_write) = split(client_io);
    let (server_read, server_write) = split(server_io);
    let client = LspClient::attach(client_read, client_write, config);
    let server = MockServer {
        reader: FrameReader::new(server_read),
        writer: FrameWriter::new(server_write),
        recv_wait: DEFAULT_RECV_WAIT,
    };
    (client, server)
}

impl MockServer {
    #[must_use]
    pub fn with_recv_wait(mut self, wait: Duration) -> Self {
        self.recv_wait = wait;
        self
    }

    /// Next message from the client.
    pub async fn recv(&mut self) -> Result<Message, HarnessError> {
        match tokio::time::timeout(self.recv_wait, self.reader.read_message()).await {
            Err(_) => Err(HarnessError::ExpectationTimeout {
                what: "a message from the client".into(),
                after: self.recv_wait,
            }),
            Ok(Err(e)) => Err(HarnessError::Mock(e.to_string())),
            Ok(Ok(None)) => Err(HarnessError::Mock("client closed the connection".into())),
            Ok(Ok(Some(message))) => Ok(message),
        }
    }

    /// Next message, which must be a request for `method`.
    pub async fn expect_request(&mut self, method: &str) -> Result<Request, HarnessError> {
        match self.recv().await? {
            Message::Request(request) if request.method == method => Ok(request),
            other => Err(unexpected(&format!("`{method}` request"), &other)),
        }
    }

    /// Next message, which must be a notification for `method`.
    pub async fn expect_notification(
        &mut self,
        method: &str,
    ) -> Result<Notification, HarnessError> {
        match self.recv().await? {
            Message::Notification(n) if n.method == method => Ok(n),
            other => Err(unexpected(&format!("`{method}` notification"), &other)),
        }
    }

    /// Next message, which must be a response (to a server request).
    pub async fn expect_response(&mut self) -> Result<Response, HarnessError> {
        match self.recv().await? {
            Message::Response(response) => Ok(response),
            other => Err(unexpected("a response", &other)),
        }
    }

    /// Play the server side of the handshake: answer `initialize` with
    /// `capabilities` and consume `initialized`. Returns the client's
    /// initialize params.
    pub async fn complete_initialize(
        &mut self,
        capabilities: Value,
    ) -> Result<Value, HarnessError> {
        let request = self.expect_request("initialize").await?;
        self.respond(
            request.id,
            json!({
                "capabilities": capabilities,
                "serverInfo": { "name": "mock-server", "version": "0.0.0" }
            }),
        )
        .await?;
        self.expect_notification("initialized").await?;
        Ok(request.params.unwrap_or(Value::Null))
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), HarnessError> {
        self.writer
            .write_message(message)
            .await
            .map_err(|e| HarnessError::Mock(e.to_string()))
    }

    pub async fn respond(
        &mut self,
        id: impl Into<RequestId>,
        result: Value,
    ) -> Result<(), HarnessError> {
        self.send(&Message::Response(Response::success(id, result))).await
    }

    pub async fn respond_error(
        &mut self,
        id: impl Into<RequestId>,
        error: ResponseError,
    ) -> Result<(), HarnessError> {
        self.send(&Message::Response(Response::error(id, error))).await
    }

    pub async fn notify(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), HarnessError> {
        self.send(&Message::Notification(Notification::new(method, params)))
            .await
    }

    /// Issue a server-to-client request.
    pub async fn request(
        &mut self,
        id: impl Into<RequestId>,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), HarnessError> {
        self.send(&Message::Request(Request::new(id, method, params)))
            .await
    }

    /// Write bytes verbatim, framing included.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), HarnessError> {
        self.writer
            .write_raw(bytes)
            .await
            .map_err(|e| HarnessError::Mock(e.to_string()))
    }

    /// Frame `messages` and deliver them in a single write.
    pub async fn send_batch(&mut self, messages: &[Message]) -> Result<(), HarnessError> {
        let bytes: Vec<u8> = messages.iter().flat_map(codec::encode).collect();
        self.send_raw(&bytes).await
    }

    /// Close the server's side of the pipe.
    pub async fn hang_up(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

fn unexpected(wanted: &str, got: &Message) -> HarnessError {
    HarnessError::Mock(format!(
        "expected {wanted}, got {} {}",
        got.kind(),
        got.method().unwrap_or("(response)")
    ))
}
