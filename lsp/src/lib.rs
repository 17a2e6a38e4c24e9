//! Test-oriented Language Server Protocol client.
//!
//! [`LspClient`] drives one server over stdio or a socket. Framing, request
//! correlation, lifecycle gating and timeouts all live on a single connection
//! task; the client is a cloneable handle onto it.

pub mod codec;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod workspace_edit;

mod client;
mod connection;
mod dispatch;
mod documents;
mod pending;
mod registry;
mod session;

pub use client::{LspClient, PendingRequest};
pub use documents::DocumentState;
pub use registry::{Handler, NotificationHandler, RequestHandler, validate_method};
pub use session::{notification_allowed, request_allowed, required_capability};
pub use transport::{ConnectRetry, ServerCommand, ServerEndpoint};
pub use types::{ClientConfig, ClientEvent, ServerConfig};
