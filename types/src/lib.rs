//! Core domain types for lsprobe.
//!
//! This crate contains pure protocol types with no IO and no async: JSON-RPC
//! envelopes, correlation ids, session lifecycle states, negotiated
//! capabilities and the error taxonomy. Everything here can be used from any
//! layer of the workspace.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod capabilities;
mod error;
mod ids;
mod message;
mod session;

pub use capabilities::{ServerCapabilities, ServerInfo};
pub use error::{Anomaly, ClientError, DecodeError, DocumentError};
pub use ids::RequestId;
pub use message::{
    EnvelopeError, JSONRPC_VERSION, Message, Notification, Request, Response, ResponseError,
    ResponseOutcome, error_codes,
};
pub use session::{ExitInfo, ExitReason, SessionState};
