//! Shared test utilities and fixtures
//!
//! Common infrastructure for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use lsprobe_harness::{MockServer, mock_pair};
use lsprobe_lsp::{ClientConfig, LspClient};
use serde_json::{Value, json};

/// Generous bound for waits that should succeed quickly.
pub const WAIT: Duration = Duration::from_secs(5);

/// Default config with a short quarantine so tests never depend on it
/// expiring, and no request deadline unless a test sets one.
pub fn config() -> ClientConfig {
    ClientConfig {
        request_timeout: None,
        ..ClientConfig::default()
    }
}

/// A client connected to a mock server that has completed the handshake.
pub async fn initialized_pair(
    config: ClientConfig,
    capabilities: Value,
) -> (LspClient, MockServer) {
    let (client, mut server) = mock_pair(config);
    let init = client
        .start_request("initialize", Some(json!({})), None)
        .await
        .unwrap();
    server.complete_initialize(capabilities).await.unwrap();
    init.await.unwrap();
    (client, server)
}

pub async fn initialized(capabilities: Value) -> (LspClient, MockServer) {
    initialized_pair(config(), capabilities).await
}
