//! Session lifecycle through the public client API.

use lsprobe_harness::mock_pair;
use lsprobe_lsp::ClientEvent;
use lsprobe_types::{ClientError, ExitReason, ResponseError, SessionState, error_codes};
use serde_json::{Value, json};

use crate::common::{self, WAIT};

#[tokio::test]
async fn graceful_shutdown_sends_shutdown_then_exit() {
    let (client, mut server) = common::initialized(json!({})).await;
    let mut events = client.subscribe_events();

    let stopping = tokio::spawn({
        let client = client.clone();
        async move { client.shutdown().await }
    });
    let shutdown = server.expect_request("shutdown").await.unwrap();
    server.respond(shutdown.id, Value::Null).await.unwrap();
    server.expect_notification("exit").await.unwrap();

    stopping.await.unwrap().unwrap();
    assert_eq!(client.state(), SessionState::Exited);
    assert_eq!(client.exit_reason(), Some(ExitReason::Graceful));

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(states, vec![SessionState::ShuttingDown, SessionState::Exited]);
}

#[tokio::test]
async fn only_exit_is_allowed_after_shutdown() {
    let (client, mut server) = common::initialized(json!({})).await;

    let shutdown = client.start_request("shutdown", None, None).await.unwrap();
    let request = server.expect_request("shutdown").await.unwrap();
    server.respond(request.id, Value::Null).await.unwrap();
    shutdown.await.unwrap();
    assert_eq!(client.state(), SessionState::ShuttingDown);

    let err = client.request("textDocument/hover", None).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::SessionNotReady { state: SessionState::ShuttingDown, .. }
    ));
    assert!(client.notify("textDocument/didSave", None).await.is_err());

    client.notify("exit", None).await.unwrap();
    assert_eq!(client.wait_for_exit().await, Some(ExitReason::Graceful));
}

#[tokio::test]
async fn initialize_error_ends_the_session() {
    let (client, mut server) = mock_pair(common::config());

    let init = client.start_request("initialize", Some(json!({})), None).await.unwrap();
    let request = server.expect_request("initialize").await.unwrap();
    server
        .respond_error(
            request.id,
            ResponseError::new(error_codes::INTERNAL_ERROR, "cannot index workspace"),
        )
        .await
        .unwrap();

    let err = init.await.unwrap_err();
    let ClientError::InitializeFailed { cause } = err else {
        panic!("expected initialize failure, got {err:?}");
    };
    assert_eq!(cause.protocol_code(), Some(error_codes::INTERNAL_ERROR));
    assert!(matches!(
        client.wait_for_exit().await,
        Some(ExitReason::InitializeFailed(_))
    ));
    assert!(client.capabilities().is_none());
}

#[tokio::test]
async fn server_hang_up_fails_outstanding_requests() {
    let (client, mut server) = common::initialized(json!({})).await;

    let call = client.start_request("textDocument/hover", None, None).await.unwrap();
    server.expect_request("textDocument/hover").await.unwrap();
    server.hang_up().await;

    let err = tokio::time::timeout(WAIT, call).await.unwrap().unwrap_err();
    assert!(err.is_connection_lost(), "unexpected error {err:?}");
    assert!(matches!(
        client.wait_for_exit().await,
        Some(ExitReason::TransportLost(_))
    ));
}

#[tokio::test]
async fn close_before_initialize_is_clean() {
    let (client, _server) = mock_pair(common::config());
    client.close().await;
    client.close().await;
    assert_eq!(client.state(), SessionState::Exited);
    assert!(client.initialize(json!({})).await.is_err());
}

#[tokio::test]
async fn documents_follow_the_session() {
    let (client, mut server) = common::initialized(json!({"textDocumentSync": 1})).await;
    let uri = "file:///ws/main.rs";

    assert!(client.open_document(uri, "rust", "fn main() {}").await.unwrap());
    let open = server.expect_notification("textDocument/didOpen").await.unwrap();
    assert_eq!(
        open.params.unwrap()["textDocument"],
        json!({"uri": uri, "languageId": "rust", "version": 0, "text": "fn main() {}"})
    );

    assert_eq!(client.change_document(uri, "fn main() { }").await.unwrap(), 1);
    let change = server.expect_notification("textDocument/didChange").await.unwrap();
    let params = change.params.unwrap();
    assert_eq!(params["textDocument"]["version"], 1);
    assert_eq!(params["contentChanges"][0]["text"], "fn main() { }");

    assert!(client.close_document(uri).await.unwrap());
    server.expect_notification("textDocument/didClose").await.unwrap();
    assert_eq!(client.document_version(uri).await.unwrap(), None);
    assert!(matches!(
        client.change_document(uri, "").await,
        Err(ClientError::Document(_))
    ));
}
