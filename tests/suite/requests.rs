//! Request routing in both directions.

use std::time::Duration;

use lsprobe_lsp::ClientConfig;
use lsprobe_types::{ClientError, RequestId, ResponseError, error_codes};
use serde_json::{Value, json};

use crate::common::{self, WAIT};

#[tokio::test]
async fn pipelined_responses_may_arrive_in_any_order() {
    let (client, mut server) = common::initialized(json!({})).await;

    let mut calls = Vec::new();
    for n in 0..3 {
        calls.push(
            client
                .start_request("test/echo", Some(json!({"n": n})), None)
                .await
                .unwrap(),
        );
    }
    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(server.expect_request("test/echo").await.unwrap());
    }
    for request in requests.into_iter().rev() {
        let n = request.params.as_ref().unwrap()["n"].clone();
        server.respond(request.id, json!({"echo": n})).await.unwrap();
    }
    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap(), json!({"echo": n}));
    }
    assert!(client.outstanding_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn server_request_is_answered_by_handler() {
    let (client, mut server) = common::initialized(json!({})).await;
    client
        .on_request("workspace/configuration", |params: Option<Value>| async move {
            let items = params
                .as_ref()
                .and_then(|p| p["items"].as_array())
                .map_or(0, Vec::len);
            Ok(Value::Array(vec![json!({"enabled": true}); items]))
        })
        .unwrap();
    // Commands are processed in order, so the handler is registered once this returns.
    client.outstanding_requests().await.unwrap();

    server
        .request(
            "cfg-1",
            "workspace/configuration",
            Some(json!({"items": [{"section": "a"}, {"section": "b"}]})),
        )
        .await
        .unwrap();
    let response = server.expect_response().await.unwrap();
    assert_eq!(response.id, RequestId::from("cfg-1"));
    assert_eq!(
        response.outcome,
        lsprobe_types::ResponseOutcome::Result(json!([{"enabled": true}, {"enabled": true}]))
    );
}

#[tokio::test]
async fn handler_error_becomes_error_reply() {
    let (client, mut server) = common::initialized(json!({})).await;
    client
        .on_request("window/showMessageRequest", |_| async {
            Err(ResponseError::new(error_codes::REQUEST_FAILED, "no user here"))
        })
        .unwrap();
    client.outstanding_requests().await.unwrap();

    server
        .request(9_i64, "window/showMessageRequest", Some(json!({"type": 1, "message": "?"})))
        .await
        .unwrap();
    let response = server.expect_response().await.unwrap();
    let lsprobe_types::ResponseOutcome::Error(error) = response.outcome else {
        panic!("expected an error reply");
    };
    assert_eq!(error.code, error_codes::REQUEST_FAILED);
}

#[tokio::test]
async fn unknown_server_request_gets_method_not_found() {
    let (_client, mut server) = common::initialized(json!({})).await;

    server
        .request(5_i64, "custom/neverRegistered", None)
        .await
        .unwrap();
    let response = server.expect_response().await.unwrap();
    assert_eq!(response.id, RequestId::Number(5));
    let lsprobe_types::ResponseOutcome::Error(error) = response.outcome else {
        panic!("expected an error reply");
    };
    assert_eq!(error.code, error_codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn explicit_cancel_resolves_waiter() {
    let (client, mut server) = common::initialized(json!({})).await;

    let call = client
        .start_request("workspace/symbol", Some(json!({"query": "x"})), None)
        .await
        .unwrap();
    let id = call.id().clone();
    server.expect_request("workspace/symbol").await.unwrap();

    assert!(client.cancel(&id).await.unwrap());
    assert!(!client.cancel(&id).await.unwrap());
    assert_eq!(call.await, Err(ClientError::Cancelled { id: id.clone() }));

    let notice = server.expect_notification("$/cancelRequest").await.unwrap();
    assert_eq!(notice.params, Some(json!({"id": 2})));
}

#[tokio::test]
async fn configured_timeout_applies_to_every_request() {
    let config = ClientConfig {
        request_timeout: Some(Duration::from_millis(30)),
        ..ClientConfig::default()
    };
    let (client, mut server) = common::initialized_pair(config, json!({})).await;

    let err = client.request("test/slow", None).await.unwrap_err();
    assert!(err.is_timeout());

    server.expect_request("test/slow").await.unwrap();
    server.expect_notification("$/cancelRequest").await.unwrap();

    // A per-call override wins over the configured deadline.
    let call = client
        .start_request("test/slow", None, Some(WAIT))
        .await
        .unwrap();
    let request = server.expect_request("test/slow").await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    server.respond(request.id, json!("done")).await.unwrap();
    assert_eq!(call.await.unwrap(), json!("done"));
}

#[tokio::test]
async fn capability_checks_use_frozen_capabilities() {
    let (client, _server) = common::initialized(json!({
        "hoverProvider": true,
        "definitionProvider": false
    }))
    .await;

    assert!(client.require_method_support("textDocument/hover").is_ok());
    assert_eq!(
        client.require_method_support("textDocument/definition"),
        Err(ClientError::CapabilityNotSupported("definitionProvider".into()))
    );
    assert!(client.require_method_support("custom/anything").is_ok());
    assert!(matches!(
        client.require_capability("renameProvider"),
        Err(ClientError::CapabilityNotSupported(_))
    ));
}

#[tokio::test]
async fn server_requests_are_answered_one_at_a_time() {
    let (client, mut server) = common::initialized(json!({})).await;
    client
        .on_request("slow/op", |_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!("slow"))
        })
        .unwrap();
    client
        .on_request("fast/op", |_| async { Ok(json!("fast")) })
        .unwrap();
    client.outstanding_requests().await.unwrap();

    server.request("s1", "slow/op", None).await.unwrap();
    server.request("s2", "fast/op", None).await.unwrap();
    let first = server.expect_response().await.unwrap();
    let second = server.expect_response().await.unwrap();
    assert_eq!(first.id, RequestId::from("s1"));
    assert_eq!(second.id, RequestId::from("s2"));
}

fn rename_edit(uri: &str, version: Option<i32>) -> Value {
    json!({
        "label": "rename",
        "edit": {
            "documentChanges": [{
                "textDocument": {"uri": uri, "version": version},
                "edits": [{
                    "range": {
                        "start": {"line": 0, "character": 3},
                        "end": {"line": 0, "character": 7}
                    },
                    "newText": "start"
                }]
            }]
        }
    })
}

#[tokio::test]
async fn apply_edit_updates_open_document() {
    let (client, mut server) = common::initialized(json!({})).await;
    client.handle_workspace_edits().unwrap();
    let uri = "file:///ws/main.rs";
    client.open_document(uri, "rust", "fn main() {}").await.unwrap();
    server.expect_notification("textDocument/didOpen").await.unwrap();

    server
        .request(1_i64, "workspace/applyEdit", Some(rename_edit(uri, Some(0))))
        .await
        .unwrap();
    let change = server.expect_notification("textDocument/didChange").await.unwrap();
    let params = change.params.unwrap();
    assert_eq!(params["textDocument"]["version"], 1);
    assert_eq!(params["contentChanges"][0]["text"], "fn start() {}");

    let response = server.expect_response().await.unwrap();
    assert_eq!(
        response.outcome,
        lsprobe_types::ResponseOutcome::Result(json!({"applied": true}))
    );
    let doc = client.document(uri).await.unwrap().unwrap();
    assert_eq!((doc.version, doc.content.as_str()), (1, "fn start() {}"));
}

#[tokio::test]
async fn apply_edit_refuses_stale_version() {
    let (client, mut server) = common::initialized(json!({})).await;
    client.handle_workspace_edits().unwrap();
    let uri = "file:///ws/main.rs";
    client.open_document(uri, "rust", "fn main() {}").await.unwrap();
    client.change_document(uri, "fn main() { }").await.unwrap();
    server.expect_notification("textDocument/didOpen").await.unwrap();
    server.expect_notification("textDocument/didChange").await.unwrap();

    server
        .request(2_i64, "workspace/applyEdit", Some(rename_edit(uri, Some(0))))
        .await
        .unwrap();
    // The reply comes straight back; no didChange precedes it.
    let response = server.expect_response().await.unwrap();
    let lsprobe_types::ResponseOutcome::Result(result) = response.outcome else {
        panic!("expected a result");
    };
    assert_eq!(result["applied"], false);
    assert_eq!(result["failedChange"], 0);
    assert!(
        result["failureReason"]
            .as_str()
            .unwrap()
            .contains("expected 0, found 1")
    );
    assert_eq!(client.document_version(uri).await.unwrap(), Some(1));

    // Versioned edits need the document to be open.
    server
        .request(
            3_i64,
            "workspace/applyEdit",
            Some(rename_edit("file:///ws/other.rs", Some(4))),
        )
        .await
        .unwrap();
    let response = server.expect_response().await.unwrap();
    let lsprobe_types::ResponseOutcome::Result(result) = response.outcome else {
        panic!("expected a result");
    };
    assert_eq!(result["applied"], false);
}

#[tokio::test]
async fn apply_edit_rewrites_files_that_are_not_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lib.rs");
    std::fs::write(&path, "fn main() {}\n").unwrap();
    let uri = lsprobe_lsp::protocol::path_to_file_uri(&path).unwrap().to_string();

    let (client, mut server) = common::initialized(json!({})).await;
    client.handle_workspace_edits().unwrap();
    client.outstanding_requests().await.unwrap();

    let edit = json!({
        "edit": {
            "changes": {
                uri.as_str(): [
                    {
                        "range": {
                            "start": {"line": 1, "character": 0},
                            "end": {"line": 1, "character": 0}
                        },
                        "newText": "// end\n"
                    },
                    {
                        "range": {
                            "start": {"line": 0, "character": 3},
                            "end": {"line": 0, "character": 7}
                        },
                        "newText": "run"
                    }
                ]
            }
        }
    });
    server
        .request(4_i64, "workspace/applyEdit", Some(edit))
        .await
        .unwrap();
    let response = server.expect_response().await.unwrap();
    assert_eq!(
        response.outcome,
        lsprobe_types::ResponseOutcome::Result(json!({"applied": true}))
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "fn run() {}\n// end\n");
}
