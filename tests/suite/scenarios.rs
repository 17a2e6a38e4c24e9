//! End-to-end scenarios against a mock server and a real process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lsprobe_harness::{ExpectMode, Harness, mock_pair};
use lsprobe_types::{
    Anomaly, ClientError, Message, Notification, RequestId, Response, ResponseError, SessionState,
    error_codes,
};
use serde_json::json;

use crate::common::{self, WAIT};

#[tokio::test]
async fn initialize_handshake_reaches_initialized() {
    let (client, mut server) = mock_pair(common::config());
    assert_eq!(client.state(), SessionState::Uninitialized);

    let init = client
        .start_request("initialize", Some(json!({})), None)
        .await
        .unwrap();
    assert_eq!(client.state(), SessionState::Initializing);

    let request = server.expect_request("initialize").await.unwrap();
    assert_eq!(request.id, RequestId::Number(1));
    assert_eq!(request.params, Some(json!({})));
    server
        .respond(request.id, json!({"capabilities": {"hoverProvider": true}}))
        .await
        .unwrap();

    let result = init.await.unwrap();
    assert_eq!(result["capabilities"]["hoverProvider"], true);
    let initialized = server.expect_notification("initialized").await.unwrap();
    assert_eq!(initialized.params, Some(json!({})));
    assert_eq!(client.state(), SessionState::Initialized);
    assert!(client.require_capability("hoverProvider").is_ok());
}

#[tokio::test]
async fn protocol_error_code_is_surfaced() {
    let (client, mut server) = common::initialized(json!({})).await;

    let mut pending = Vec::new();
    for _ in 0..6 {
        pending.push(client.start_request("custom/unknown", None, None).await.unwrap());
    }
    let ids: Vec<_> = pending.iter().map(|p| p.id().clone()).collect();
    assert_eq!(ids.first(), Some(&RequestId::Number(2)));
    assert_eq!(ids.last(), Some(&RequestId::Number(7)));

    for _ in 0..6 {
        server.expect_request("custom/unknown").await.unwrap();
    }
    server
        .respond_error(7, ResponseError::new(error_codes::METHOD_NOT_FOUND, "Method not found"))
        .await
        .unwrap();

    let last = pending.pop().unwrap();
    let err = last.await.unwrap_err();
    assert_eq!(err.protocol_code(), Some(-32601));
    assert!(matches!(err, ClientError::Protocol(ref e) if e.message == "Method not found"));

    let outstanding = client.outstanding_requests().await.unwrap();
    assert_eq!(outstanding.len(), 5);
    assert!(!outstanding.contains(&RequestId::Number(7)));
}

#[tokio::test]
async fn unanswered_request_times_out_and_is_cancelled() {
    let (client, mut server) = common::initialized(json!({})).await;

    let err = client
        .request_with_timeout("textDocument/hover", Some(json!({})), Duration::from_millis(50))
        .await
        .unwrap_err();
    let ClientError::Timeout { method, id, after } = err else {
        panic!("expected timeout, got {err:?}");
    };
    assert_eq!(method, "textDocument/hover");
    assert_eq!(id, RequestId::Number(2));
    assert_eq!(after, Duration::from_millis(50));
    assert!(client.outstanding_requests().await.unwrap().is_empty());

    server.expect_request("textDocument/hover").await.unwrap();
    let cancel = server.expect_notification("$/cancelRequest").await.unwrap();
    assert_eq!(cancel.params, Some(json!({"id": 2})));
}

#[tokio::test]
async fn unsolicited_response_is_reported_once() {
    let (client, mut server) = common::initialized(json!({})).await;
    let harness = Harness::new(client.clone());

    let call = client
        .start_request("workspace/symbol", Some(json!({"query": ""})), None)
        .await
        .unwrap();
    let request = server.expect_request("workspace/symbol").await.unwrap();

    server.respond(42, json!("stray")).await.unwrap();
    let anomaly = harness
        .expect_anomaly(|a| matches!(a, Anomaly::UnsolicitedResponse(_)), WAIT)
        .await
        .unwrap();
    assert_eq!(anomaly, Anomaly::UnsolicitedResponse(RequestId::Number(42)));

    assert_eq!(client.outstanding_requests().await.unwrap(), vec![request.id.clone()]);
    server.respond(request.id, json!([])).await.unwrap();
    assert_eq!(call.await.unwrap(), json!([]));

    let unsolicited = harness
        .anomalies()
        .into_iter()
        .filter(|a| matches!(a, Anomaly::UnsolicitedResponse(_)))
        .count();
    assert_eq!(unsolicited, 1);
}

#[tokio::test]
async fn frames_in_one_write_are_routed_in_order() {
    let (client, mut server) = common::initialized(json!({})).await;
    let harness = Harness::new(client.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    client
        .on_notification("window/logMessage", {
            let seen = Arc::clone(&seen);
            move |n: &Notification| {
                let message = n.params_or_null()["message"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                seen.lock().unwrap().push(message);
            }
        })
        .unwrap();

    let first = client.start_request("test/first", None, None).await.unwrap();
    let second = client.start_request("test/second", None, None).await.unwrap();
    server.expect_request("test/first").await.unwrap();
    server.expect_request("test/second").await.unwrap();

    server
        .send_batch(&[
            Message::Notification(Notification::new(
                "window/logMessage",
                Some(json!({"type": 3, "message": "one"})),
            )),
            Message::Response(Response::success(3, json!("second"))),
            Message::Notification(Notification::new(
                "window/logMessage",
                Some(json!({"type": 3, "message": "two"})),
            )),
            Message::Response(Response::success(2, json!("first"))),
        ])
        .await
        .unwrap();

    assert_eq!(second.await.unwrap(), json!("second"));
    assert_eq!(first.await.unwrap(), json!("first"));
    assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);

    harness
        .expect_notification_params(
            "window/logMessage",
            &json!({"message": "two"}),
            WAIT,
            ExpectMode::Eventually,
        )
        .await
        .unwrap();
    let recorded: Vec<_> = harness
        .notifications_for("window/logMessage")
        .iter()
        .map(|n| n.params_or_null()["message"].clone())
        .collect();
    assert_eq!(recorded, vec![json!("one"), json!("two")]);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn killed_server_fails_outstanding_requests() {
    use lsprobe_lsp::{LspClient, ServerCommand, ServerEndpoint};

    // Answers `initialize` after its first byte arrives, then idles.
    let script = r#"body='{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}'
dd bs=1 count=1 of=/dev/null 2>/dev/null
printf 'Content-Length: %d\r\n\r\n%s' "${#body}" "$body"
exec sleep 60"#;
    let endpoint = ServerEndpoint::Process(ServerCommand::new("sh").args(["-c", script]));
    let client = LspClient::connect(&endpoint, common::config()).await.unwrap();
    let pid = client.server_pid().expect("spawned server has a pid");

    client.initialize(json!({})).await.unwrap();
    assert_eq!(client.state(), SessionState::Initialized);

    let a = client.start_request("textDocument/hover", None, None).await.unwrap();
    let b = client.start_request("textDocument/definition", None, None).await.unwrap();
    assert_eq!(client.outstanding_requests().await.unwrap().len(), 2);

    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    for call in [a, b] {
        let err = tokio::time::timeout(WAIT, call).await.unwrap().unwrap_err();
        assert!(
            matches!(err, ClientError::ProcessExited(_) | ClientError::TransportClosed(_)),
            "unexpected error {err:?}"
        );
    }
    let reason = tokio::time::timeout(WAIT, client.wait_for_exit())
        .await
        .unwrap()
        .unwrap();
    assert!(reason.is_abnormal());
    assert_eq!(client.state(), SessionState::Exited);
    assert!(matches!(
        client.request("textDocument/hover", None).await,
        Err(ClientError::SessionNotReady { .. }
            | ClientError::TransportClosed(_)
            | ClientError::ProcessExited(_))
    ));
}
