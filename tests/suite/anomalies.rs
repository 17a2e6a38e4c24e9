//! Misbehaving servers: anomalies are recorded and never fail a call.

use std::time::Duration;

use lsprobe_harness::{ExpectMode, Harness};
use lsprobe_types::{Anomaly, RequestId};
use serde_json::json;

use crate::common::{self, WAIT};

#[tokio::test]
async fn malformed_frame_is_skipped() {
    let (client, mut server) = common::initialized(json!({})).await;
    let harness = Harness::new(client.clone());

    server
        .send_raw(b"Content-Length: 7\r\n\r\nnotjson")
        .await
        .unwrap();
    server
        .notify("window/logMessage", Some(json!({"type": 4, "message": "after"})))
        .await
        .unwrap();

    harness
        .expect_anomaly(|a| matches!(a, Anomaly::MalformedFrame(_)), WAIT)
        .await
        .unwrap();
    harness
        .expect_notification_params(
            "window/logMessage",
            &json!({"message": "after"}),
            WAIT,
            ExpectMode::Eventually,
        )
        .await
        .unwrap();
    assert_eq!(client.state(), lsprobe_types::SessionState::Initialized);
}

#[tokio::test]
async fn envelope_without_jsonrpc_version_is_reported() {
    let (client, mut server) = common::initialized(json!({})).await;
    let harness = Harness::new(client);

    let body = br#"{"id":1,"result":null}"#;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(body);
    server.send_raw(&frame).await.unwrap();

    let anomaly = harness
        .expect_anomaly(|a| matches!(a, Anomaly::InvalidEnvelope { .. }), WAIT)
        .await
        .unwrap();
    let Anomaly::InvalidEnvelope { raw, .. } = anomaly else {
        unreachable!();
    };
    assert_eq!(raw, json!({"id": 1, "result": null}));
}

#[tokio::test]
async fn response_after_timeout_is_late() {
    let (client, mut server) = common::initialized(json!({})).await;
    let harness = Harness::new(client.clone());

    let err = client
        .request_with_timeout("textDocument/hover", None, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let request = server.expect_request("textDocument/hover").await.unwrap();
    server.expect_notification("$/cancelRequest").await.unwrap();
    server.respond(request.id, json!(null)).await.unwrap();

    let anomaly = harness
        .expect_anomaly(|a| matches!(a, Anomaly::LateResponse { .. }), WAIT)
        .await
        .unwrap();
    assert_eq!(
        anomaly,
        Anomaly::LateResponse {
            id: RequestId::Number(2),
            method: "textDocument/hover".into(),
        }
    );
}

#[tokio::test]
async fn second_response_is_duplicate() {
    let (client, mut server) = common::initialized(json!({})).await;
    let harness = Harness::new(client.clone());

    let call = client.start_request("test/once", None, None).await.unwrap();
    let request = server.expect_request("test/once").await.unwrap();
    server.respond(request.id.clone(), json!(1)).await.unwrap();
    server.respond(request.id, json!(2)).await.unwrap();

    assert_eq!(call.await.unwrap(), json!(1));
    let anomaly = harness
        .expect_anomaly(|a| matches!(a, Anomaly::DuplicateResponse { .. }), WAIT)
        .await
        .unwrap();
    assert_eq!(anomaly.kind(), "DuplicateResponse");
}

#[tokio::test]
async fn strict_mode_flags_unhandled_notifications() {
    let (client, mut server) = common::initialized(json!({})).await;
    let harness = Harness::new(client.clone());
    client
        .on_notification("textDocument/publishDiagnostics", |_| {})
        .unwrap();
    harness.set_strict(true).unwrap();
    client.outstanding_requests().await.unwrap();

    server
        .notify(
            "textDocument/publishDiagnostics",
            Some(json!({"uri": "file:///a", "diagnostics": []})),
        )
        .await
        .unwrap();
    server.notify("$/progress", Some(json!({"token": 1}))).await.unwrap();
    server.notify("custom/status", None).await.unwrap();

    let anomaly = harness
        .expect_anomaly(|a| matches!(a, Anomaly::UnhandledNotification(_)), WAIT)
        .await
        .unwrap();
    assert_eq!(anomaly, Anomaly::UnhandledNotification("custom/status".into()));
    harness
        .expect_notification("custom/status", |_| true, WAIT, ExpectMode::Eventually)
        .await
        .unwrap();
    assert_eq!(harness.anomalies().len(), 1);
}
