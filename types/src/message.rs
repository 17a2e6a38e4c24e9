//! JSON-RPC 2.0 envelopes.
//!
//! [`Message`] is a closed variant over the three envelope kinds. Conversion
//! from raw JSON ([`Message::from_value`]) performs the structural validation
//! the protocol requires and nothing more: payloads stay schema-less
//! [`serde_json::Value`]s.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::RequestId;

pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes defined by JSON-RPC 2.0 and LSP.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    pub const UNKNOWN_ERROR_CODE: i64 = -32001;
    pub const REQUEST_FAILED: i64 = -32803;
    pub const SERVER_CANCELLED: i64 = -32802;
    pub const CONTENT_MODIFIED: i64 = -32801;
    pub const REQUEST_CANCELLED: i64 = -32800;
}

/// Structured error carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Params, or `Value::Null` when the server omitted them.
    #[must_use]
    pub fn params_or_null(&self) -> &Value {
        self.params.as_ref().unwrap_or(&Value::Null)
    }
}

/// Exactly one of `result` / `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(ResponseError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: ResponseOutcome,
}

impl Response {
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Result(result),
        }
    }

    pub fn error(id: impl Into<RequestId>, error: ResponseError) -> Self {
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Error(error),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Error(_))
    }

    pub fn into_result(self) -> Result<Value, ResponseError> {
        match self.outcome {
            ResponseOutcome::Result(value) => Ok(value),
            ResponseOutcome::Error(error) => Err(error),
        }
    }
}

/// Why a syntactically valid JSON document is not a routable JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("unsupported jsonrpc version: {0}")]
    UnsupportedVersion(String),
    #[error("`method` must be a string")]
    MethodNotString,
    #[error("`id` must be an integer or a string, got {0}")]
    InvalidId(String),
    #[error("message has an `id` but neither `method` nor `result`/`error`")]
    MissingMethod,
    #[error("response is missing `id`")]
    MissingId,
    #[error("response carries both `result` and `error`")]
    ResultAndError,
    #[error("malformed `error` object: {0}")]
    MalformedError(String),
    #[error("`params` must be an object or an array")]
    InvalidParams,
}

/// A decoded JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Notification(_) => "notification",
        }
    }

    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }

    /// Serialize to a JSON-RPC 2.0 envelope. Absent params are omitted, not `null`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request(r) => {
                obj.insert("id".into(), r.id.to_value());
                obj.insert("method".into(), Value::from(r.method.as_str()));
                if let Some(params) = &r.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Notification(n) => {
                obj.insert("method".into(), Value::from(n.method.as_str()));
                if let Some(params) = &n.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response(r) => {
                obj.insert("id".into(), r.id.to_value());
                match &r.outcome {
                    ResponseOutcome::Result(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    ResponseOutcome::Error(error) => {
                        let mut err = Map::new();
                        err.insert("code".into(), Value::from(error.code));
                        err.insert("message".into(), Value::from(error.message.as_str()));
                        if let Some(data) = &error.data {
                            err.insert("data".into(), data.clone());
                        }
                        obj.insert("error".into(), Value::Object(err));
                    }
                }
            }
        }
        Value::Object(obj)
    }

    /// Validate and classify a JSON document.
    ///
    /// `method` + `id` is a request, `method` alone a notification, and `id`
    /// with exactly one of `result`/`error` a response.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(mut obj) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        match obj.remove("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => return Err(EnvelopeError::UnsupportedVersion(other.to_string())),
            None => return Err(EnvelopeError::UnsupportedVersion("<missing>".into())),
        }

        let id = match obj.remove("id") {
            Some(raw) => Some(
                RequestId::from_value(&raw)
                    .ok_or_else(|| EnvelopeError::InvalidId(raw.to_string()))?,
            ),
            None => None,
        };

        let method = match obj.remove("method") {
            Some(Value::String(m)) => Some(m),
            Some(_) => return Err(EnvelopeError::MethodNotString),
            None => None,
        };

        if let Some(method) = method {
            let params = parse_params(obj.remove("params"))?;
            return Ok(match id {
                Some(id) => Self::Request(Request { id, method, params }),
                None => Self::Notification(Notification { method, params }),
            });
        }

        let result = obj.remove("result");
        let error = obj.remove("error");
        let Some(id) = id else {
            return Err(if result.is_some() || error.is_some() {
                EnvelopeError::MissingId
            } else {
                EnvelopeError::MissingMethod
            });
        };

        let outcome = match (result, error) {
            (Some(result), None) => ResponseOutcome::Result(result),
            (None, Some(error)) => ResponseOutcome::Error(
                serde_json::from_value(error)
                    .map_err(|e| EnvelopeError::MalformedError(e.to_string()))?,
            ),
            (Some(_), Some(_)) => return Err(EnvelopeError::ResultAndError),
            (None, None) => return Err(EnvelopeError::MissingMethod),
        };

        Ok(Self::Response(Response { id, outcome }))
    }
}

fn parse_params(params: Option<Value>) -> Result<Option<Value>, EnvelopeError> {
    match params {
        None | Some(Value::Null) => Ok(None),
        Some(p @ (Value::Object(_) | Value::Array(_))) => Ok(Some(p)),
        Some(_) => Err(EnvelopeError::InvalidParams),
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Self::Request(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Self::Response(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Self::Notification(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn classifies_request() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}
        }))
        .unwrap();
        assert_eq!(msg, Message::Request(Request::new(1, "initialize", Some(json!({})))));
    }

    #[test]
    fn classifies_notification_without_params() {
        let msg = Message::from_value(json!({"jsonrpc": "2.0", "method": "exit"})).unwrap();
        assert_eq!(msg, Message::Notification(Notification::new("exit", None)));
    }

    #[test]
    fn classifies_error_response() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0", "id": 7,
            "error": {"code": -32601, "message": "method not found"}
        }))
        .unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::Number(7));
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn null_result_is_a_valid_response() {
        let msg = Message::from_value(json!({"jsonrpc": "2.0", "id": 2, "result": null})).unwrap();
        assert_eq!(msg, Message::Response(Response::success(2, Value::Null)));
    }

    #[test]
    fn rejects_non_object() {
        assert_eq!(
            Message::from_value(json!([1, 2])),
            Err(EnvelopeError::NotAnObject)
        );
    }

    #[test]
    fn rejects_missing_version() {
        assert!(matches!(
            Message::from_value(json!({"id": 1, "method": "x"})),
            Err(EnvelopeError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn rejects_response_without_id() {
        assert_eq!(
            Message::from_value(json!({"jsonrpc": "2.0", "result": {}})),
            Err(EnvelopeError::MissingId)
        );
    }

    #[test]
    fn rejects_id_without_method_or_outcome() {
        assert_eq!(
            Message::from_value(json!({"jsonrpc": "2.0", "id": 3, "params": {}})),
            Err(EnvelopeError::MissingMethod)
        );
    }

    #[test]
    fn rejects_result_and_error_together() {
        assert_eq!(
            Message::from_value(json!({
                "jsonrpc": "2.0", "id": 3, "result": 1,
                "error": {"code": 1, "message": "x"}
            })),
            Err(EnvelopeError::ResultAndError)
        );
    }

    #[test]
    fn rejects_malformed_error_object() {
        assert!(matches!(
            Message::from_value(json!({"jsonrpc": "2.0", "id": 3, "error": {"message": "x"}})),
            Err(EnvelopeError::MalformedError(_))
        ));
    }

    #[test]
    fn rejects_scalar_params() {
        assert_eq!(
            Message::from_value(json!({"jsonrpc": "2.0", "method": "x", "params": 5})),
            Err(EnvelopeError::InvalidParams)
        );
    }

    #[test]
    fn rejects_null_id() {
        assert!(matches!(
            Message::from_value(json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": 1, "message": "x"}
            })),
            Err(EnvelopeError::InvalidId(_))
        ));
    }

    #[test]
    fn to_value_omits_absent_params() {
        let value = Message::from(Request::new(1, "shutdown", None)).to_value();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 1);
        assert!(value.get("params").is_none(), "params must be omitted, not null");
    }

    #[test]
    fn to_value_error_response_shape() {
        let value = Message::from(Response::error(
            5,
            ResponseError::method_not_found("client/registerCapability"),
        ))
        .to_value();
        assert_eq!(value["error"]["code"], -32601);
        assert!(value.get("result").is_none());
        assert!(
            value["error"]["message"]
                .as_str()
                .unwrap()
                .contains("client/registerCapability")
        );
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 éü/_-]{0,12}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn arb_params() -> impl Strategy<Value = Option<Value>> {
        prop_oneof![
            Just(None),
            prop::collection::btree_map("[a-z]{1,6}", arb_json(), 0..4)
                .prop_map(|m| Some(Value::Object(m.into_iter().collect()))),
            prop::collection::vec(arb_json(), 0..3).prop_map(|v| Some(Value::Array(v))),
        ]
    }

    fn arb_id() -> impl Strategy<Value = RequestId> {
        prop_oneof![
            any::<i64>().prop_map(RequestId::Number),
            "[a-z0-9-]{1,10}".prop_map(RequestId::String),
        ]
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        let method = "[a-z]{1,8}(/[a-zA-Z]{1,10})?";
        prop_oneof![
            (arb_id(), method, arb_params())
                .prop_map(|(id, m, p)| Message::Request(Request::new(id, m, p))),
            (method, arb_params())
                .prop_map(|(m, p)| Message::Notification(Notification::new(m, p))),
            (arb_id(), arb_json()).prop_map(|(id, r)| Message::Response(Response::success(id, r))),
            (
                arb_id(),
                any::<i64>(),
                "[ -~]{0,20}",
                prop::option::of(arb_json().prop_filter("non-null data", |v| !v.is_null())),
            )
                .prop_map(|(id, code, msg, data)| {
                    let mut err = ResponseError::new(code, msg);
                    err.data = data;
                    Message::Response(Response::error(id, err))
                }),
        ]
    }

    proptest! {
        #[test]
        fn value_roundtrip(msg in arb_message()) {
            let back = Message::from_value(msg.to_value()).unwrap();
            prop_assert_eq!(back, msg);
        }
    }
}
