//! Recorded interaction fixtures.
//!
//! A fixture is a JSON document:
//!
//! ```json
//! {
//!   "name": "hover on a local",
//!   "workspace": "workspace",
//!   "initialize": { "rootUri": "${workspace_uri}", "capabilities": {} },
//!   "steps": [
//!     { "notify": "textDocument/didOpen", "params": { ... } },
//!     { "request": "textDocument/hover", "params": { ... }, "result": { ... } },
//!     { "request": "textDocument/rename", "params": { ... }, "error": { "code": -32602 } },
//!     { "expect_notification": "textDocument/publishDiagnostics",
//!       "params": { ... }, "mode": "eventually", "timeout_ms": 5000 }
//!   ]
//! }
//! ```
//!
//! `workspace` is resolved relative to the fixture file and defaults to the
//! fixture's directory. Every string may use `${workspace}` (the workspace
//! path) and `${workspace_uri}` (its `file://` URI).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::HarnessError;
use crate::harness::ExpectMode;

const WORKSPACE: &str = "${workspace}";
const WORKSPACE_URI: &str = "${workspace_uri}";

#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub name: String,
    pub path: PathBuf,
    pub workspace: PathBuf,
    pub workspace_uri: String,
    /// `initialize` params. `None` means the client defaults.
    pub initialize: Option<Value>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Request {
        method: String,
        params: Option<Value>,
        expect: ResponseExpectation,
        timeout: Option<Duration>,
    },
    Notify {
        method: String,
        params: Option<Value>,
    },
    ExpectNotification {
        method: String,
        /// Structural subset the params must contain.
        params: Option<Value>,
        mode: ExpectMode,
        timeout: Option<Duration>,
    },
}

impl Step {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Step::Request { method, .. } => format!("request {method}"),
            Step::Notify { method, .. } => format!("notify {method}"),
            Step::ExpectNotification { method, .. } => format!("expect notification {method}"),
        }
    }
}

/// What a request step must produce.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseExpectation {
    /// Any successful result.
    Success,
    /// A result containing this structure.
    Result(Value),
    /// An error containing this structure (e.g. `{"code": -32601}`).
    Error(Value),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFixture {
    name: String,
    workspace: Option<PathBuf>,
    initialize: Option<Value>,
    #[serde(default)]
    steps: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRequest {
    request: String,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<Value>,
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNotify {
    notify: String,
    params: Option<Value>,
}

#[derive(Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum RawMode {
    #[default]
    Next,
    Eventually,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExpect {
    expect_notification: String,
    params: Option<Value>,
    #[serde(default)]
    mode: RawMode,
    timeout_ms: Option<u64>,
}

/// Load a fixture, resolving its workspace relative to the file.
pub fn load_fixture(path: &Path) -> Result<Fixture, HarnessError> {
    load_fixture_in(path, None)
}

/// Load a fixture against an explicit workspace root, ignoring the one the
/// fixture names.
pub fn load_fixture_in(path: &Path, workspace: Option<&Path>) -> Result<Fixture, HarnessError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| HarnessError::fixture(path, format!("cannot read: {e}")))?;
    parse_fixture(&text, path, workspace)
}

/// Parse fixture text. `origin` is used for error messages and to resolve a
/// relative workspace.
pub fn parse_fixture(
    text: &str,
    origin: &Path,
    workspace: Option<&Path>,
) -> Result<Fixture, HarnessError> {
    let raw: RawFixture = serde_json::from_str(text)
        .map_err(|e| HarnessError::fixture(origin, format!("invalid fixture: {e}")))?;

    let base = origin.parent().unwrap_or_else(|| Path::new("."));
    let workspace = match (workspace, &raw.workspace) {
        (Some(explicit), _) => explicit.to_path_buf(),
        (None, Some(named)) => base.join(named),
        (None, None) => base.to_path_buf(),
    };
    let workspace = absolute(&workspace);
    let workspace_uri = url::Url::from_directory_path(&workspace)
        .map_err(|()| {
            HarnessError::fixture(
                origin,
                format!("workspace {} has no file URI", workspace.display()),
            )
        })?
        .to_string();
    let workspace_uri = workspace_uri.trim_end_matches('/').to_string();

    let workspace_str = workspace.to_string_lossy().into_owned();
    let fill = |value: Value| substitute(value, &workspace_str, &workspace_uri);

    let steps = raw
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, step)| {
            parse_step(fill(step)).map_err(|reason| {
                HarnessError::fixture(origin, format!("step {}: {reason}", i + 1))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Fixture {
        name: raw.name,
        path: origin.to_path_buf(),
        initialize: raw.initialize.map(fill),
        workspace,
        workspace_uri,
        steps,
    })
}

fn parse_step(value: Value) -> Result<Step, String> {
    let Some(object) = value.as_object() else {
        return Err("a step must be an object".into());
    };
    let millis = |ms: Option<u64>| ms.map(Duration::from_millis);
    if object.contains_key("request") {
        let raw: RawRequest = serde_json::from_value(value).map_err(|e| e.to_string())?;
        let expect = match (raw.result, raw.error) {
            (Some(_), Some(_)) => return Err("a request expects either result or error".into()),
            (Some(result), None) => ResponseExpectation::Result(result),
            (None, Some(error)) => ResponseExpectation::Error(error),
            (None, None) => ResponseExpectation::Success,
        };
        Ok(Step::Request {
            method: raw.request,
            params: raw.params,
            expect,
            timeout: millis(raw.timeout_ms),
        })
    } else if object.contains_key("notify") {
        let raw: RawNotify = serde_json::from_value(value).map_err(|e| e.to_string())?;
        Ok(Step::Notify {
            method: raw.notify,
            params: raw.params,
        })
    } else if object.contains_key("expect_notification") {
        let raw: RawExpect = serde_json::from_value(value).map_err(|e| e.to_string())?;
        Ok(Step::ExpectNotification {
            method: raw.expect_notification,
            params: raw.params,
            mode: match raw.mode {
                RawMode::Next => ExpectMode::Next,
                RawMode::Eventually => ExpectMode::Eventually,
            },
            timeout: millis(raw.timeout_ms),
        })
    } else {
        Err("expected one of `request`, `notify` or `expect_notification`".into())
    }
}

fn substitute(value: Value, workspace: &str, workspace_uri: &str) -> Value {
    match value {
        Value::String(s) if s.contains("${") => Value::String(
            s.replace(WORKSPACE_URI, workspace_uri)
                .replace(WORKSPACE, workspace),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute(v, workspace, workspace_uri))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute(v, workspace, workspace_uri)))
                .collect(),
        ),
        other => other,
    }
}

fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
}
