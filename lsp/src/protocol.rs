//! Builders for the LSP payloads the client sends on its own behalf.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

/// Default `initialize` params: a client advertising the features the
/// harness exercises, rooted at `root_uri` when one is given.
#[must_use]
pub fn initialize_params(root_uri: Option<&str>) -> Value {
    let mut params = json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": "lsprobe",
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                },
                "hover": { "contentFormat": ["markdown", "plaintext"] },
                "definition": { "linkSupport": true },
                "references": {},
                "completion": {
                    "completionItem": { "snippetSupport": false }
                },
                "documentSymbol": { "hierarchicalDocumentSymbolSupport": true }
            },
            "workspace": {
                "workspaceFolders": true,
                "configuration": true,
                "applyEdit": true,
                "workspaceEdit": { "documentChanges": true }
            }
        }
    });
    if let Some(root_uri) = root_uri {
        params["workspaceFolders"] = json!([{ "uri": root_uri, "name": "workspace" }]);
    }
    params
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn cancel_params(id: i64) -> Value {
    json!({ "id": id })
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[must_use]
pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
