//! Workspace-rooted request helpers with assertion objects.
//!
//! ```ignore
//! let interaction = Interaction::new(client, workspace);
//! interaction.create_file("main.py", "x = 1\nprint(x)\n").await?;
//! interaction
//!     .request_definition("main.py", 1, 6)
//!     .await?
//!     .expect_definition("main.py", 0, 0, 0, 1)?;
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};

use lsprobe_lsp::LspClient;
use lsprobe_lsp::protocol::{file_uri_to_path, path_to_file_uri};
use serde_json::{Value, json};

use crate::error::HarnessError;

pub struct Interaction {
    client: LspClient,
    workspace_root: PathBuf,
}

/// A zero-based `(line, character)` range as the server reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: (u64, u64),
    pub end: (u64, u64),
}

impl Span {
    #[must_use]
    pub fn new(start_line: u64, start_col: u64, end_line: u64, end_col: u64) -> Self {
        Self {
            start: (start_line, start_col),
            end: (end_line, end_col),
        }
    }

    fn from_lsp(range: &Value) -> Option<Self> {
        let pos = |p: &Value| Some((p.get("line")?.as_u64()?, p.get("character")?.as_u64()?));
        Some(Self {
            start: pos(range.get("start")?)?,
            end: pos(range.get("end")?)?,
        })
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.start.0, self.start.1, self.end.0, self.end.1
        )
    }
}

impl Interaction {
    #[must_use]
    pub fn new(client: LspClient, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            client,
            workspace_root: workspace_root.into(),
        }
    }

    pub fn client(&self) -> &LspClient {
        &self.client
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    #[must_use]
    pub fn full_path(&self, relative_path: &str) -> PathBuf {
        self.workspace_root.join(relative_path)
    }

    pub fn uri(&self, relative_path: &str) -> Result<String, HarnessError> {
        let path = self.full_path(relative_path);
        path_to_file_uri(&path)
            .map(String::from)
            .map_err(|e| HarnessError::assertion(e.to_string()))
    }

    /// Write a file under the workspace, creating parent directories.
    pub async fn create_file(
        &self,
        relative_path: &str,
        content: &str,
    ) -> Result<PathBuf, HarnessError> {
        let path = self.full_path(relative_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                HarnessError::assertion(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| HarnessError::assertion(format!("cannot write {}: {e}", path.display())))?;
        Ok(path)
    }

    pub async fn request_definition(
        &self,
        relative_path: &str,
        line: u64,
        column: u64,
    ) -> Result<DefinitionAssertion, HarnessError> {
        let response = self
            .position_request("textDocument/definition", relative_path, line, column, None)
            .await?;
        Ok(DefinitionAssertion {
            root: self.workspace_root.clone(),
            response,
        })
    }

    pub async fn request_hover(
        &self,
        relative_path: &str,
        line: u64,
        column: u64,
    ) -> Result<HoverAssertion, HarnessError> {
        let response = self
            .position_request("textDocument/hover", relative_path, line, column, None)
            .await?;
        Ok(HoverAssertion { response })
    }

    pub async fn request_completion(
        &self,
        relative_path: &str,
        line: u64,
        column: u64,
    ) -> Result<CompletionAssertion, HarnessError> {
        let response = self
            .position_request("textDocument/completion", relative_path, line, column, None)
            .await?;
        Ok(CompletionAssertion { response })
    }

    pub async fn request_references(
        &self,
        relative_path: &str,
        line: u64,
        column: u64,
    ) -> Result<ReferencesAssertion, HarnessError> {
        let response = self
            .position_request(
                "textDocument/references",
                relative_path,
                line,
                column,
                Some(json!({ "includeDeclaration": true })),
            )
            .await?;
        Ok(ReferencesAssertion {
            root: self.workspace_root.clone(),
            response,
        })
    }

    pub async fn request_document_symbols(
        &self,
        relative_path: &str,
    ) -> Result<DocumentSymbolsAssertion, HarnessError> {
        let uri = self.uri(relative_path)?;
        let params = json!({ "textDocument": { "uri": uri } });
        let response = self
            .with_open_document(relative_path, &uri, |client| async move {
                client
                    .request("textDocument/documentSymbol", Some(params))
                    .await
            })
            .await?;
        Ok(DocumentSymbolsAssertion { response })
    }

    async fn position_request(
        &self,
        method: &str,
        relative_path: &str,
        line: u64,
        column: u64,
        context: Option<Value>,
    ) -> Result<Value, HarnessError> {
        self.client.require_method_support(method)?;
        let uri = self.uri(relative_path)?;
        let mut params = json!({
            "textDocument": { "uri": uri },
            "position": { "line": line, "character": column }
        });
        if let Some(context) = context {
            params["context"] = context;
        }
        self.with_open_document(relative_path, &uri, |client| async move {
            client.request(method, Some(params)).await
        })
        .await
    }

    /// Keep the file open on the server for the duration of `f`.
    async fn with_open_document<F, Fut>(
        &self,
        relative_path: &str,
        uri: &str,
        f: F,
    ) -> Result<Value, HarnessError>
    where
        F: FnOnce(LspClient) -> Fut,
        Fut: Future<Output = Result<Value, lsprobe_types::ClientError>>,
    {
        let path = self.full_path(relative_path);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| HarnessError::assertion(format!("cannot read {}: {e}", path.display())))?;
        self.client
            .open_document(uri, language_id(&path), &text)
            .await?;
        let result = f(self.client.clone()).await;
        self.client.close_document(uri).await?;
        Ok(result?)
    }
}

fn language_id(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("py" | "pyi") => "python",
        Some("rs") => "rust",
        Some("ts") => "typescript",
        Some("tsx") => "typescriptreact",
        Some("js") => "javascript",
        Some("go") => "go",
        Some("c" | "h") => "c",
        Some("cpp" | "hpp" | "cc") => "cpp",
        _ => "plaintext",
    }
}

/// Both paths canonicalized when they exist, so symlinked workspaces match.
fn same_file(uri: &str, expected: &Path) -> bool {
    let Some(actual) = file_uri_to_path(uri) else {
        return false;
    };
    let canonical = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
    canonical(&actual) == canonical(expected)
}

fn null_response(what: &str) -> HarnessError {
    HarnessError::assertion(format!("{what} response is null"))
}

pub struct DefinitionAssertion {
    root: PathBuf,
    response: Value,
}

impl DefinitionAssertion {
    pub fn response(&self) -> &Value {
        &self.response
    }

    /// The response contains a `Location` or `LocationLink` targeting
    /// `relative_path` at exactly this range.
    pub fn expect_definition(
        &self,
        relative_path: &str,
        start_line: u64,
        start_col: u64,
        end_line: u64,
        end_col: u64,
    ) -> Result<(), HarnessError> {
        let expected_path = self.root.join(relative_path);
        let expected = Span::new(start_line, start_col, end_line, end_col);
        let locations: Vec<&Value> = match &self.response {
            Value::Null => return Err(null_response("definition")),
            Value::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        let found = locations.iter().any(|loc| {
            let (uri, range) = match (loc.get("targetUri"), loc.get("uri")) {
                (Some(uri), _) => (uri, loc.get("targetSelectionRange")),
                (None, Some(uri)) => (uri, loc.get("range")),
                (None, None) => return false,
            };
            uri.as_str().is_some_and(|uri| same_file(uri, &expected_path))
                && range.and_then(Span::from_lsp) == Some(expected)
        });
        if found {
            Ok(())
        } else {
            Err(HarnessError::assertion(format!(
                "definition not found at {}:{expected} in {}",
                expected_path.display(),
                self.response
            )))
        }
    }
}

pub struct HoverAssertion {
    response: Value,
}

impl HoverAssertion {
    pub fn response(&self) -> &Value {
        &self.response
    }

    /// Rendered hover text, whichever of the content shapes the server used.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        fn render(contents: &Value) -> String {
            match contents {
                Value::String(s) => s.clone(),
                Value::Array(items) => items.iter().map(render).collect::<Vec<_>>().join("\n"),
                other => other
                    .get("value")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }
        }
        self.response.get("contents").map(render)
    }

    pub fn expect_content(&self, pattern: &str) -> Result<(), HarnessError> {
        let Some(text) = self.text() else {
            return Err(null_response("hover"));
        };
        if text.contains(pattern) {
            Ok(())
        } else {
            Err(HarnessError::assertion(format!(
                "expected {pattern:?} in hover content, got {text:?}"
            )))
        }
    }
}

pub struct CompletionAssertion {
    response: Value,
}

impl CompletionAssertion {
    /// Item labels from either a bare array or a `CompletionList`.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        let items = match &self.response {
            Value::Array(items) => items,
            other => match other.get("items").and_then(Value::as_array) {
                Some(items) => items,
                None => return Vec::new(),
            },
        };
        items
            .iter()
            .filter_map(|item| item.get("label").and_then(Value::as_str))
            .collect()
    }

    pub fn expect_label(&self, label: &str) -> Result<(), HarnessError> {
        let labels = self.labels();
        if labels.contains(&label) {
            Ok(())
        } else {
            Err(HarnessError::assertion(format!(
                "expected completion label {label:?} not found in {labels:?}"
            )))
        }
    }
}

pub struct ReferencesAssertion {
    root: PathBuf,
    response: Value,
}

impl ReferencesAssertion {
    pub fn expect_reference(
        &self,
        relative_path: &str,
        start_line: u64,
        start_col: u64,
        end_line: u64,
        end_col: u64,
    ) -> Result<(), HarnessError> {
        let Some(locations) = self.response.as_array() else {
            return Err(null_response("references"));
        };
        let expected_path = self.root.join(relative_path);
        let expected = Span::new(start_line, start_col, end_line, end_col);
        let found = locations.iter().any(|loc| {
            loc.get("uri")
                .and_then(Value::as_str)
                .is_some_and(|uri| same_file(uri, &expected_path))
                && loc.get("range").and_then(Span::from_lsp) == Some(expected)
        });
        if found {
            Ok(())
        } else {
            Err(HarnessError::assertion(format!(
                "reference not found at {}:{expected}",
                expected_path.display()
            )))
        }
    }
}

pub struct DocumentSymbolsAssertion {
    response: Value,
}

impl DocumentSymbolsAssertion {
    /// `kind` is the numeric LSP `SymbolKind`.
    pub fn expect_symbol(&self, name: &str, kind: Option<u64>) -> Result<(), HarnessError> {
        let Some(symbols) = self.response.as_array() else {
            return Err(null_response("document symbols"));
        };
        let mut seen = Vec::new();
        if find_symbol(symbols, name, kind, &mut seen) {
            Ok(())
        } else {
            Err(HarnessError::assertion(format!(
                "symbol {name:?} not found; saw {seen:?}"
            )))
        }
    }
}

/// Depth-first over `DocumentSymbol` children; `SymbolInformation` is flat.
fn find_symbol(symbols: &[Value], name: &str, kind: Option<u64>, seen: &mut Vec<String>) -> bool {
    for symbol in symbols {
        let symbol_name = symbol.get("name").and_then(Value::as_str).unwrap_or_default();
        let symbol_kind = symbol.get("kind").and_then(Value::as_u64);
        seen.push(format!("{symbol_name} ({})", symbol_kind.unwrap_or_default()));
        if symbol_name == name && kind.is_none_or(|k| symbol_kind == Some(k)) {
            return true;
        }
        if let Some(children) = symbol.get("children").and_then(Value::as_array)
            && find_symbol(children, name, kind, seen)
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::mock_pair;
    use lsprobe_lsp::ClientConfig;

    #[test]
    fn hover_text_handles_every_shape() {
        let markup = HoverAssertion {
            response: json!({"contents": {"kind": "markdown", "value": "```python\nx: int\n```"}}),
        };
        assert!(markup.expect_content("x: int").is_ok());
        let marked = HoverAssertion {
            response: json!({"contents": [{"language": "python", "value": "def f()"}, "doc"]}),
        };
        assert_eq!(marked.text().unwrap(), "def f()\ndoc");
        let null = HoverAssertion { response: Value::Null };
        assert!(null.expect_content("x").is_err());
    }

    #[test]
    fn completion_labels_from_list_or_array() {
        let list = CompletionAssertion {
            response: json!({
                "isIncomplete": false,
                "items": [{"label": "print"}, {"label": "property"}]
            }),
        };
        assert!(list.expect_label("print").is_ok());
        assert!(list.expect_label("len").is_err());
        let array = CompletionAssertion {
            response: json!([{"label": "len"}]),
        };
        assert_eq!(array.labels(), vec!["len"]);
    }

    #[test]
    fn nested_document_symbols_are_searched() {
        let symbols = DocumentSymbolsAssertion {
            response: json!([
                {"name": "Foo", "kind": 5, "children": [{"name": "bar", "kind": 6}]}
            ]),
        };
        assert!(symbols.expect_symbol("bar", Some(6)).is_ok());
        assert!(symbols.expect_symbol("bar", Some(12)).is_err());
        assert!(symbols.expect_symbol("Foo", None).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn definition_accepts_location_links() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::write(root.join("a.py"), "x = 1\n").unwrap();
        let uri = path_to_file_uri(&root.join("a.py")).unwrap().to_string();
        let range = json!({
            "start": {"line": 0, "character": 0},
            "end": {"line": 0, "character": 1}
        });

        let location = DefinitionAssertion {
            root: root.clone(),
            response: json!({"uri": uri, "range": range}),
        };
        assert!(location.expect_definition("a.py", 0, 0, 0, 1).is_ok());
        assert!(location.expect_definition("a.py", 1, 0, 1, 1).is_err());

        let links = DefinitionAssertion {
            root,
            response: json!([{
                "targetUri": uri,
                "targetRange": range,
                "targetSelectionRange": range
            }]),
        };
        assert!(links.expect_definition("a.py", 0, 0, 0, 1).is_ok());
    }

    #[tokio::test]
    async fn hover_request_opens_and_closes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut server) = mock_pair(ClientConfig::default());
        let interaction = Interaction::new(client.clone(), dir.path());
        interaction.create_file("pkg/main.py", "x = 1\n").await.unwrap();

        let init = tokio::spawn({
            let client = client.clone();
            async move { client.initialize(json!({})).await }
        });
        server
            .complete_initialize(json!({"hoverProvider": true}))
            .await
            .unwrap();
        init.await.unwrap().unwrap();

        let script = async {
            let open = server.expect_notification("textDocument/didOpen").await.unwrap();
            assert_eq!(open.params_or_null()["textDocument"]["languageId"], "python");
            let hover = server.expect_request("textDocument/hover").await.unwrap();
            assert_eq!(
                hover.params.as_ref().unwrap()["position"],
                json!({"line": 0, "character": 0})
            );
            server
                .respond(hover.id, json!({"contents": {"kind": "plaintext", "value": "x: int"}}))
                .await
                .unwrap();
            server.expect_notification("textDocument/didClose").await.unwrap();
        };
        let (assertion, ()) = tokio::join!(interaction.request_hover("pkg/main.py", 0, 0), script);
        assertion.unwrap().expect_content("int").unwrap();

        assert!(matches!(
            interaction.request_definition("pkg/main.py", 0, 0).await,
            Err(HarnessError::Client(lsprobe_types::ClientError::CapabilityNotSupported(_)))
        ));
    }
}
