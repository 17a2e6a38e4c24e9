//! `workspace/applyEdit`: turning a server's `WorkspaceEdit` into new
//! document text.
//!
//! Parsing and text application are pure. [`apply`] stages every change
//! against the connection's document store or the file on disk, and only
//! commits once the whole edit has staged cleanly.

use std::collections::BTreeMap;
use std::path::PathBuf;

use lsprobe_types::{ClientError, DocumentError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::connection::Command;
use crate::documents::DocumentState;
use crate::protocol::file_uri_to_path;

pub(crate) const APPLY_EDIT: &str = "workspace/applyEdit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// A `TextEdit` or `AnnotatedTextEdit`; the annotation is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEdit {
    pub range: Range,
    pub new_text: String,
}

/// All edits for one document, in the order the server listed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEdit {
    pub uri: String,
    /// The version the server computed the edits against, if it said.
    pub version: Option<i32>,
    pub edits: Vec<TextEdit>,
}

#[derive(Debug, Error)]
pub enum EditError {
    #[error("invalid workspace edit: {0}")]
    Invalid(String),
    #[error("{0} operations are not supported")]
    Unsupported(String),
    #[error("overlapping edits at {line}:{character}")]
    Overlap { line: u32, character: u32 },
    #[error("document {0} is not open")]
    NotOpen(String),
    #[error("{0} is not a file URI")]
    NotAFile(String),
    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// The `ApplyWorkspaceEditResult` sent back to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_change: Option<usize>,
}

impl ApplyOutcome {
    fn applied() -> Self {
        Self {
            applied: true,
            failure_reason: None,
            failed_change: None,
        }
    }

    fn failed(err: &EditError, change: Option<usize>) -> Self {
        Self {
            applied: false,
            failure_reason: Some(err.to_string()),
            failed_change: change,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Deserialize)]
struct ApplyParams {
    edit: RawWorkspaceEdit,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWorkspaceEdit {
    #[serde(default)]
    changes: Option<BTreeMap<String, Vec<TextEdit>>>,
    #[serde(default)]
    document_changes: Option<Vec<Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTextDocumentEdit {
    text_document: VersionedIdentifier,
    edits: Vec<TextEdit>,
}

#[derive(Deserialize)]
struct VersionedIdentifier {
    uri: String,
    #[serde(default)]
    version: Option<i32>,
}

fn invalid(err: &serde_json::Error) -> EditError {
    EditError::Invalid(err.to_string())
}

/// Parse `ApplyWorkspaceEditParams` into per-document edits.
///
/// `documentChanges` wins over `changes` when both are present. Resource
/// operations (create, rename, delete) are refused.
pub fn parse_apply_params(params: Option<Value>) -> Result<Vec<FileEdit>, EditError> {
    let params: ApplyParams =
        serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| invalid(&e))?;
    let edit = params.edit;

    if let Some(changes) = edit.document_changes {
        return changes
            .into_iter()
            .map(|change| {
                if let Some(kind) = change.get("kind").and_then(Value::as_str) {
                    return Err(EditError::Unsupported(kind.to_string()));
                }
                let doc: RawTextDocumentEdit =
                    serde_json::from_value(change).map_err(|e| invalid(&e))?;
                Ok(FileEdit {
                    uri: doc.text_document.uri,
                    version: doc.text_document.version,
                    edits: doc.edits,
                })
            })
            .collect();
    }

    Ok(edit
        .changes
        .unwrap_or_default()
        .into_iter()
        .map(|(uri, edits)| FileEdit {
            uri,
            version: None,
            edits,
        })
        .collect())
}

/// Byte offset of an LSP position. `character` counts UTF-16 code units.
/// Positions past the end of a line or of the text are clamped.
fn offset_at(text: &str, pos: Position) -> usize {
    let mut line_start = 0;
    for _ in 0..pos.line {
        match text[line_start..].find('\n') {
            Some(i) => line_start += i + 1,
            None => return text.len(),
        }
    }
    let rest = &text[line_start..];
    let line = rest.find('\n').map_or(rest, |i| &rest[..i]);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let wanted = pos.character as usize;
    let mut units = 0;
    for (i, ch) in line.char_indices() {
        if units >= wanted {
            return line_start + i;
        }
        units += ch.len_utf16();
    }
    line_start + line.len()
}

/// Apply `edits` to `text`. Ranges refer to the original text; edits that
/// insert at the same position keep their listed order.
pub fn apply_text_edits(text: &str, edits: &[TextEdit]) -> Result<String, EditError> {
    let mut spans: Vec<_> = edits
        .iter()
        .map(|edit| {
            let start = offset_at(text, edit.range.start);
            let end = offset_at(text, edit.range.end).max(start);
            (start, end, edit)
        })
        .collect();
    spans.sort_by_key(|&(start, _, _)| start);

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, edit) in spans {
        if start < cursor {
            return Err(EditError::Overlap {
                line: edit.range.start.line,
                character: edit.range.start.character,
            });
        }
        out.push_str(&text[cursor..start]);
        out.push_str(&edit.new_text);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}

enum Target {
    /// Open in the client. Committed with a versioned `didChange`.
    Open { base_version: i32 },
    Disk(PathBuf),
}

struct Staged {
    uri: String,
    /// Index of the first change that touched this document.
    change: usize,
    target: Target,
    text: String,
}

async fn ask<T>(
    commands: &mpsc::UnboundedSender<Command>,
    build: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T, EditError> {
    let gone = || ClientError::TransportClosed("connection task has stopped".into());
    let (tx, rx) = oneshot::channel();
    commands.send(build(tx)).map_err(|_| gone())?;
    rx.await.map_err(|_| gone().into())
}

async fn stage(
    commands: &mpsc::UnboundedSender<Command>,
    index: usize,
    file: FileEdit,
) -> Result<Staged, EditError> {
    let uri = file.uri.clone();
    let open: Option<DocumentState> = ask(commands, |done| Command::Document {
        uri: uri.clone(),
        done,
    })
    .await?;

    match (open, file.version) {
        (Some(doc), expected) => {
            if let Some(expected) = expected
                && expected != doc.version
            {
                return Err(DocumentError::VersionMismatch {
                    uri,
                    expected,
                    actual: doc.version,
                }
                .into());
            }
            Ok(Staged {
                text: apply_text_edits(&doc.content, &file.edits)?,
                uri,
                change: index,
                target: Target::Open {
                    base_version: doc.version,
                },
            })
        }
        (None, Some(_)) => Err(EditError::NotOpen(uri)),
        (None, None) => {
            let path = file_uri_to_path(&uri).ok_or_else(|| EditError::NotAFile(uri.clone()))?;
            let current = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| EditError::Io {
                    path: path.clone(),
                    source,
                })?;
            Ok(Staged {
                text: apply_text_edits(&current, &file.edits)?,
                uri,
                change: index,
                target: Target::Disk(path),
            })
        }
    }
}

fn restage(prior: &Staged, file: FileEdit) -> Result<String, EditError> {
    match (&prior.target, file.version) {
        (Target::Open { base_version }, Some(expected)) if expected != *base_version => {
            Err(DocumentError::VersionMismatch {
                uri: file.uri,
                expected,
                actual: *base_version,
            }
            .into())
        }
        (Target::Disk(_), Some(_)) => Err(EditError::NotOpen(file.uri)),
        _ => apply_text_edits(&prior.text, &file.edits),
    }
}

async fn commit(
    commands: &mpsc::UnboundedSender<Command>,
    staged: Staged,
) -> Result<(), EditError> {
    match staged.target {
        Target::Open { base_version } => {
            ask(commands, |done| Command::ChangeDocument {
                uri: staged.uri,
                text: staged.text,
                base_version: Some(base_version),
                done,
            })
            .await??;
        }
        Target::Disk(path) => {
            tokio::fs::write(&path, staged.text)
                .await
                .map_err(|source| EditError::Io { path, source })?;
        }
    }
    Ok(())
}

/// Run one `workspace/applyEdit` request against the connection behind
/// `commands`.
pub(crate) async fn apply(
    commands: &mpsc::UnboundedSender<Command>,
    params: Option<Value>,
) -> ApplyOutcome {
    let files = match parse_apply_params(params) {
        Ok(files) => files,
        Err(err) => {
            tracing::warn!(error = %err, "refusing workspace edit");
            return ApplyOutcome::failed(&err, None);
        }
    };

    let mut staged: Vec<Staged> = Vec::new();
    for (index, file) in files.into_iter().enumerate() {
        // A later change to the same document builds on the staged text.
        if let Some(prior) = staged.iter_mut().find(|s| s.uri == file.uri) {
            match restage(prior, file) {
                Ok(text) => prior.text = text,
                Err(err) => return ApplyOutcome::failed(&err, Some(index)),
            }
            continue;
        }
        match stage(commands, index, file).await {
            Ok(s) => staged.push(s),
            Err(err) => {
                tracing::warn!(error = %err, change = index, "workspace edit not applied");
                return ApplyOutcome::failed(&err, Some(index));
            }
        }
    }

    for s in staged {
        let change = s.change;
        if let Err(err) = commit(commands, s).await {
            tracing::warn!(error = %err, change, "workspace edit partially applied");
            return ApplyOutcome::failed(&err, Some(change));
        }
    }
    ApplyOutcome::applied()
}
