//! Text documents the client has opened on the server.
//!
//! Opens are reference counted: nested or concurrent opens of one URI share a
//! single `didOpen`/`didClose` pair.

use std::collections::HashMap;

use lsprobe_types::DocumentError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentState {
    pub language_id: String,
    pub content: String,
    pub version: i32,
}

#[derive(Debug)]
struct Entry {
    state: DocumentState,
    open_count: usize,
}

#[derive(Debug, Default)]
pub(crate) struct DocumentStore {
    docs: HashMap<String, Entry>,
}

impl DocumentStore {
    pub fn get(&self, uri: &str) -> Result<&DocumentState, DocumentError> {
        self.docs.get(uri).map(|e| &e.state).ok_or_else(|| not_found(uri))
    }

    /// Replace the content and bump the version. Returns the new version.
    ///
    /// With `base_version` set, the update only happens while the document
    /// is still at that version.
    pub fn update_content(
        &mut self,
        uri: &str,
        content: &str,
        base_version: Option<i32>,
    ) -> Result<i32, DocumentError> {
        let entry = self.docs.get_mut(uri).ok_or_else(|| not_found(uri))?;
        if let Some(expected) = base_version
            && expected != entry.state.version
        {
            return Err(DocumentError::VersionMismatch {
                uri: uri.to_string(),
                expected,
                actual: entry.state.version,
            });
        }
        content.clone_into(&mut entry.state.content);
        entry.state.version += 1;
        Ok(entry.state.version)
    }

    /// Take a reference. Returns the state when this is the first open, i.e.
    /// when `didOpen` must be sent.
    pub fn open(
        &mut self,
        uri: &str,
        language_id: &str,
        content: &str,
    ) -> Option<DocumentState> {
        if let Some(entry) = self.docs.get_mut(uri) {
            entry.open_count += 1;
            return None;
        }
        self.docs.insert(
            uri.to_string(),
            Entry {
                state: DocumentState {
                    language_id: language_id.to_string(),
                    content: content.to_string(),
                    version: 0,
                },
                open_count: 1,
            },
        );
        self.docs.get(uri).map(|e| e.state.clone())
    }

    /// Drop a reference. Returns `true` when it was the last one, i.e. when
    /// `didClose` must be sent.
    pub fn close(&mut self, uri: &str) -> Result<bool, DocumentError> {
        let entry = self.docs.get_mut(uri).ok_or_else(|| not_found(uri))?;
        entry.open_count = entry.open_count.saturating_sub(1);
        if entry.open_count == 0 {
            self.docs.remove(uri);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn open_count(&self, uri: &str) -> usize {
        self.docs.get(uri).map_or(0, |e| e.open_count)
    }
}

fn not_found(uri: &str) -> DocumentError {
    DocumentError::NotFound(uri.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "file:///test.py";

    #[test]
    fn open_and_get() {
        let mut store = DocumentStore::default();
        let doc = store.open(URI, "python", "print('hello')").unwrap();
        assert_eq!(doc.version, 0);
        assert_eq!(store.get(URI).unwrap().content, "print('hello')");
    }

    #[test]
    fn unknown_documents_are_not_found() {
        let mut store = DocumentStore::default();
        assert_eq!(store.get(URI), Err(DocumentError::NotFound(URI.into())));
        assert!(store.update_content(URI, "x", None).is_err());
        assert!(store.close(URI).is_err());
    }

    #[test]
    fn update_content_bumps_version() {
        let mut store = DocumentStore::default();
        store.open(URI, "python", "print('hello')");
        assert_eq!(store.update_content(URI, "print('world')", None).unwrap(), 1);
        assert_eq!(store.update_content(URI, "print('again')", Some(1)).unwrap(), 2);
        assert_eq!(store.get(URI).unwrap().content, "print('again')");
    }

    #[test]
    fn stale_base_version_leaves_document_untouched() {
        let mut store = DocumentStore::default();
        store.open(URI, "python", "a");
        store.update_content(URI, "b", None).unwrap();
        assert_eq!(
            store.update_content(URI, "c", Some(0)),
            Err(DocumentError::VersionMismatch {
                uri: URI.into(),
                expected: 0,
                actual: 1,
            })
        );
        let doc = store.get(URI).unwrap();
        assert_eq!((doc.version, doc.content.as_str()), (1, "b"));
    }

    #[test]
    fn independent_versions_per_document() {
        let mut store = DocumentStore::default();
        store.open("file:///a.py", "python", "a");
        store.open("file:///b.py", "python", "b");
        store.update_content("file:///a.py", "aa", None).unwrap();
        assert_eq!(store.get("file:///a.py").unwrap().version, 1);
        assert_eq!(store.get("file:///b.py").unwrap().version, 0);
    }

    #[test]
    fn nested_opens_share_one_registration() {
        let mut store = DocumentStore::default();
        assert!(store.open(URI, "python", "x").is_some());
        assert!(store.open(URI, "python", "x").is_none());
        assert_eq!(store.open_count(URI), 2);

        assert!(!store.close(URI).unwrap());
        assert!(store.get(URI).is_ok());
        assert!(store.close(URI).unwrap());
        assert_eq!(store.open_count(URI), 0);
        assert!(store.get(URI).is_err());
    }
}
