//! Directory-backed document store: `*.xml` (JATS) and `*.txt` files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rumina_common::{Result, RuminaError, SourceDocument};
use tracing::{debug, warn};

use super::jats::parse_jats;
use super::{document_id_for, DocumentStore};

pub struct FsDocumentStore {
    dir: PathBuf,
    min_text_chars: usize,
    /// id → path, built once when the store is opened.
    files: BTreeMap<String, PathBuf>,
}

impl FsDocumentStore {
    /// Scan `dir` for supported files. Two files mapping to the same id keep
    /// the first in file-name order.
    pub async fn open(dir: impl Into<PathBuf>, min_text_chars: usize) -> Result<Self> {
        let dir = dir.into();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_supported(&path) && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut files = BTreeMap::new();
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let id = document_id_for(&name);
            if let Some(existing) = files.get(&id) {
                warn!(doc_id = %id, kept = ?existing, ignored = ?path, "duplicate document id");
                continue;
            }
            files.insert(id, path);
        }

        debug!(dir = %dir.display(), documents = files.len(), "document store opened");
        Ok(Self { dir, min_text_chars, files })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, id: &str) -> Option<&Path> {
        self.files.get(id).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_supported(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("xml") | Some("txt")
    )
}

fn is_xml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("xml"))
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }

    async fn load(&self, id: &str) -> Result<SourceDocument> {
        let path = self
            .files
            .get(id)
            .ok_or_else(|| RuminaError::DocumentNotFound(id.to_string()))?;

        let raw = tokio::fs::read_to_string(path).await?;

        let doc = if is_xml(path) {
            let sections = parse_jats(&raw)?;
            SourceDocument {
                id: id.to_string(),
                raw_text: raw,
                title: Some(sections.title),
                abstract_text: Some(sections.abstract_text),
                body: Some(sections.body),
                source_path: Some(path.clone()),
            }
        } else {
            SourceDocument {
                source_path: Some(path.clone()),
                ..SourceDocument::from_text(id, raw)
            }
        };

        let chars = doc.body_chars();
        if chars < self.min_text_chars {
            return Err(RuminaError::InsufficientText {
                id: id.to_string(),
                chars,
                min: self.min_text_chars,
            });
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(n: usize) -> String {
        "acetate propionate butyrate ".repeat(n)
    }

    #[tokio::test]
    async fn test_lists_and_loads_xml_and_text() {
        let dir = tempfile::tempdir().unwrap();
        let xml = format!(
            "<article><front><article-title>Nitrate</article-title><abstract><p>Short.</p></abstract></front><body><p>{}</p></body></article>",
            body(40)
        );
        std::fs::write(dir.path().join("Nitrate_PMID111.xml"), xml).unwrap();
        std::fs::write(dir.path().join("field-notes.txt"), body(40)).unwrap();
        std::fs::write(dir.path().join("ignored.pdf"), "binary").unwrap();

        let store = FsDocumentStore::open(dir.path(), 500).await.unwrap();
        assert_eq!(store.list_ids().await.unwrap(), vec!["111", "field-notes"]);

        let doc = store.load("111").await.unwrap();
        assert_eq!(doc.title.as_deref(), Some("Nitrate"));
        assert!(doc.full_text().starts_with("Title: Nitrate"));
        assert_eq!(doc.file_name().as_deref(), Some("Nitrate_PMID111.xml"));

        let txt = store.load("field-notes").await.unwrap();
        assert!(!txt.has_sections());
    }

    #[tokio::test]
    async fn test_insufficient_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("PMID7.txt"), "too short").unwrap();
        let store = FsDocumentStore::open(dir.path(), 500).await.unwrap();
        let err = store.load("7").await.unwrap_err();
        assert!(matches!(err, RuminaError::InsufficientText { chars: 9, min: 500, .. }));
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::open(dir.path(), 0).await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(store.load("nope").await, Err(RuminaError::DocumentNotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a_PMID5.txt"), body(30)).unwrap();
        std::fs::write(dir.path().join("b_PMID5.txt"), body(30)).unwrap();
        let store = FsDocumentStore::open(dir.path(), 0).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.path_of("5").unwrap().ends_with("a_PMID5.txt"));
    }
}
