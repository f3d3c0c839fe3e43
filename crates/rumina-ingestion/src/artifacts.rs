//! Persisted analyses: one JSON file per document in the output directory.
//!
//! Writes go to a temp file in the same directory and are renamed into place,
//! so readers see either the old artifact or the complete new one.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rumina_common::{Result, RuminaError, VerifiedAnalysis};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const ARTIFACT_SUFFIX: &str = "_analysis.json";
pub const INDEX_FILE: &str = "all_analyses_index.json";

/// `PMID<id>_analysis.json` for numeric ids, `<id>_analysis.json` otherwise.
pub fn artifact_file_name(id: &str) -> String {
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        format!("PMID{id}{ARTIFACT_SUFFIX}")
    } else {
        format!("{id}{ARTIFACT_SUFFIX}")
    }
}

/// Inverse of [`artifact_file_name`].
pub fn id_from_artifact_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(ARTIFACT_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    match stem.strip_prefix("PMID") {
        Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
            Some(digits.to_string())
        }
        _ => Some(stem.to_string()),
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `analysis`, replacing any previous artifact for the same id.
    async fn write(&self, analysis: &VerifiedAnalysis) -> Result<()>;

    async fn read(&self, id: &str) -> Result<VerifiedAnalysis>;

    /// A non-empty artifact exists for `id`.
    async fn is_complete(&self, id: &str) -> bool;

    async fn list_ids(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    /// Open (creating if needed) the artifact directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Open an artifact directory that must already exist. Read-only callers
    /// use this so they never create directories.
    pub async fn open_existing(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let meta = tokio::fs::metadata(&dir).await?;
        if !meta.is_dir() {
            return Err(RuminaError::Artifact(format!("{} is not a directory", dir.display())));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(artifact_file_name(id))
    }

    /// Write every readable artifact into `all_analyses_index.json` as one
    /// JSON array, ordered by id. Unreadable artifacts are skipped.
    pub async fn write_index(&self) -> Result<usize> {
        let mut all = Vec::new();
        for id in self.list_ids().await? {
            match self.read(&id).await {
                Ok(a) => all.push(a),
                Err(e) => warn!(doc_id = %id, error = %e, "skipping unreadable artifact in index"),
            }
        }
        let bytes = serde_json::to_vec_pretty(&all)?;
        write_atomic(self.dir.clone(), self.dir.join(INDEX_FILE), bytes).await?;
        info!(analyses = all.len(), "analysis index written");
        Ok(all.len())
    }
}

/// Temp file + fsync + rename, off the async workers.
pub(crate) async fn write_atomic(dir: PathBuf, target: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| RuminaError::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| RuminaError::Artifact(format!("write task failed: {e}")))?
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn write(&self, analysis: &VerifiedAnalysis) -> Result<()> {
        let target = self.path_for(&analysis.id);
        let bytes = serde_json::to_vec_pretty(analysis)?;
        let len = bytes.len();
        write_atomic(self.dir.clone(), target.clone(), bytes).await?;
        debug!(doc_id = %analysis.id, path = %target.display(), bytes = len, "artifact written");
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<VerifiedAnalysis> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuminaError::DocumentNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| RuminaError::Artifact(format!("{}: {e}", path.display())))
    }

    async fn is_complete(&self, id: &str) -> bool {
        tokio::fs::metadata(self.path_for(id))
            .await
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = id_from_artifact_name(&name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rumina_test_utils::sample_analysis;

    #[test]
    fn test_artifact_names() {
        assert_eq!(artifact_file_name("38291234"), "PMID38291234_analysis.json");
        assert_eq!(artifact_file_name("review-7"), "review-7_analysis.json");
        assert_eq!(id_from_artifact_name("PMID38291234_analysis.json").as_deref(), Some("38291234"));
        assert_eq!(id_from_artifact_name("review-7_analysis.json").as_deref(), Some("review-7"));
        assert_eq!(id_from_artifact_name(INDEX_FILE), None);
        assert_eq!(id_from_artifact_name("ledger.json"), None);
    }

    #[tokio::test]
    async fn test_write_read_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path().join("out")).await.unwrap();
        assert!(!store.is_complete("1").await);

        store.write(&sample_analysis("1", &["acetate"])).await.unwrap();
        assert!(store.is_complete("1").await);
        assert!(store.path_for("1").ends_with("PMID1_analysis.json"));

        store.write(&sample_analysis("1", &["acetate", "butyrate"])).await.unwrap();
        let back = store.read("1").await.unwrap();
        assert_eq!(back.molecules, vec!["acetate", "butyrate"]);
    }

    #[tokio::test]
    async fn test_open_existing_does_not_create() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("never-created");
        let err = FsArtifactStore::open_existing(&missing).await.unwrap_err();
        assert!(matches!(err, RuminaError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
        assert!(!missing.exists());

        let store = FsArtifactStore::open_existing(dir.path()).await.unwrap();
        assert!(store.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_is_not_complete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();
        std::fs::write(store.path_for("5"), "").unwrap();
        assert!(!store.is_complete("5").await);
        assert!(matches!(store.read("6").await, Err(RuminaError::DocumentNotFound(_))));
        assert!(matches!(store.read("5").await, Err(RuminaError::Artifact(_))));
    }

    #[tokio::test]
    async fn test_index_aggregates_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();
        for id in ["2", "1", "abc"] {
            store.write(&sample_analysis(id, &["acetate"])).await.unwrap();
        }
        std::fs::write(dir.path().join("ledger.json"), "{}").unwrap();

        assert_eq!(store.list_ids().await.unwrap(), vec!["1", "2", "abc"]);
        assert_eq!(store.write_index().await.unwrap(), 3);

        let index: Vec<VerifiedAnalysis> =
            serde_json::from_slice(&std::fs::read(dir.path().join(INDEX_FILE)).unwrap()).unwrap();
        let ids: Vec<&str> = index.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "abc"]);
    }
}
