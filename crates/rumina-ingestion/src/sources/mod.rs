//! Source document stores.
//!
//! A store lists stable document ids and loads one `SourceDocument` at a
//! time. The pipeline never holds more than one super-batch of loaded
//! documents in memory.

pub mod fs;
pub mod jats;

use async_trait::async_trait;
use regex::Regex;
use rumina_common::{Result, SourceDocument};

pub use fs::FsDocumentStore;

/// Common interface for all document stores.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All document ids, in a stable order.
    async fn list_ids(&self) -> Result<Vec<String>>;

    /// Load one document. Fails with `DocumentNotFound`, `Io`, or
    /// `InsufficientText` when the body is too short to be worth processing.
    async fn load(&self, id: &str) -> Result<SourceDocument>;
}

fn pmid_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"PMID(\d+)").unwrap())
}

/// PMID embedded in a file name, e.g. `Nitrate_dairy_PMID38291234.xml`.
pub fn extract_pmid(file_name: &str) -> Option<String> {
    pmid_regex()
        .captures(file_name)
        .map(|c| c[1].to_string())
}

/// Document id for a file: its PMID when present, otherwise the file stem.
pub fn document_id_for(file_name: &str) -> String {
    if let Some(pmid) = extract_pmid(file_name) {
        return pmid;
    }
    std::path::Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_pmid() {
        assert_eq!(extract_pmid("Rumen_methane_PMID12345678.xml").as_deref(), Some("12345678"));
        assert_eq!(extract_pmid("PMID1.txt").as_deref(), Some("1"));
        assert_eq!(extract_pmid("no_id_here.xml"), None);
        assert_eq!(extract_pmid("pmid123.xml"), None);
    }

    #[test]
    fn test_document_id_falls_back_to_stem() {
        assert_eq!(document_id_for("x_PMID42.xml"), "42");
        assert_eq!(document_id_for("silage-trial.txt"), "silage-trial");
    }
}
