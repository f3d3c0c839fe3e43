//! rumina-common — Shared types and errors used across all Rumina crates.

pub mod error;
pub mod entities;

// Re-export commonly used types
pub use error::{Result, RuminaError};
pub use entities::{
    EntityKind, ExtractedEntity, KeptEntity, MatchStrategy, SourceDocument, StageName,
    StageResult, TextLengths, VerificationMetadata, VerifiedAnalysis,
};
