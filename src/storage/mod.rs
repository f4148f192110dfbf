pub mod artifacts;

// Re-export common types
pub use artifacts::{ArtifactStats, ArtifactStore, Artifacts, FsArtifactStore};
