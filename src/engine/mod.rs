//! Boundary to the external patch engine and artifact tools.
//!
//! The engine loads patch definitions, reads the target's identity and
//! executes a selection, reporting completions as an unordered stream.
//! The artifact tools apply the engine's result to an archive and sign it.

pub mod scripted;
mod types;

use std::path::{Path, PathBuf};

use futures::stream::BoxStream;

use crate::error::EngineError;

pub use types::{
    CompatiblePackage, KeystoreDetails, OptionType, Patch, PatchCatalog, PatchCompletion,
    PatchId, PatchKind, PatchOption, PatchSource, PatchedOutput, SelectedPatch, TargetPackage,
};

/// Loads patch bundles and opens execution sessions on target artifacts.
pub trait PatchEngine: Send + Sync {
    type Session: EngineSession;

    /// Load every patch declared by `sources`. Source names are their file names.
    fn load_patches(&self, sources: &[PathBuf]) -> Result<PatchCatalog, EngineError>;

    /// Open a session on `target`, using `work_dir` for scratch files.
    /// Dropping the session releases everything it holds.
    fn open(&self, target: &Path, work_dir: &Path) -> Result<Self::Session, EngineError>;
}

/// One execution against one target artifact.
pub trait EngineSession: Send {
    fn target(&self) -> &TargetPackage;

    fn submit(&mut self, patches: Vec<SelectedPatch>);

    /// Completions in whatever order the engine finishes them. Consumed once.
    fn execute(&mut self) -> BoxStream<'_, PatchCompletion>;

    /// Final result. Only valid after `execute` was drained without a failure.
    fn finish(self) -> Result<PatchedOutput, EngineError>;
}

pub trait ArtifactTools: Send + Sync {
    /// Write the engine's result into `target`.
    fn apply(&self, output: &PatchedOutput, target: &Path) -> Result<(), EngineError>;

    fn sign(
        &self,
        input: &Path,
        output: &Path,
        signer: &str,
        keystore: &KeystoreDetails,
    ) -> Result<(), EngineError>;
}
