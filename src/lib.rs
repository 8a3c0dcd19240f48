//! Patch-job orchestration: a job registry with replayable progress
//! events, patch selection over interdependent bundles, and a driver that
//! runs an external patch engine and signs its output.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod metadata;
pub mod options;
pub mod orchestrator;
pub mod selector;

pub use config::{SigningConfig, WebPatcherConfig};
pub use error::{EngineError, ErrorBody, ErrorStatus, PatchError, SelectionError};
pub use job::{Job, JobId, JobRegistry, JobStatus};
pub use orchestrator::{JobOrchestrator, PatchRequest, PatchedArtifact, UploadedFile};
