use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobStatus;
use crate::error::PatchError;

/// Opaque job identifier, caller-supplied or generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for JobId {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| PatchError::invalid("Invalid job identifier"))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Snapshot of one job as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub source_artifact_name: Option<String>,
    pub source_bundle_names: Vec<String>,
    pub output_artifact_name: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Created,
            source_artifact_name: None,
            source_bundle_names: Vec::new(),
            output_artifact_name: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stamp `updated_at`, never moving it backwards.
    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.updated_at);
    }

    /// Apply a forward status change. Returns `false` and leaves the job
    /// untouched when the change is not a legal transition.
    pub(crate) fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.touch();
        true
    }

    /// Redefine a terminal job so it can be submitted again.
    pub(crate) fn redefine(&mut self) {
        self.status = JobStatus::Created;
        self.output_artifact_name = None;
        self.error_message = None;
    }
}
