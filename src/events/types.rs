use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressKind {
    JobPrepared,
    JobStarted,
    JobCompleted,
    JobFailed,
    PatchQueued,
    PatchStarted,
    PatchSucceeded,
    PatchFailed,
    Info,
}

impl ProgressKind {
    /// Whether this event ends a job's timeline.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressKind::JobCompleted | ProgressKind::JobFailed)
    }

    /// Wire name, also used as the SSE `event:` field.
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressKind::JobPrepared => "JOB_PREPARED",
            ProgressKind::JobStarted => "JOB_STARTED",
            ProgressKind::JobCompleted => "JOB_COMPLETED",
            ProgressKind::JobFailed => "JOB_FAILED",
            ProgressKind::PatchQueued => "PATCH_QUEUED",
            ProgressKind::PatchStarted => "PATCH_STARTED",
            ProgressKind::PatchSucceeded => "PATCH_SUCCEEDED",
            ProgressKind::PatchFailed => "PATCH_FAILED",
            ProgressKind::Info => "INFO",
        }
    }
}

impl std::fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// One entry of a job's progress timeline.
///
/// Built with [`ProgressEvent::job`] or [`ProgressEvent::patch`] and
/// refined with the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "event")]
    pub kind: ProgressKind,
    #[serde(rename = "patch")]
    pub patch_name: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "durationMs")]
    pub duration_ms: Option<i64>,
}

impl ProgressEvent {
    /// A job-level event. `JobFailed` defaults to error severity.
    pub fn job(kind: ProgressKind, message: impl Into<String>) -> Self {
        let severity = match kind {
            ProgressKind::JobFailed => Severity::Error,
            _ => Severity::Info,
        };
        Self {
            kind,
            patch_name: None,
            message: message.into(),
            timestamp: Utc::now(),
            severity,
            duration_ms: None,
        }
    }

    /// An event about one patch. `PatchFailed` defaults to error severity.
    pub fn patch(kind: ProgressKind, patch_name: impl Into<String>, message: impl Into<String>) -> Self {
        let severity = match kind {
            ProgressKind::PatchFailed => Severity::Error,
            _ => Severity::Info,
        };
        Self {
            kind,
            patch_name: Some(patch_name.into()),
            message: message.into(),
            timestamp: Utc::now(),
            severity,
            duration_ms: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}
