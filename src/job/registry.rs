//! Concurrent table of jobs, each owning its own event channel.
//!
//! The map lock is only held to find or insert an entry. Every status
//! change is a single read-modify-write under that job's own mutex, so
//! distinct jobs never contend on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::record::{Job, JobId};
use super::state::JobStatus;
use crate::events::{DEFAULT_REPLAY, EventChannel, EventSubscription, ProgressEvent, ProgressKind};

#[derive(Debug)]
struct JobEntry {
    job: Mutex<Job>,
    events: EventChannel,
}

impl JobEntry {
    fn new(id: JobId, replay: usize) -> Self {
        Self {
            job: Mutex::new(Job::new(id)),
            events: EventChannel::new(replay),
        }
    }

    fn snapshot(&self) -> Job {
        self.job.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Debug)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    replay: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY)
    }
}

impl JobRegistry {
    /// `replay` is the number of recent events kept per job for late subscribers.
    pub fn new(replay: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            replay,
        }
    }

    fn entry(&self, id: JobId) -> Option<Arc<JobEntry>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Return the entry for `id`, creating it if absent. The flag is true
    /// only for the call that created it.
    fn get_or_insert(&self, id: JobId) -> (Arc<JobEntry>, bool) {
        if let Some(entry) = self.entry(id) {
            return (entry, false);
        }
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let mut created = false;
        let entry = jobs
            .entry(id)
            .or_insert_with(|| {
                created = true;
                Arc::new(JobEntry::new(id, self.replay))
            })
            .clone();
        (entry, created)
    }

    fn announce_prepared(entry: &JobEntry) {
        entry
            .events
            .publish(ProgressEvent::job(ProgressKind::JobPrepared, "Job prepared"));
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.entry(id).map(|e| e.snapshot())
    }

    /// Existing snapshot, or a fresh `CREATED` job. "Job prepared" is
    /// published once, by the call that creates the job.
    pub fn ensure_job(&self, id: JobId) -> Job {
        let (entry, created) = self.get_or_insert(id);
        if created {
            tracing::debug!(job_id = %id, "job prepared");
            Self::announce_prepared(&entry);
        }
        entry.snapshot()
    }

    /// Create a job or update an existing one's descriptive attributes.
    ///
    /// `created_at` is preserved. A terminal job is redefined back to
    /// `CREATED` so it can run again; its event history is kept.
    pub fn create_job(
        &self,
        source_artifact_name: Option<String>,
        source_bundle_names: Vec<String>,
        id: Option<JobId>,
    ) -> JobId {
        let id = id.unwrap_or_default();
        let (entry, created) = self.get_or_insert(id);
        {
            let mut job = entry.job.lock().unwrap_or_else(PoisonError::into_inner);
            job.source_artifact_name = source_artifact_name;
            job.source_bundle_names = source_bundle_names;
            if job.status.is_terminal() {
                tracing::info!(job_id = %id, previous = %job.status, "redefining finished job");
                job.redefine();
            }
            job.touch();
        }
        if created {
            Self::announce_prepared(&entry);
        }
        id
    }

    pub fn mark_running(&self, id: JobId) -> bool {
        self.update(id, |job| job.advance(JobStatus::Running))
    }

    pub fn mark_success(&self, id: JobId, output_artifact_name: impl Into<String>) -> bool {
        let output = output_artifact_name.into();
        self.update(id, |job| {
            if !job.advance(JobStatus::Success) {
                return false;
            }
            job.output_artifact_name = Some(output);
            true
        })
    }

    pub fn mark_failure(&self, id: JobId, message: impl Into<String>) -> bool {
        let message = message.into();
        self.update(id, |job| {
            if !job.advance(JobStatus::Failed) {
                return false;
            }
            job.error_message = Some(message);
            true
        })
    }

    /// Run `transition` atomically on the job. Absent ids are a no-op.
    fn update(&self, id: JobId, transition: impl FnOnce(&mut Job) -> bool) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let mut job = entry.job.lock().unwrap_or_else(PoisonError::into_inner);
        let from = job.status;
        let applied = transition(&mut *job);
        if !applied {
            tracing::warn!(job_id = %id, status = %from, "rejected job status transition");
        }
        applied
    }

    pub fn subscribe(&self, id: JobId) -> Option<EventSubscription> {
        self.entry(id).map(|e| e.events.subscribe())
    }

    /// Best-effort append to the job's timeline. Never blocks.
    pub fn publish(&self, id: JobId, event: ProgressEvent) {
        if let Some(entry) = self.entry(id) {
            entry.events.publish(event);
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn kinds(sub: &mut EventSubscription) -> Vec<ProgressKind> {
        sub.drain().into_iter().map(|e| e.kind).collect()
    }

    #[test]
    fn ensure_job_is_idempotent() {
        let registry = JobRegistry::default();
        let id = JobId::new();

        let first = registry.ensure_job(id);
        let second = registry.ensure_job(id);
        assert_eq!(first, second);
        assert_eq!(first.status, JobStatus::Created);

        let mut sub = registry.subscribe(id).unwrap();
        assert_eq!(kinds(&mut sub), vec![ProgressKind::JobPrepared]);
    }

    #[test]
    fn create_job_generates_id_and_prepares_once() {
        let registry = JobRegistry::default();
        let id = registry.create_job(Some("app.apk".into()), vec!["a.rvp".into()], None);

        let again = registry.create_job(Some("app-2.apk".into()), vec![], Some(id));
        assert_eq!(again, id);

        let job = registry.get(id).unwrap();
        assert_eq!(job.source_artifact_name.as_deref(), Some("app-2.apk"));
        assert!(job.source_bundle_names.is_empty());

        let mut sub = registry.subscribe(id).unwrap();
        assert_eq!(kinds(&mut sub), vec![ProgressKind::JobPrepared]);
    }

    #[test]
    fn create_job_preserves_created_at_and_running_status() {
        let registry = JobRegistry::default();
        let id = JobId::new();
        let original = registry.ensure_job(id);
        assert!(registry.mark_running(id));

        registry.create_job(Some("late.apk".into()), vec![], Some(id));
        let job = registry.get(id).unwrap();
        assert_eq!(job.created_at, original.created_at);
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.updated_at >= original.updated_at);
    }

    #[test]
    fn terminal_job_is_redefined_on_create() {
        let registry = JobRegistry::default();
        let id = registry.create_job(None, vec![], None);
        registry.mark_running(id);
        registry.mark_failure(id, "boom");

        registry.create_job(Some("retry.apk".into()), vec![], Some(id));
        let job = registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert!(job.error_message.is_none());

        // History survives the redefinition.
        let mut sub = registry.subscribe(id).unwrap();
        assert_eq!(kinds(&mut sub), vec![ProgressKind::JobPrepared]);
    }

    #[test]
    fn status_only_moves_forward() {
        let registry = JobRegistry::default();
        let id = registry.create_job(None, vec![], None);

        assert!(!registry.mark_success(id, "out.apk"));
        assert!(registry.mark_running(id));
        assert!(!registry.mark_running(id));
        assert!(registry.mark_success(id, "out.apk"));
        assert!(!registry.mark_failure(id, "late failure"));

        let job = registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.output_artifact_name.as_deref(), Some("out.apk"));
        assert!(job.error_message.is_none());
    }

    #[test]
    fn operations_on_absent_jobs_are_no_ops() {
        let registry = JobRegistry::default();
        let id = JobId::new();

        assert!(!registry.mark_running(id));
        assert!(!registry.mark_failure(id, "x"));
        registry.publish(id, ProgressEvent::job(ProgressKind::Info, "ignored"));
        assert!(registry.get(id).is_none());
        assert!(registry.subscribe(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_ensure_prepares_exactly_once() {
        let registry = Arc::new(JobRegistry::default());
        let id = JobId::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.ensure_job(id))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut sub = registry.subscribe(id).unwrap();
        assert_eq!(kinds(&mut sub), vec![ProgressKind::JobPrepared]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn replay_capacity_is_configurable() {
        let registry = JobRegistry::new(3);
        let id = registry.create_job(None, vec![], None);
        for n in 0..5 {
            registry.publish(id, ProgressEvent::job(ProgressKind::Info, format!("{n}")));
        }
        let mut sub = registry.subscribe(id).unwrap();
        let messages: Vec<_> = sub.drain().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["2", "3", "4"]);
    }
}
