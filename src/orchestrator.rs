//! Drives one patch job from `RUNNING` to a terminal state.
//!
//! Inputs are copied into a per-job workspace, the engine runs the selected
//! patches and its unordered completions are turned into a per-patch
//! timeline on the job's event channel. The workspace is deleted on every
//! failure path, and on success when the caller closes the returned
//! [`PatchedArtifact`].

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tempfile::TempDir;

use crate::config::SigningConfig;
use crate::engine::{ArtifactTools, EngineSession, PatchEngine, PatchId};
use crate::error::PatchError;
use crate::events::{ProgressEvent, ProgressKind};
use crate::job::{JobId, JobRegistry};
use crate::options::PatchOptions;
use crate::selector::{SelectionRequest, select_patches};

/// A caller-owned input file. It is copied, never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub path: PathBuf,
    /// Name the caller gave the upload, if any.
    pub original_name: Option<String>,
}

impl UploadedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            original_name: None,
        }
    }

    pub fn named(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            original_name: Some(name.into()),
        }
    }

    /// Final path component of the upload name, falling back to the
    /// stored file's name. Directory parts are never kept.
    pub fn file_name(&self) -> Option<String> {
        self.original_name
            .as_deref()
            .and_then(|name| Path::new(name).file_name())
            .or_else(|| self.path.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatchRequest {
    pub artifact: Option<UploadedFile>,
    pub bundles: Vec<UploadedFile>,
    pub options: PatchOptions,
    pub force: bool,
    /// Explicit selection. Empty means "use defaults".
    pub selected_patches: BTreeSet<String>,
}

impl PatchRequest {
    pub fn new(artifact: UploadedFile, bundles: Vec<UploadedFile>) -> Self {
        Self {
            artifact: Some(artifact),
            bundles,
            ..Self::default()
        }
    }

    /// The artifact to patch, once the request is known to be usable.
    pub fn validate(&self) -> Result<&UploadedFile, PatchError> {
        let artifact = self
            .artifact
            .as_ref()
            .ok_or_else(|| PatchError::invalid("Missing artifact upload"))?;
        if self.bundles.is_empty() {
            return Err(PatchError::invalid(
                "At least one patch bundle must be provided",
            ));
        }
        Ok(artifact)
    }

    fn bundle_names(&self) -> Vec<String> {
        self.bundles
            .iter()
            .enumerate()
            .map(|(index, bundle)| bundle_file_name(bundle, index))
            .collect()
    }
}

fn bundle_file_name(bundle: &UploadedFile, index: usize) -> String {
    bundle
        .file_name()
        .unwrap_or_else(|| format!("patch-{}.rvp", index + 1))
}

/// A signed output artifact and the workspace that holds it.
///
/// Dropping this deletes the workspace; [`PatchedArtifact::close`] does the
/// same and reports errors.
#[derive(Debug)]
pub struct PatchedArtifact {
    path: PathBuf,
    workspace: TempDir,
}

impl PatchedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    pub fn close(self) -> io::Result<()> {
        self.workspace.close()
    }
}

/// Assigns each declared patch exactly one "started" event, inferred from
/// a completion stream that never reports starts.
///
/// Patches are tracked by id: distinct definitions may share a name.
#[derive(Debug)]
struct StartTracker {
    declared: std::vec::IntoIter<(PatchId, String)>,
    started: HashMap<PatchId, Instant>,
}

impl StartTracker {
    /// `declared` must already be in announcement order.
    fn new(declared: Vec<(PatchId, String)>) -> Self {
        Self {
            declared: declared.into_iter(),
            started: HashMap::new(),
        }
    }

    /// Advance the cursor up to and including `id`, returning a start
    /// event for every patch passed over. Empty if `id` already started.
    fn ensure_started(&mut self, id: PatchId) -> Vec<ProgressEvent> {
        if self.started.contains_key(&id) {
            return Vec::new();
        }
        let mut events = Vec::new();
        for (next, name) in self.declared.by_ref() {
            self.started.insert(next, Instant::now());
            events.push(ProgressEvent::patch(
                ProgressKind::PatchStarted,
                name.as_str(),
                format!("Patch {name} started"),
            ));
            if next == id {
                break;
            }
        }
        events
    }

    fn elapsed_ms(&self, id: PatchId) -> Option<i64> {
        self.started
            .get(&id)
            .map(|start| i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX))
    }
}

/// Run a synchronous engine or filesystem step off the async workers.
async fn blocking<T, F>(step: F) -> Result<T, PatchError>
where
    F: FnOnce() -> Result<T, PatchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(step)
        .await
        .map_err(|e| PatchError::Unexpected(format!("blocking task failed: {e}")))?
}

pub struct JobOrchestrator<E, A> {
    registry: Arc<JobRegistry>,
    engine: Arc<E>,
    artifacts: Arc<A>,
    signing: SigningConfig,
    work_root: Option<PathBuf>,
}

impl<E, A> JobOrchestrator<E, A>
where
    E: PatchEngine + 'static,
    E::Session: 'static,
    A: ArtifactTools + 'static,
{
    pub fn new(registry: Arc<JobRegistry>, engine: E, artifacts: A, signing: SigningConfig) -> Self {
        Self {
            registry,
            engine: Arc::new(engine),
            artifacts: Arc::new(artifacts),
            signing,
            work_root: None,
        }
    }

    /// Create workspaces under `root` instead of the system temp dir.
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Validate `request` and record it as a job, reusing `id` if given.
    pub fn submit(&self, request: &PatchRequest, id: Option<JobId>) -> Result<JobId, PatchError> {
        let artifact = request.validate()?;
        Ok(self
            .registry
            .create_job(artifact.file_name(), request.bundle_names(), id))
    }

    /// Run the job to completion and hand back the signed artifact.
    ///
    /// The job must be `CREATED`. Every failure after that point leaves the
    /// job `FAILED` with a "failed" event. Expected failures are returned as
    /// [`PatchError::Processing`]; anything else stays
    /// [`PatchError::Unexpected`] so its detail is not rendered to callers.
    pub async fn run(
        &self,
        id: JobId,
        request: &PatchRequest,
    ) -> Result<PatchedArtifact, PatchError> {
        let artifact = request.validate()?;
        if !self.registry.mark_running(id) {
            return Err(PatchError::invalid(format!("Job {id} is not ready to run")));
        }
        tracing::info!(job_id = %id, bundles = request.bundles.len(), "running patch job");

        let workspace = match self.create_workspace(id) {
            Ok(workspace) => workspace,
            Err(e) => return Err(self.fail(id, e.into())),
        };

        match self.execute(id, request, artifact, workspace.path()).await {
            Ok(path) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.registry.mark_success(id, name.as_str());
                self.registry
                    .publish(id, ProgressEvent::job(ProgressKind::JobCompleted, "Job completed"));
                tracing::info!(job_id = %id, output = %name, "patch job completed");
                Ok(PatchedArtifact { path, workspace })
            }
            Err(err) => {
                if let Err(e) = workspace.close() {
                    tracing::warn!(job_id = %id, error = %e, "failed to remove job workspace");
                }
                Err(self.fail(id, err))
            }
        }
    }

    fn create_workspace(&self, id: JobId) -> io::Result<TempDir> {
        let prefix = format!("webpatcher-{id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match &self.work_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }

    /// Mark the job failed with the full message and convert `err` into
    /// what the caller sees.
    fn fail(&self, id: JobId, err: PatchError) -> PatchError {
        let (message, surfaced) = match err {
            PatchError::Unexpected(detail) => {
                tracing::error!(job_id = %id, detail = %detail, "patch job hit an unexpected error");
                (detail.clone(), PatchError::Unexpected(detail))
            }
            other => {
                tracing::warn!(job_id = %id, error = %other, "patch job failed");
                let message = other.to_string();
                (message.clone(), PatchError::processing(message))
            }
        };
        self.registry.mark_failure(id, message.as_str());
        self.registry
            .publish(id, ProgressEvent::job(ProgressKind::JobFailed, message.as_str()));
        surfaced
    }

    async fn execute(
        &self,
        id: JobId,
        request: &PatchRequest,
        artifact: &UploadedFile,
        workspace: &Path,
    ) -> Result<PathBuf, PatchError> {
        let artifact_name = artifact
            .file_name()
            .unwrap_or_else(|| "artifact.apk".to_string());
        let artifact_copy = workspace.join(&artifact_name);
        tokio::fs::copy(&artifact.path, &artifact_copy).await?;

        let mut bundle_copies = Vec::with_capacity(request.bundles.len());
        for (index, bundle) in request.bundles.iter().enumerate() {
            let copy = workspace.join(bundle_file_name(bundle, index));
            tokio::fs::copy(&bundle.path, &copy).await?;
            bundle_copies.push(copy);
        }

        let engine = Arc::clone(&self.engine);
        let catalog = blocking(move || Ok(engine.load_patches(&bundle_copies)?)).await?;
        self.registry
            .publish(id, ProgressEvent::job(ProgressKind::JobStarted, "Job started"));

        let engine = Arc::clone(&self.engine);
        let (target_path, scratch) = (artifact_copy.clone(), workspace.join("patcher-temp"));
        let mut session = blocking(move || Ok(engine.open(&target_path, &scratch)?)).await?;
        let target = session.target().clone();
        tracing::info!(
            job_id = %id,
            package = %target.package_name,
            version = target.package_version.as_deref().unwrap_or("unknown"),
            "processing target package"
        );

        let selection = select_patches(
            &catalog,
            &SelectionRequest {
                target: &target,
                options: &request.options,
                selected: (!request.selected_patches.is_empty()).then_some(&request.selected_patches),
                force: request.force,
            },
        )?;
        tracing::info!(job_id = %id, patches = selection.len(), "executing patches");

        let mut declared: Vec<(PatchId, String)> = selection
            .iter()
            .filter_map(|p| Some((p.id, p.name.clone()?)))
            .collect();
        declared.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        for (_, name) in &declared {
            self.registry.publish(
                id,
                ProgressEvent::patch(ProgressKind::PatchQueued, name.as_str(), format!("Queued patch {name}")),
            );
        }

        session.submit(selection);
        {
            let mut tracker = StartTracker::new(declared);
            let mut completions = session.execute();
            while let Some(completion) = completions.next().await {
                if completion.name.is_some() {
                    for event in tracker.ensure_started(completion.id) {
                        self.registry.publish(id, event);
                    }
                }

                let label = completion.name.as_deref().unwrap_or("<unnamed>");
                if let Some(failure) = &completion.failure {
                    let message = format!("Patch \"{label}\" failed: {failure}");
                    let event = match &completion.name {
                        Some(name) => {
                            ProgressEvent::patch(ProgressKind::PatchFailed, name.as_str(), message.as_str())
                        }
                        None => ProgressEvent::job(ProgressKind::PatchFailed, message.as_str()),
                    };
                    self.registry.publish(id, event);
                    return Err(PatchError::processing(message));
                }

                if let Some(name) = &completion.name {
                    let event = match tracker.elapsed_ms(completion.id) {
                        Some(ms) => ProgressEvent::patch(
                            ProgressKind::PatchSucceeded,
                            name.as_str(),
                            format!("Patch {name} completed in {ms}ms"),
                        )
                        .with_duration_ms(ms),
                        None => ProgressEvent::patch(
                            ProgressKind::PatchSucceeded,
                            name.as_str(),
                            format!("Patch {name} completed"),
                        ),
                    };
                    self.registry.publish(id, event);
                }
            }
        }

        let artifacts = Arc::clone(&self.artifacts);
        let working_copy = workspace.join(derived_name(&artifact_name, "work"));
        let signed = workspace.join(derived_name(&artifact_name, "patched"));
        let keystore = self.signing.keystore_in(workspace);
        let signer = self.signing.signer.clone();
        let output = signed.clone();
        blocking(move || {
            let result = session.finish()?;
            fs::copy(&artifact_copy, &working_copy)?;
            artifacts.apply(&result, &working_copy)?;
            artifacts.sign(&working_copy, &output, &signer, &keystore)?;
            Ok(())
        })
        .await?;

        Ok(signed)
    }
}

/// `app.apk` + `work` -> `app-work.apk`.
fn derived_name(file_name: &str, suffix: &str) -> String {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    match path.extension() {
        Some(ext) => format!("{stem}-{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{suffix}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TargetPackage;
    use crate::engine::scripted::{
        BundleManifest, CompletionOrder, ManifestPatch, ScriptedArtifacts, ScriptedEngine,
        write_bundle,
    };
    use crate::engine::{CompatiblePackage, OptionType, PatchOption};
    use crate::job::JobStatus;
    use serde_json::json;

    struct Fixture {
        inputs: TempDir,
        work_root: TempDir,
        registry: Arc<JobRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                inputs: TempDir::new().unwrap(),
                work_root: TempDir::new().unwrap(),
                registry: Arc::new(JobRegistry::default()),
            }
        }

        fn request(&self, patches: Vec<ManifestPatch>) -> PatchRequest {
            let artifact = self.inputs.path().join("app.apk");
            fs::write(&artifact, b"original").unwrap();
            let bundle =
                write_bundle(self.inputs.path(), "bundle.rvp", &BundleManifest { patches }).unwrap();
            PatchRequest::new(UploadedFile::new(artifact), vec![UploadedFile::new(bundle)])
        }

        fn orchestrator(
            &self,
            engine: ScriptedEngine,
            artifacts: ScriptedArtifacts,
        ) -> JobOrchestrator<ScriptedEngine, ScriptedArtifacts> {
            JobOrchestrator::new(
                Arc::clone(&self.registry),
                engine,
                artifacts,
                SigningConfig::default(),
            )
            .with_work_root(self.work_root.path())
        }

        fn timeline(&self, id: JobId) -> Vec<(ProgressKind, Option<String>)> {
            let mut sub = self.registry.subscribe(id).unwrap();
            sub.drain()
                .into_iter()
                .map(|e| (e.kind, e.patch_name))
                .collect()
        }

        fn workspaces_left(&self) -> usize {
            fs::read_dir(self.work_root.path()).unwrap().count()
        }
    }

    fn engine() -> ScriptedEngine {
        ScriptedEngine::new(TargetPackage::new("com.example", "1.0"))
    }

    fn default_on(name: &str) -> ManifestPatch {
        ManifestPatch {
            use_by_default: true,
            ..ManifestPatch::named(name)
        }
    }

    fn ev(kind: ProgressKind, patch: Option<&str>) -> (ProgressKind, Option<String>) {
        (kind, patch.map(str::to_string))
    }

    #[tokio::test]
    async fn end_to_end_success() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(engine(), ScriptedArtifacts::new());
        let request = fx.request(vec![default_on("X")]);

        let id = orch.submit(&request, None).unwrap();
        let output = orch.run(id, &request).await.unwrap();

        assert_eq!(output.file_name(), Some("app-patched.apk"));
        let bytes = fs::read_to_string(output.path()).unwrap();
        assert!(bytes.starts_with("original"));
        assert!(bytes.ends_with("# patched: X\n"));

        let job = fx.registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.output_artifact_name.as_deref(), Some("app-patched.apk"));
        assert_eq!(job.source_artifact_name.as_deref(), Some("app.apk"));
        assert_eq!(job.source_bundle_names, vec!["bundle.rvp"]);

        use ProgressKind::*;
        assert_eq!(
            fx.timeline(id),
            vec![
                ev(JobPrepared, None),
                ev(JobStarted, None),
                ev(PatchQueued, Some("X")),
                ev(PatchStarted, Some("X")),
                ev(PatchSucceeded, Some("X")),
                ev(JobCompleted, None),
            ]
        );

        // Caller-owned inputs are untouched.
        let original = fs::read(fx.inputs.path().join("app.apk")).unwrap();
        assert_eq!(original, b"original");

        assert_eq!(fx.workspaces_left(), 1);
        output.close().unwrap();
        assert_eq!(fx.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn success_event_carries_duration() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(engine(), ScriptedArtifacts::new());
        let request = fx.request(vec![default_on("X")]);
        let id = orch.submit(&request, None).unwrap();
        orch.run(id, &request).await.unwrap();

        let mut sub = fx.registry.subscribe(id).unwrap();
        let succeeded = sub
            .drain()
            .into_iter()
            .find(|e| e.kind == ProgressKind::PatchSucceeded)
            .unwrap();
        assert!(succeeded.duration_ms.is_some());
        assert!(succeeded.message.starts_with("Patch X completed in "));
    }

    #[tokio::test]
    async fn out_of_order_completion_announces_starts_retroactively() {
        let fx = Fixture::new();
        let engine = engine().with_order(CompletionOrder::Explicit(vec!["B".into(), "A".into()]));
        let orch = fx.orchestrator(engine, ScriptedArtifacts::new());
        let request = fx.request(vec![default_on("C"), default_on("B"), default_on("A")]);

        let id = orch.submit(&request, None).unwrap();
        orch.run(id, &request).await.unwrap();

        use ProgressKind::*;
        let timeline: Vec<_> = fx.timeline(id).into_iter().skip(2).collect();
        assert_eq!(
            timeline,
            vec![
                ev(PatchQueued, Some("A")),
                ev(PatchQueued, Some("B")),
                ev(PatchQueued, Some("C")),
                ev(PatchStarted, Some("A")),
                ev(PatchStarted, Some("B")),
                ev(PatchSucceeded, Some("B")),
                ev(PatchSucceeded, Some("A")),
                ev(PatchStarted, Some("C")),
                ev(PatchSucceeded, Some("C")),
                ev(JobCompleted, None),
            ]
        );
    }

    #[tokio::test]
    async fn failing_patch_stops_the_job() {
        let fx = Fixture::new();
        let engine = engine().fail_patch("B", "boom");
        let orch = fx.orchestrator(engine, ScriptedArtifacts::new());
        let request = fx.request(vec![default_on("A"), default_on("B"), default_on("C")]);

        let id = orch.submit(&request, None).unwrap();
        let err = orch.run(id, &request).await.unwrap_err();
        assert!(matches!(&err, PatchError::Processing { message } if message == "Patch \"B\" failed: boom"));

        let job = fx.registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.output_artifact_name.is_none());
        assert_eq!(job.error_message.as_deref(), Some("Patch \"B\" failed: boom"));

        use ProgressKind::*;
        let timeline = fx.timeline(id);
        assert!(!timeline.contains(&ev(PatchStarted, Some("C"))));
        assert_eq!(
            &timeline[timeline.len() - 4..],
            &[
                ev(PatchSucceeded, Some("A")),
                ev(PatchStarted, Some("B")),
                ev(PatchFailed, Some("B")),
                ev(JobFailed, None),
            ]
        );
        assert_eq!(fx.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn signing_failure_cleans_up_workspace() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(engine(), ScriptedArtifacts::rejecting_signatures());
        let request = fx.request(vec![default_on("X")]);

        let id = orch.submit(&request, None).unwrap();
        let err = orch.run(id, &request).await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to sign artifact"));

        let job = fx.registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(fx.timeline(id).last(), Some(&ev(ProgressKind::JobFailed, None)));
        assert_eq!(fx.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn load_failure_fails_before_start() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(engine(), ScriptedArtifacts::new());
        let mut request = fx.request(vec![default_on("X")]);
        let broken = fx.inputs.path().join("broken.rvp");
        fs::write(&broken, "not json").unwrap();
        request.bundles.push(UploadedFile::new(broken));

        let id = orch.submit(&request, None).unwrap();
        let err = orch.run(id, &request).await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to load patches"));

        use ProgressKind::*;
        assert_eq!(fx.timeline(id), vec![ev(JobPrepared, None), ev(JobFailed, None)]);
    }

    #[tokio::test]
    async fn dependencies_and_options_reach_the_engine() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(engine(), ScriptedArtifacts::new());
        let mut request = fx.request(vec![
            ManifestPatch {
                dependencies: vec!["Shared".into()],
                ..default_on("Theme")
            },
            ManifestPatch {
                options: vec![PatchOption::new("color", OptionType::String)],
                ..ManifestPatch::named("Shared")
            },
            ManifestPatch {
                compatible_packages: Some(vec![CompatiblePackage::versions("com.example", ["9.9"])]),
                ..default_on("Pinned")
            },
        ]);
        request
            .options
            .insert("Shared".into(), [("color".to_string(), json!("#000000"))].into());

        let id = orch.submit(&request, None).unwrap();
        let output = orch.run(id, &request).await.unwrap();

        let queued: Vec<_> = fx
            .timeline(id)
            .into_iter()
            .filter(|(kind, _)| *kind == ProgressKind::PatchQueued)
            .filter_map(|(_, name)| name)
            .collect();
        assert_eq!(queued, vec!["Shared", "Theme"]);

        let record: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(output.workspace().join("patcher-temp/patched.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(record["options"]["Shared"]["color"], json!("#000000"));
    }

    #[tokio::test]
    async fn run_requires_a_created_job() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(engine(), ScriptedArtifacts::new());
        let request = fx.request(vec![default_on("X")]);

        // Unknown id.
        let err = orch.run(JobId::new(), &request).await.unwrap_err();
        assert!(matches!(err, PatchError::InvalidInput(_)));

        let id = orch.submit(&request, None).unwrap();
        orch.run(id, &request).await.unwrap();
        let err = orch.run(id, &request).await.unwrap_err();
        assert!(matches!(err, PatchError::InvalidInput(_)));
        assert_eq!(fx.registry.get(id).unwrap().status, JobStatus::Success);

        // Resubmitting the same id redefines it and it can run again.
        orch.submit(&request, Some(id)).unwrap();
        assert_eq!(fx.registry.get(id).unwrap().status, JobStatus::Created);
        orch.run(id, &request).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_requests_leave_job_untouched() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(engine(), ScriptedArtifacts::new());
        let valid = fx.request(vec![default_on("X")]);
        let id = orch.submit(&valid, None).unwrap();

        let no_bundles = PatchRequest {
            bundles: Vec::new(),
            ..valid.clone()
        };
        let err = orch.run(id, &no_bundles).await.unwrap_err();
        assert_eq!(err.to_string(), "At least one patch bundle must be provided");

        let no_artifact = PatchRequest {
            artifact: None,
            ..valid
        };
        let err = orch.submit(&no_artifact, None).unwrap_err();
        assert_eq!(err.to_string(), "Missing artifact upload");

        assert_eq!(fx.registry.get(id).unwrap().status, JobStatus::Created);
        assert_eq!(fx.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn independent_jobs_run_concurrently() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(engine().fail_patch("Bad", "nope"), ScriptedArtifacts::new());
        let good = fx.request(vec![default_on("Good")]);
        let bad = PatchRequest {
            selected_patches: ["Bad".to_string()].into(),
            ..fx.request(vec![default_on("Good"), ManifestPatch::named("Bad")])
        };

        let good_id = orch.submit(&good, None).unwrap();
        let bad_id = orch.submit(&bad, None).unwrap();
        let (good_result, bad_result) = tokio::join!(orch.run(good_id, &good), orch.run(bad_id, &bad));

        assert!(good_result.is_ok());
        assert!(bad_result.is_err());
        assert_eq!(fx.registry.get(good_id).unwrap().status, JobStatus::Success);
        assert_eq!(fx.registry.get(bad_id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn same_named_definitions_each_start_before_their_outcome() {
        let fx = Fixture::new();
        let engine = engine().with_order(CompletionOrder::Reverse);
        let orch = fx.orchestrator(engine, ScriptedArtifacts::new());

        let first = write_bundle(
            fx.inputs.path(),
            "a.rvp",
            &BundleManifest {
                patches: vec![ManifestPatch {
                    description: Some("first".into()),
                    ..default_on("Dup")
                }],
            },
        )
        .unwrap();
        let second = write_bundle(
            fx.inputs.path(),
            "b.rvp",
            &BundleManifest {
                patches: vec![
                    ManifestPatch {
                        description: Some("second".into()),
                        ..default_on("Dup")
                    },
                    default_on("Z"),
                ],
            },
        )
        .unwrap();
        let artifact = fx.inputs.path().join("app.apk");
        fs::write(&artifact, b"original").unwrap();
        let request = PatchRequest::new(
            UploadedFile::new(artifact),
            vec![UploadedFile::new(first), UploadedFile::new(second)],
        );

        let id = orch.submit(&request, None).unwrap();
        orch.run(id, &request).await.unwrap();

        use ProgressKind::*;
        let timeline: Vec<_> = fx.timeline(id).into_iter().skip(2).collect();
        assert_eq!(
            timeline,
            vec![
                ev(PatchQueued, Some("Dup")),
                ev(PatchQueued, Some("Dup")),
                ev(PatchQueued, Some("Z")),
                ev(PatchStarted, Some("Dup")),
                ev(PatchStarted, Some("Dup")),
                ev(PatchStarted, Some("Z")),
                ev(PatchSucceeded, Some("Z")),
                ev(PatchSucceeded, Some("Dup")),
                ev(PatchSucceeded, Some("Dup")),
                ev(JobCompleted, None),
            ]
        );
    }

    #[tokio::test]
    async fn unexpected_failure_detail_stays_local() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(engine(), ScriptedArtifacts::new());
        let mut request = fx.request(vec![default_on("X")]);
        request.artifact = Some(UploadedFile::new(fx.inputs.path().join("missing.apk")));

        let id = orch.submit(&request, None).unwrap();
        let err = orch.run(id, &request).await.unwrap_err();
        assert!(matches!(err, PatchError::Unexpected(_)));

        let body = err.to_body();
        assert_eq!(body.error, "Unexpected server error");
        assert_eq!(body.status.http_code(), 500);

        let job = fx.registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.is_some_and(|m| !m.is_empty()));
        assert_eq!(fx.timeline(id).last(), Some(&ev(ProgressKind::JobFailed, None)));
        assert_eq!(fx.workspaces_left(), 0);
    }

    #[test]
    fn upload_names_drop_directories() {
        let upload = UploadedFile::named("/tmp/upload-123", "../../etc/app.apk");
        assert_eq!(upload.file_name().as_deref(), Some("app.apk"));
        assert_eq!(UploadedFile::new("/tmp/x.rvp").file_name().as_deref(), Some("x.rvp"));

        let unnamed = UploadedFile::named("/", "");
        assert_eq!(bundle_file_name(&unnamed, 1), "patch-2.rvp");
    }

    #[test]
    fn derived_names() {
        assert_eq!(derived_name("app.apk", "work"), "app-work.apk");
        assert_eq!(derived_name("app", "patched"), "app-patched");
    }

    #[test]
    fn tracker_walks_declared_order_once() {
        let mut tracker = StartTracker::new(vec![
            (PatchId(2), "A".into()),
            (PatchId(0), "B".into()),
            (PatchId(1), "C".into()),
        ]);
        let names = |events: Vec<ProgressEvent>| -> Vec<String> {
            events.into_iter().filter_map(|e| e.patch_name).collect()
        };

        assert_eq!(names(tracker.ensure_started(PatchId(0))), vec!["A", "B"]);
        assert!(tracker.ensure_started(PatchId(2)).is_empty());
        assert!(tracker.elapsed_ms(PatchId(2)).is_some());
        assert!(tracker.elapsed_ms(PatchId(1)).is_none());
        assert_eq!(names(tracker.ensure_started(PatchId(1))), vec!["C"]);
    }

    #[test]
    fn tracker_keeps_same_named_patches_apart() {
        let mut tracker = StartTracker::new(vec![
            (PatchId(0), "Dup".into()),
            (PatchId(1), "Dup".into()),
        ]);

        assert_eq!(tracker.ensure_started(PatchId(0)).len(), 1);
        assert!(tracker.elapsed_ms(PatchId(1)).is_none());
        assert_eq!(tracker.ensure_started(PatchId(1)).len(), 1);
        assert!(tracker.ensure_started(PatchId(1)).is_empty());
    }
}