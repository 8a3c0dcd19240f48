//! Sample bundles and the `demo` / `describe` commands built on them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tempfile::TempDir;

use webpatcher::config::WebPatcherConfig;
use webpatcher::engine::scripted::{
    BundleManifest, CompletionOrder, ManifestPatch, ScriptedArtifacts, ScriptedEngine,
    write_bundle,
};
use webpatcher::engine::{CompatiblePackage, OptionType, PatchKind, PatchOption, TargetPackage};
use webpatcher::events::EventSubscription;
use webpatcher::job::JobRegistry;
use webpatcher::metadata::describe_bundles;
use webpatcher::options::{parse_options, parse_selected_patches};
use webpatcher::orchestrator::{JobOrchestrator, PatchRequest, UploadedFile};

use crate::cli::{DemoArgs, DescribeArgs};
use crate::ui::JobProgress;

const SAMPLE_PACKAGE: &str = "com.example.app";
const SAMPLE_VERSION: &str = "1.1.0";

struct SampleInputs {
    dir: TempDir,
    artifact: PathBuf,
    bundles: Vec<PathBuf>,
}

fn pinned(name: &str, versions: &[&str]) -> ManifestPatch {
    ManifestPatch {
        compatible_packages: Some(vec![CompatiblePackage::versions(
            SAMPLE_PACKAGE,
            versions.iter().copied(),
        )]),
        ..ManifestPatch::named(name)
    }
}

fn core_bundle() -> BundleManifest {
    let mut color = PatchOption::new("color", OptionType::String);
    color.title = Some("Accent colour".into());
    color.default_value = Some(json!("#000000"));

    BundleManifest {
        patches: vec![
            ManifestPatch {
                description: Some("Removes banner and feed ads".into()),
                use_by_default: true,
                dependencies: vec!["Shared integrations".into()],
                ..pinned("Hide ads", &["1.0.0", "1.1.0"])
            },
            ManifestPatch {
                description: Some("Common hooks used by other patches".into()),
                options: vec![PatchOption::new("debug", OptionType::Boolean)],
                ..ManifestPatch::named("Shared integrations")
            },
            ManifestPatch {
                description: Some("Applies a custom accent colour".into()),
                kind: PatchKind::Resource,
                dependencies: vec!["Shared integrations".into()],
                options: vec![color],
                ..ManifestPatch::named("Custom theme")
            },
            ManifestPatch {
                description: Some("Only needed on old releases".into()),
                use_by_default: true,
                ..pinned("Legacy fix", &["0.9.0"])
            },
        ],
    }
}

fn extras_bundle() -> BundleManifest {
    BundleManifest {
        patches: vec![
            ManifestPatch {
                description: Some("Removes ads on the 2.x line".into()),
                use_by_default: true,
                ..pinned("Hide ads", &["2.0.0"])
            },
            ManifestPatch {
                description: Some("Reports a different client identity".into()),
                use_by_default: true,
                kind: PatchKind::RawResource,
                ..ManifestPatch::named("Spoof client")
            },
        ],
    }
}

fn write_samples() -> Result<SampleInputs> {
    let dir = TempDir::new().context("creating sample directory")?;
    let artifact = dir.path().join("example.apk");
    fs::write(&artifact, b"PK\x03\x04example").context("writing sample artifact")?;
    let bundles = vec![
        write_bundle(dir.path(), "core.rvp", &core_bundle())?,
        write_bundle(dir.path(), "extras.rvp", &extras_bundle())?,
    ];
    Ok(SampleInputs {
        dir,
        artifact,
        bundles,
    })
}

async fn follow(mut events: EventSubscription, progress: &JobProgress) {
    while let Some(event) = events.recv().await {
        progress.event(&event);
        if event.kind.is_terminal() {
            break;
        }
    }
}

/// Run one job over the sample inputs, printing events as they arrive.
pub async fn run(config: &WebPatcherConfig, args: DemoArgs, verbose: bool) -> Result<()> {
    let samples = write_samples()?;

    let mut engine = ScriptedEngine::new(TargetPackage::new(SAMPLE_PACKAGE, SAMPLE_VERSION));
    if args.reverse {
        engine = engine.with_order(CompletionOrder::Reverse);
    }
    if let Some(name) = &args.fail {
        engine = engine.fail_patch(name.as_str(), "injected failure");
    }

    let registry = Arc::new(JobRegistry::new(config.event_replay));
    let mut orchestrator = JobOrchestrator::new(
        Arc::clone(&registry),
        engine,
        ScriptedArtifacts::new(),
        config.signing(),
    );
    if let Some(root) = &config.work_root {
        orchestrator = orchestrator.with_work_root(root);
    }

    let request = PatchRequest {
        options: parse_options(args.options.as_deref())?,
        selected_patches: parse_selected_patches(args.select.as_deref())?,
        force: args.force,
        ..PatchRequest::new(
            UploadedFile::new(&samples.artifact),
            samples.bundles.iter().map(UploadedFile::new).collect(),
        )
    };

    let id = orchestrator.submit(&request, None)?;
    let events = registry
        .subscribe(id)
        .context("job vanished right after submission")?;
    let progress = JobProgress::start(&format!("Job {id}"), verbose);

    let (result, ()) = tokio::join!(orchestrator.run(id, &request), follow(events, &progress));

    if let Some(job) = registry.get(id) {
        progress.finish(&job);
    }
    match result {
        Ok(artifact) => {
            let size = fs::metadata(artifact.path()).map(|m| m.len()).unwrap_or(0);
            println!("output: {} ({size} bytes)", artifact.path().display());
            artifact.close().context("removing job workspace")?;
        }
        Err(err) => {
            let body = err.to_body();
            println!("error [{} {}]: {}", body.status.http_code(), body.status, body.error);
        }
    }
    drop(samples.dir);
    Ok(())
}

/// Print the metadata report for the sample bundles.
pub fn describe(args: DescribeArgs) -> Result<()> {
    let samples = write_samples()?;

    let target = args.package.as_deref().map(|package| TargetPackage {
        package_name: package.to_string(),
        package_version: args.package_version.clone(),
    });
    let engine = ScriptedEngine::new(
        target
            .clone()
            .unwrap_or_else(|| TargetPackage::new(SAMPLE_PACKAGE, SAMPLE_VERSION)),
    );
    let artifact: Option<&Path> = target.as_ref().map(|_| samples.artifact.as_path());

    let report = describe_bundles(&engine, &samples.bundles, artifact)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
