//! Describes uploaded bundles: which patches they declare, how those
//! patches are configured and whether they fit a given target.

mod variant;

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

pub use variant::{Variant, VariantSelection, group_variants, resolve_variant};

use crate::engine::{
    CompatiblePackage, EngineSession, Patch, PatchEngine, PatchKind, PatchOption, TargetPackage,
};
use crate::error::{EngineError, PatchError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataReport {
    pub bundles: Vec<BundleMetadata>,
    pub patches: Vec<PatchMetadata>,
    pub target_package: Option<TargetPackage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub name: String,
    pub patch_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchMetadata {
    pub name: String,
    pub description: Option<String>,
    pub default_selected: bool,
    pub bundle_names: Vec<String>,
    #[serde(rename = "type")]
    pub kind: PatchKind,
    pub dependencies: Vec<String>,
    pub compatible_packages: Vec<CompatiblePackage>,
    pub options: Vec<PatchOption>,
    pub is_compatible: bool,
    pub is_version_compatible: bool,
    pub incompatibility_reason: Option<String>,
}

/// Display verdict of a patch against a target. Never honours `force`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compatibility {
    pub package_match: bool,
    pub version_match: bool,
    pub reason: Option<String>,
}

impl Compatibility {
    fn compatible() -> Self {
        Self {
            package_match: true,
            version_match: true,
            reason: None,
        }
    }
}

pub fn evaluate_compatibility(patch: &Patch, target: Option<&TargetPackage>) -> Compatibility {
    let (Some(packages), Some(target)) = (&patch.compatible_packages, target) else {
        return Compatibility::compatible();
    };

    let Some(entry) = packages
        .iter()
        .find(|p| p.package_name == target.package_name)
    else {
        return Compatibility {
            package_match: false,
            version_match: false,
            reason: Some(package_list_reason(packages)),
        };
    };

    let Some(versions) = &entry.versions else {
        return Compatibility::compatible();
    };
    if versions.is_empty() {
        return Compatibility {
            package_match: true,
            version_match: false,
            reason: Some("No compatible versions listed".to_string()),
        };
    }
    if target
        .package_version
        .as_ref()
        .is_some_and(|v| versions.contains(v))
    {
        return Compatibility::compatible();
    }

    let listed: Vec<&str> = versions.iter().map(String::as_str).collect();
    Compatibility {
        package_match: true,
        version_match: false,
        reason: Some(format!("Compatible versions: {}", listed.join(", "))),
    }
}

fn package_list_reason(packages: &[CompatiblePackage]) -> String {
    let names: Vec<String> = packages
        .iter()
        .map(|p| match &p.versions {
            Some(versions) if !versions.is_empty() => {
                let listed: Vec<&str> = versions.iter().map(String::as_str).collect();
                format!("{} ({})", p.package_name, listed.join(", "))
            }
            _ => p.package_name.clone(),
        })
        .collect();
    format!("Compatible packages: {}", names.join(", "))
}

/// Describe every named patch in `bundles`, optionally against the target
/// read from `target_artifact`.
pub fn describe_bundles<E: PatchEngine>(
    engine: &E,
    bundles: &[PathBuf],
    target_artifact: Option<&Path>,
) -> Result<MetadataReport, PatchError> {
    if bundles.is_empty() {
        return Err(PatchError::invalid(
            "At least one patch bundle must be provided",
        ));
    }

    let catalog = engine.load_patches(bundles)?;

    let mut bundle_summaries: Vec<BundleMetadata> = catalog
        .sources()
        .iter()
        .map(|source| BundleMetadata {
            name: source.name.clone(),
            patch_count: source
                .patches
                .iter()
                .filter(|id| catalog.get(**id).is_some_and(|p| p.name.is_some()))
                .count(),
        })
        .collect();
    bundle_summaries.sort_by_key(|b| b.name.to_lowercase());

    let target = target_artifact.and_then(|artifact| resolve_target(engine, artifact));

    let mut patches: Vec<PatchMetadata> = group_variants(&catalog)
        .into_iter()
        .filter_map(|(name, variants)| {
            let selection = resolve_variant(&catalog, &variants, target.as_ref())?;
            let patch = catalog.get(selection.id)?;
            let compatibility = evaluate_compatibility(patch, target.as_ref());

            let mut bundle_names = selection.bundle_names;
            bundle_names.sort();

            let mut compatible_packages = patch.compatible_packages.clone().unwrap_or_default();
            compatible_packages.sort_by(|a, b| a.package_name.cmp(&b.package_name));

            let mut options = patch.options.clone();
            options.sort_by(|a, b| a.key.cmp(&b.key));

            Some(PatchMetadata {
                name,
                description: patch.description.clone(),
                default_selected: patch.use_by_default,
                bundle_names,
                kind: patch.kind,
                dependencies: catalog.dependency_names(selection.id),
                compatible_packages,
                options,
                is_compatible: compatibility.package_match,
                is_version_compatible: compatibility.version_match,
                incompatibility_reason: compatibility.reason,
            })
        })
        .collect();
    patches.sort_by_key(|p| p.name.to_lowercase());

    tracing::debug!(
        bundles = bundle_summaries.len(),
        patches = patches.len(),
        "described patch bundles"
    );

    Ok(MetadataReport {
        bundles: bundle_summaries,
        patches,
        target_package: target,
    })
}

/// Read the target's identity from a throwaway copy of the artifact.
/// Any failure yields `None`.
fn resolve_target<E: PatchEngine>(engine: &E, artifact: &Path) -> Option<TargetPackage> {
    let workspace = tempfile::Builder::new()
        .prefix("metadata-artifact-")
        .tempdir()
        .ok()?;
    let file_name = artifact.file_name()?;
    let copy = workspace.path().join(file_name);
    let scratch = workspace.path().join("patcher-temp");

    let resolved = fs::copy(artifact, &copy)
        .map_err(EngineError::from)
        .and_then(|_| engine.open(&copy, &scratch))
        .map(|session| session.target().clone());

    match resolved {
        Ok(target) => Some(target),
        Err(e) => {
            tracing::debug!(artifact = %artifact.display(), error = %e, "could not read target package");
            None
        }
    }
}
