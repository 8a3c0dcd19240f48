//! Deterministic in-process engine for tests and the `demo` command.
//!
//! Bundles are JSON manifests ([`BundleManifest`]). The target identity is
//! fixed at construction, completions are reported in a configurable order
//! and failures can be injected per patch name. The artifact tools copy
//! bytes and never sign anything cryptographically.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};

use super::{
    ArtifactTools, CompatiblePackage, EngineSession, KeystoreDetails, Patch, PatchCatalog,
    PatchCompletion, PatchEngine, PatchId, PatchKind, PatchOption, PatchedOutput, SelectedPatch,
    TargetPackage,
};
use crate::error::EngineError;

const RESULT_FILE: &str = "patched.json";

/// Contents of one bundle file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleManifest {
    pub patches: Vec<ManifestPatch>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "use")]
    pub use_by_default: bool,
    /// Names of patches in the same bundle, or in a bundle loaded earlier.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub compatible_packages: Option<Vec<CompatiblePackage>>,
    #[serde(default)]
    pub options: Vec<PatchOption>,
    #[serde(default)]
    pub kind: PatchKind,
}

impl ManifestPatch {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    fn to_patch(&self) -> Patch {
        Patch {
            name: self.name.clone(),
            description: self.description.clone(),
            use_by_default: self.use_by_default,
            dependencies: Vec::new(),
            compatible_packages: self.compatible_packages.clone(),
            options: self.options.clone(),
            kind: self.kind,
        }
    }
}

/// Write `manifest` as `dir/file_name` and return its path.
pub fn write_bundle(
    dir: &Path,
    file_name: &str,
    manifest: &BundleManifest,
) -> std::io::Result<PathBuf> {
    let path = dir.join(file_name);
    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(&path, json)?;
    Ok(path)
}

/// Order in which a session reports completions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CompletionOrder {
    /// The order patches were submitted in.
    #[default]
    Submission,
    Reverse,
    /// Listed names first, in this order, then the rest in submission order.
    Explicit(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    target: TargetPackage,
    order: CompletionOrder,
    failures: HashMap<String, String>,
}

impl ScriptedEngine {
    pub fn new(target: TargetPackage) -> Self {
        Self {
            target,
            order: CompletionOrder::default(),
            failures: HashMap::new(),
        }
    }

    pub fn with_order(mut self, order: CompletionOrder) -> Self {
        self.order = order;
        self
    }

    /// Make the named patch report `message` as its failure.
    pub fn fail_patch(mut self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(name.into(), message.into());
        self
    }
}

impl PatchEngine for ScriptedEngine {
    type Session = ScriptedSession;

    fn load_patches(&self, sources: &[PathBuf]) -> Result<PatchCatalog, EngineError> {
        let mut catalog = PatchCatalog::new();
        // Identical definitions across bundles resolve to one patch.
        let mut definitions: HashMap<String, PatchId> = HashMap::new();
        let mut loaded_names: HashMap<String, PatchId> = HashMap::new();

        for source in sources {
            let source_name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| source.display().to_string());
            let text = fs::read_to_string(source)
                .map_err(|e| EngineError::Load(format!("{source_name}: {e}")))?;
            let manifest: BundleManifest = serde_json::from_str(&text)
                .map_err(|e| EngineError::Load(format!("{source_name}: {e}")))?;

            let mut declared = Vec::with_capacity(manifest.patches.len());
            let mut local_names: HashMap<String, PatchId> = HashMap::new();
            let mut unresolved = Vec::new();

            for entry in &manifest.patches {
                let key = serde_json::to_string(entry)
                    .map_err(|e| EngineError::Load(format!("{source_name}: {e}")))?;
                let id = match definitions.get(&key) {
                    Some(id) => *id,
                    None => {
                        let id = catalog.add_patch(entry.to_patch());
                        definitions.insert(key, id);
                        unresolved.push((id, entry.dependencies.clone()));
                        id
                    }
                };
                if let Some(name) = &entry.name {
                    local_names.entry(name.clone()).or_insert(id);
                }
                declared.push(id);
            }

            for (id, dependency_names) in unresolved {
                let mut dependencies = Vec::with_capacity(dependency_names.len());
                for dep in dependency_names {
                    let resolved = local_names
                        .get(&dep)
                        .or_else(|| loaded_names.get(&dep))
                        .copied()
                        .ok_or_else(|| {
                            EngineError::Load(format!("{source_name}: unknown dependency \"{dep}\""))
                        })?;
                    dependencies.push(resolved);
                }
                if let Some(patch) = catalog.patch_mut(id) {
                    patch.dependencies = dependencies;
                }
            }

            for (name, id) in local_names {
                loaded_names.entry(name).or_insert(id);
            }
            catalog.add_source(source_name, declared);
        }

        Ok(catalog)
    }

    fn open(&self, target: &Path, work_dir: &Path) -> Result<ScriptedSession, EngineError> {
        if !target.is_file() {
            return Err(EngineError::Session(format!(
                "{} is not a readable artifact",
                target.display()
            )));
        }
        fs::create_dir_all(work_dir)?;
        Ok(ScriptedSession {
            target: self.target.clone(),
            order: self.order.clone(),
            failures: self.failures.clone(),
            work_dir: work_dir.to_path_buf(),
            submitted: Vec::new(),
            applied: Vec::new(),
            executed: false,
            failed: false,
        })
    }
}

pub struct ScriptedSession {
    target: TargetPackage,
    order: CompletionOrder,
    failures: HashMap<String, String>,
    work_dir: PathBuf,
    submitted: Vec<SelectedPatch>,
    applied: Vec<String>,
    executed: bool,
    failed: bool,
}

impl ScriptedSession {
    fn completion_order(&self) -> Vec<SelectedPatch> {
        match &self.order {
            CompletionOrder::Submission => self.submitted.clone(),
            CompletionOrder::Reverse => self.submitted.iter().rev().cloned().collect(),
            CompletionOrder::Explicit(names) => {
                let mut ordered: Vec<SelectedPatch> = names
                    .iter()
                    .filter_map(|n| {
                        self.submitted
                            .iter()
                            .find(|p| p.name.as_deref() == Some(n.as_str()))
                            .cloned()
                    })
                    .collect();
                for patch in &self.submitted {
                    if !ordered.iter().any(|p| p.id == patch.id) {
                        ordered.push(patch.clone());
                    }
                }
                ordered
            }
        }
    }
}

impl EngineSession for ScriptedSession {
    fn target(&self) -> &TargetPackage {
        &self.target
    }

    fn submit(&mut self, patches: Vec<SelectedPatch>) {
        self.submitted.extend(patches);
    }

    fn execute(&mut self) -> BoxStream<'_, PatchCompletion> {
        let mut completions = Vec::with_capacity(self.submitted.len());
        for patch in self.completion_order() {
            let failure = patch.name.as_ref().and_then(|n| self.failures.get(n));
            if let Some(message) = failure {
                completions.push(PatchCompletion::failed(patch.id, patch.name.clone(), message));
                self.failed = true;
                break;
            }
            if let Some(name) = &patch.name {
                self.applied.push(name.clone());
            }
            completions.push(PatchCompletion::succeeded(patch.id, patch.name));
        }
        self.executed = true;
        stream::iter(completions).boxed()
    }

    fn finish(self) -> Result<PatchedOutput, EngineError> {
        if !self.executed {
            return Err(EngineError::Execution("patches were never executed".into()));
        }
        if self.failed {
            return Err(EngineError::Execution("a patch reported a failure".into()));
        }

        let options: serde_json::Map<String, serde_json::Value> = self
            .submitted
            .iter()
            .filter(|p| !p.options.is_empty())
            .filter_map(|p| Some((p.name.clone()?, serde_json::to_value(&p.options).ok()?)))
            .collect();
        let record = serde_json::json!({ "applied": self.applied, "options": options });
        fs::write(self.work_dir.join(RESULT_FILE), record.to_string())?;

        Ok(PatchedOutput {
            applied: self.applied,
            work_dir: self.work_dir,
        })
    }
}

/// Byte-copying artifact tools.
#[derive(Debug, Clone, Default)]
pub struct ScriptedArtifacts {
    reject_signing: bool,
}

impl ScriptedArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tools whose `sign` always fails.
    pub fn rejecting_signatures() -> Self {
        Self {
            reject_signing: true,
        }
    }
}

impl ArtifactTools for ScriptedArtifacts {
    fn apply(&self, output: &PatchedOutput, target: &Path) -> Result<(), EngineError> {
        let result = output.work_dir.join(RESULT_FILE);
        if !result.is_file() {
            return Err(EngineError::Apply(format!(
                "missing engine result at {}",
                result.display()
            )));
        }
        let mut bytes = fs::read(target)?;
        bytes.extend_from_slice(format!("\n# patched: {}\n", output.applied.join(", ")).as_bytes());
        fs::write(target, bytes)?;
        Ok(())
    }

    fn sign(
        &self,
        input: &Path,
        output: &Path,
        signer: &str,
        keystore: &KeystoreDetails,
    ) -> Result<(), EngineError> {
        if self.reject_signing {
            return Err(EngineError::Signing(format!(
                "keystore {} rejected signer {signer}",
                keystore.path.display()
            )));
        }
        if !keystore.path.exists() {
            fs::write(&keystore.path, format!("signer={signer}\n"))?;
        }
        fs::copy(input, output)?;
        Ok(())
    }
}
