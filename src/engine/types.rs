//! Data exposed by the patch engine about loaded patches and the target.
//!
//! The engine owns patch definitions. This crate only observes them through
//! a [`PatchCatalog`], an arena keyed by [`PatchId`], so dependency graphs
//! (including cyclic ones) can be walked without shared ownership.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a patch inside one [`PatchCatalog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatchId(pub usize);

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Package name and version read from the target artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetPackage {
    pub package_name: String,
    pub package_version: Option<String>,
}

impl TargetPackage {
    pub fn new(package_name: impl Into<String>, package_version: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            package_version: Some(package_version.into()),
        }
    }
}

/// One entry of a compatibility constraint.
///
/// `versions: None` accepts every version of the package; an empty set
/// accepts none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatiblePackage {
    pub package_name: String,
    pub versions: Option<BTreeSet<String>>,
}

impl CompatiblePackage {
    pub fn any_version(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            versions: None,
        }
    }

    pub fn versions<I, S>(package_name: impl Into<String>, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            package_name: package_name.into(),
            versions: Some(versions.into_iter().map(Into::into).collect()),
        }
    }
}

/// Structural category of a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchKind {
    #[default]
    Bytecode,
    Resource,
    RawResource,
}

/// Declared value type of a patch option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionType {
    String,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    StringList,
    BooleanList,
    IntList,
    LongList,
    FloatList,
    DoubleList,
    #[default]
    Unknown,
}

/// An option a patch declares, with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOption {
    pub key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "type", default)]
    pub value_type: OptionType,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub allowed_values: Option<BTreeMap<String, Value>>,
}

impl PatchOption {
    pub fn new(key: impl Into<String>, value_type: OptionType) -> Self {
        Self {
            key: key.into(),
            title: None,
            description: None,
            required: false,
            value_type,
            default_value: None,
            allowed_values: None,
        }
    }
}

/// A loaded patch as observed through the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Patch {
    /// Unnamed patches are never selected directly nor reported.
    pub name: Option<String>,
    pub description: Option<String>,
    pub use_by_default: bool,
    pub dependencies: Vec<PatchId>,
    /// `None` means compatible with everything.
    pub compatible_packages: Option<Vec<CompatiblePackage>>,
    pub options: Vec<PatchOption>,
    pub kind: PatchKind,
}

impl Patch {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Name for log lines and error messages.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    pub fn declares_option(&self, key: &str) -> bool {
        self.options.iter().any(|o| o.key == key)
    }

    pub fn compatibility_entry(&self, package_name: &str) -> Option<&CompatiblePackage> {
        self.compatible_packages
            .as_ref()?
            .iter()
            .find(|entry| entry.package_name == package_name)
    }
}

/// Patch ids declared by one uploaded source, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSource {
    pub name: String,
    pub patches: Vec<PatchId>,
}

/// Everything the engine loaded from a set of sources.
#[derive(Debug, Clone, Default)]
pub struct PatchCatalog {
    patches: Vec<Patch>,
    sources: Vec<PatchSource>,
}

impl PatchCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_patch(&mut self, patch: Patch) -> PatchId {
        self.patches.push(patch);
        PatchId(self.patches.len() - 1)
    }

    pub fn patch_mut(&mut self, id: PatchId) -> Option<&mut Patch> {
        self.patches.get_mut(id.0)
    }

    /// Record that `name` declares `patches`. The same id may be declared
    /// by several sources.
    pub fn add_source(&mut self, name: impl Into<String>, patches: Vec<PatchId>) {
        self.sources.push(PatchSource {
            name: name.into(),
            patches,
        });
    }

    pub fn get(&self, id: PatchId) -> Option<&Patch> {
        self.patches.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PatchId, &Patch)> {
        self.patches.iter().enumerate().map(|(i, p)| (PatchId(i), p))
    }

    pub fn sources(&self) -> &[PatchSource] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Names of the named dependencies of `id`, sorted.
    pub fn dependency_names(&self, id: PatchId) -> Vec<String> {
        let mut names: Vec<String> = self
            .get(id)
            .map(|p| p.dependencies.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|dep| self.get(*dep)?.name.clone())
            .collect();
        names.sort();
        names
    }
}

/// A patch chosen for execution together with the caller's option values
/// for the keys it declares.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedPatch {
    pub id: PatchId,
    pub name: Option<String>,
    pub options: BTreeMap<String, Value>,
}

/// One completion reported by the engine while executing.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchCompletion {
    pub id: PatchId,
    pub name: Option<String>,
    pub failure: Option<String>,
}

impl PatchCompletion {
    pub fn succeeded(id: PatchId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            failure: None,
        }
    }

    pub fn failed(id: PatchId, name: Option<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            name,
            failure: Some(message.into()),
        }
    }
}

/// Final engine result, valid once every completion was consumed without failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedOutput {
    /// Names of the patches the engine applied, in execution order.
    pub applied: Vec<String>,
    /// Directory holding the engine's intermediate files.
    pub work_dir: PathBuf,
}

/// Keystore used when signing the output artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreDetails {
    pub path: PathBuf,
    pub password: Option<String>,
}
