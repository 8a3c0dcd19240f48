//! Computes which patches a job executes.
//!
//! A patch is a root of the selection when it is compatible with the target
//! and either explicitly selected, default-selected, or given options by the
//! caller. Every root pulls in its dependencies transitively. Option values
//! are applied once the closure is complete, so dependencies reached only
//! through another patch still receive theirs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use crate::engine::{Patch, PatchCatalog, PatchId, SelectedPatch, TargetPackage};
use crate::error::SelectionError;
use crate::options::PatchOptions;

/// Inputs of one selection.
#[derive(Debug, Clone, Copy)]
pub struct SelectionRequest<'a> {
    pub target: &'a TargetPackage,
    pub options: &'a PatchOptions,
    /// `None` falls back to each patch's default-selected flag.
    pub selected: Option<&'a BTreeSet<String>>,
    pub force: bool,
}

/// Whether `patch` may run against `target`.
pub fn is_compatible(patch: &Patch, target: &TargetPackage, force: bool) -> bool {
    if force || patch.compatible_packages.is_none() {
        return true;
    }
    let Some(entry) = patch.compatibility_entry(&target.package_name) else {
        return false;
    };
    match &entry.versions {
        None => true,
        Some(versions) => target
            .package_version
            .as_ref()
            .is_some_and(|v| versions.contains(v)),
    }
}

pub fn select_patches(
    catalog: &PatchCatalog,
    request: &SelectionRequest<'_>,
) -> Result<Vec<SelectedPatch>, SelectionError> {
    let mut closure = Closure::new(catalog);

    for (id, patch) in catalog.iter() {
        let Some(name) = patch.name.as_deref() else {
            continue;
        };

        if !is_compatible(patch, request.target, request.force) {
            tracing::debug!(
                patch = name,
                package = %request.target.package_name,
                version = request.target.package_version.as_deref().unwrap_or("unknown"),
                "patch is incompatible with target"
            );
            continue;
        }

        let has_options = request.options.contains_key(name);
        let wanted = match request.selected {
            Some(selected) => selected.contains(name) || has_options,
            None => patch.use_by_default || has_options,
        };
        if wanted {
            closure.include(id)?;
        }
    }

    Ok(closure
        .order
        .into_iter()
        .filter_map(|id| {
            let patch = catalog.get(id)?;
            Some(SelectedPatch {
                id,
                name: patch.name.clone(),
                options: applicable_options(patch, request.options),
            })
        })
        .collect())
}

/// The caller's values for option keys `patch` declares.
fn applicable_options(patch: &Patch, options: &PatchOptions) -> BTreeMap<String, Value> {
    let Some(values) = patch.name.as_ref().and_then(|n| options.get(n)) else {
        return Default::default();
    };
    values
        .iter()
        .filter(|(key, _)| patch.declares_option(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Depth-first dependency walk. `stack` holds the current path so a back
/// edge (a true cycle) is told apart from reaching a finished node twice.
struct Closure<'a> {
    catalog: &'a PatchCatalog,
    visits: HashMap<PatchId, Visit>,
    stack: Vec<PatchId>,
    order: Vec<PatchId>,
}

impl<'a> Closure<'a> {
    fn new(catalog: &'a PatchCatalog) -> Self {
        Self {
            catalog,
            visits: HashMap::new(),
            stack: Vec::new(),
            order: Vec::new(),
        }
    }

    fn label(&self, id: PatchId) -> String {
        self.catalog
            .get(id)
            .map(|p| p.label().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    fn include(&mut self, id: PatchId) -> Result<(), SelectionError> {
        match self.visits.get(&id) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::InProgress) => {
                let start = self.stack.iter().position(|p| *p == id).unwrap_or(0);
                let mut path: Vec<String> =
                    self.stack[start..].iter().map(|p| self.label(*p)).collect();
                path.push(self.label(id));
                return Err(SelectionError::DependencyCycle { path });
            }
            None => {}
        }

        let catalog = self.catalog;
        let patch = catalog.get(id).ok_or_else(|| SelectionError::UnknownDependency {
            patch: self
                .stack
                .last()
                .map(|p| self.label(*p))
                .unwrap_or_else(|| id.to_string()),
        })?;

        self.visits.insert(id, Visit::InProgress);
        self.stack.push(id);
        self.order.push(id);

        for dependency in &patch.dependencies {
            self.include(*dependency)?;
        }

        self.stack.pop();
        self.visits.insert(id, Visit::Done);
        Ok(())
    }
}
