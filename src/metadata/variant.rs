//! Picks one canonical definition when several bundles declare the same
//! patch name.

use crate::engine::{Patch, PatchCatalog, PatchId, TargetPackage};

/// One declaration of a patch name, as found in one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub id: PatchId,
    pub bundle: String,
}

/// The winning variant and every bundle that declares that exact patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantSelection {
    pub id: PatchId,
    pub bundle_names: Vec<String>,
}

/// All variants of named patches grouped by name, in first-seen order.
pub fn group_variants(catalog: &PatchCatalog) -> Vec<(String, Vec<Variant>)> {
    let mut groups: Vec<(String, Vec<Variant>)> = Vec::new();
    for source in catalog.sources() {
        for id in &source.patches {
            let Some(name) = catalog.get(*id).and_then(|p| p.name.clone()) else {
                continue;
            };
            let variant = Variant {
                id: *id,
                bundle: source.name.clone(),
            };
            match groups.iter_mut().find(|(n, _)| *n == name) {
                Some((_, variants)) => variants.push(variant),
                None => groups.push((name, vec![variant])),
            }
        }
    }
    groups
}

/// Choose the canonical variant, first match wins:
/// strict package+version match, package match, unconstrained, first seen.
///
/// Returns `None` only for an empty slice.
pub fn resolve_variant(
    catalog: &PatchCatalog,
    variants: &[Variant],
    target: Option<&TargetPackage>,
) -> Option<VariantSelection> {
    let patch_of = |v: &Variant| catalog.get(v.id);

    let strict = target.and_then(|t| {
        variants
            .iter()
            .find(|v| patch_of(*v).is_some_and(|p| matches_target_strict(p, t)))
    });
    let by_package = || {
        target.and_then(|t| {
            variants.iter().find(|v| {
                patch_of(*v).is_some_and(|p| p.compatibility_entry(&t.package_name).is_some())
            })
        })
    };
    let universal = || {
        variants
            .iter()
            .find(|v| patch_of(*v).is_some_and(|p| p.compatible_packages.is_none()))
    };

    let winner = strict
        .or_else(by_package)
        .or_else(universal)
        .or_else(|| variants.first())?;

    let mut bundle_names: Vec<String> = Vec::new();
    for variant in variants.iter().filter(|v| v.id == winner.id) {
        if !bundle_names.contains(&variant.bundle) {
            bundle_names.push(variant.bundle.clone());
        }
    }

    Some(VariantSelection {
        id: winner.id,
        bundle_names,
    })
}

/// The patch names the target's package and version. An entry without a
/// version list matches only when the target's version is known.
fn matches_target_strict(patch: &Patch, target: &TargetPackage) -> bool {
    let Some(entry) = patch.compatibility_entry(&target.package_name) else {
        return false;
    };
    let Some(version) = &target.package_version else {
        return false;
    };
    match &entry.versions {
        None => true,
        Some(versions) => versions.contains(version),
    }
}
