//! Package resolution: turn a [`Manifest`] plus [`BuildFlags`] into the
//! exact install set and the temporary toolchain set.
//!
//! - [`backend`] - how packages actually get installed and removed
//! - [`ledger`] - the package database kept inside the target rootfs
//! - [`scope`] - scoped acquisition of the build-only toolchain

pub mod backend;
pub mod ledger;
pub mod scope;

pub use backend::{LedgerBackend, PackageBackend, SystemBackend};
pub use ledger::PackageDb;
pub use scope::ToolchainScope;

use std::collections::BTreeMap;

use crate::error::{ProvisionError, Result};
use crate::manifest::{BuildFlags, Manifest, Package};

/// Outcome of resolving a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Packages that must be present in the final image. Sorted.
    pub install: Vec<Package>,
    /// Build-only packages: installed first, purged before completion. Sorted.
    pub toolchain: Vec<Package>,
    /// Dev packages that must be absent because `DEV` is off. Sorted.
    pub excluded: Vec<Package>,
    pub flags: BuildFlags,
}

/// Resolve the manifest. Every failure here is a manifest-resolution error.
pub fn resolve(manifest: &Manifest, flags: BuildFlags) -> Result<Resolution> {
    let runtime = dedupe("runtime", manifest.runtime())?;
    let dev = dedupe("dev", manifest.dev())?;
    let toolchain = dedupe("build-only", manifest.build_only())?;

    let mut install = runtime.clone();
    let mut excluded = BTreeMap::new();
    for (name, pkg) in dev {
        match runtime.get(&name) {
            Some(existing) if !same_requirement(existing, &pkg) => {
                return Err(ProvisionError::Resolution(format!(
                    "package '{}' is pinned differently in runtime ('{}') and dev ('{}')",
                    pkg, existing.requirement, pkg.requirement
                )));
            }
            Some(_) => {}
            None if flags.dev => {
                install.insert(name, pkg);
            }
            None => {
                excluded.insert(name, pkg);
            }
        }
    }

    let conflicts: Vec<String> = toolchain
        .keys()
        .filter(|key| install.contains_key(*key))
        .cloned()
        .collect();
    if !conflicts.is_empty() {
        return Err(ProvisionError::Resolution(format!(
            "build-only packages are also required at runtime and would be purged: {}",
            conflicts.join(", ")
        )));
    }

    let resolution = Resolution {
        install: sorted(install),
        toolchain: sorted(toolchain),
        excluded: sorted(excluded),
        flags,
    };
    tracing::debug!(
        install = resolution.install.len(),
        toolchain = resolution.toolchain.len(),
        excluded = resolution.excluded.len(),
        dev = flags.dev,
        "manifest resolved"
    );
    Ok(resolution)
}

/// Requirement strings compare case- and whitespace-insensitively.
fn same_requirement(a: &Package, b: &Package) -> bool {
    let canonical = |p: &Package| -> String {
        p.requirement
            .split_whitespace()
            .collect::<String>()
            .to_ascii_lowercase()
    };
    canonical(a) == canonical(b)
}

fn sorted(packages: BTreeMap<String, Package>) -> Vec<Package> {
    let mut out: Vec<Package> = packages.into_values().collect();
    out.sort();
    out
}

/// Collapse repeated entries; a repeated name with a different requirement
/// string is unsatisfiable.
fn dedupe(group: &str, packages: &[Package]) -> Result<BTreeMap<String, Package>> {
    let mut out: BTreeMap<String, Package> = BTreeMap::new();
    for pkg in packages {
        match out.get(&pkg.key()) {
            Some(existing) if !same_requirement(existing, pkg) => {
                return Err(ProvisionError::Resolution(format!(
                    "conflicting {} requirements for '{}': '{}' vs '{}'",
                    group, pkg, existing.requirement, pkg.requirement
                )));
            }
            Some(_) => {}
            None => {
                out.insert(pkg.key(), pkg.clone());
            }
        }
    }
    Ok(out)
}
