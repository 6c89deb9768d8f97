//! Scoped build-only toolchain.
//!
//! "Install build tools, compile, delete build tools" as a guard: the scope
//! owns the backend for the whole build, remembers which toolchain packages
//! are still installed and purges them when dropped, whatever the exit path.

use anyhow::{bail, Result};
use std::collections::BTreeSet;
use std::time::Duration;

use super::backend::PackageBackend;
use crate::manifest::Package;

pub struct ToolchainScope<B: PackageBackend> {
    backend: B,
    open: BTreeSet<Package>,
    teardown_budget: Duration,
}

impl<B: PackageBackend> ToolchainScope<B> {
    pub fn new(backend: B, teardown_budget: Duration) -> Self {
        Self {
            backend,
            open: BTreeSet::new(),
            teardown_budget,
        }
    }

    /// Install toolchain packages and track them until released.
    ///
    /// Packages are tracked before the install starts: an install that dies
    /// halfway may have left some of them behind.
    pub fn acquire(&mut self, packages: &[Package], budget: Duration) -> Result<()> {
        self.open.extend(packages.iter().cloned());
        self.backend.install(packages, budget)?;
        tracing::info!(
            backend = self.backend.name(),
            packages = packages.len(),
            "build toolchain acquired"
        );
        Ok(())
    }

    /// Remove toolchain packages previously acquired through this scope.
    pub fn release(&mut self, packages: &[Package], budget: Duration) -> Result<()> {
        let unknown: Vec<String> = packages
            .iter()
            .filter(|pkg| !self.open.contains(*pkg))
            .map(Package::key)
            .collect();
        if !unknown.is_empty() {
            bail!(
                "cannot release toolchain packages that were never acquired: {}",
                unknown.join(", ")
            );
        }

        self.backend.remove(packages, budget)?;
        for pkg in packages {
            self.open.remove(pkg);
        }
        tracing::info!(
            backend = self.backend.name(),
            packages = packages.len(),
            "build toolchain released"
        );
        Ok(())
    }

    /// Toolchain packages still installed.
    pub fn open_packages(&self) -> impl Iterator<Item = &Package> {
        self.open.iter()
    }

    pub fn is_clear(&self) -> bool {
        self.open.is_empty()
    }

    /// Backend for non-toolchain work done while the scope is alive.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: PackageBackend> Drop for ToolchainScope<B> {
    fn drop(&mut self) {
        if self.open.is_empty() {
            return;
        }
        let leftover: Vec<Package> = std::mem::take(&mut self.open).into_iter().collect();
        tracing::warn!(
            packages = %leftover.iter().map(Package::key).collect::<Vec<_>>().join(", "),
            "tearing down build toolchain on abnormal exit"
        );
        if let Err(err) = self.backend.purge(&leftover, self.teardown_budget) {
            tracing::error!(error = %format!("{:#}", err), "build toolchain teardown failed");
        }
    }
}
