//! Image audit.
//!
//! Checks a finished rootfs against what the build promised:
//! dev-only packages absent unless DEV was set, every requested package
//! present, no build toolchain left behind, and a runtime identity that is
//! not root and cannot log in. The package digest makes "same manifest, same
//! package set" checkable across rebuilds.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use crate::error::ProvisionError;
use crate::executor::users::read_account;
use crate::manifest::Package;
use crate::privilege::Identity;
use crate::process::rootfs_path;
use crate::resolver::{PackageDb, Resolution};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    DevPackagePresent(String),
    PackageMissing(String),
    ToolchainPresent(String),
    IdentityMissing(String),
    IdentityMismatch {
        name: String,
        expected: (u32, u32),
        found: (u32, u32),
    },
    IdentityIsRoot(String),
    UsableLogin(String),
    HomeDirectoryPresent(String),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::DevPackagePresent(pkg) => {
                write!(f, "dev-only package '{}' is installed without DEV", pkg)
            }
            Violation::PackageMissing(pkg) => write!(f, "package '{}' is not installed", pkg),
            Violation::ToolchainPresent(pkg) => {
                write!(f, "build-only package '{}' was not purged", pkg)
            }
            Violation::IdentityMissing(name) => write!(f, "runtime identity '{}' does not exist", name),
            Violation::IdentityMismatch {
                name,
                expected,
                found,
            } => write!(
                f,
                "runtime identity '{}' is {}:{}, expected {}:{}",
                name, found.0, found.1, expected.0, expected.1
            ),
            Violation::IdentityIsRoot(name) => write!(f, "runtime identity '{}' is root", name),
            Violation::UsableLogin(name) => {
                write!(f, "runtime identity '{}' has a usable login", name)
            }
            Violation::HomeDirectoryPresent(path) => {
                write!(f, "runtime identity home directory '{}' exists", path)
            }
        }
    }
}

/// Result of auditing one rootfs.
#[derive(Debug, Clone)]
pub struct AuditReport {
    /// Installed package keys, sorted.
    pub installed: Vec<String>,
    /// sha256 over the installed package set.
    pub digest: String,
    pub violations: Vec<Violation>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn ensure_clean(&self) -> Result<(), ProvisionError> {
        if self.is_clean() {
            return Ok(());
        }
        let lines: Vec<String> = self
            .violations
            .iter()
            .map(|v| format!("  - {}", v))
            .collect();
        Err(ProvisionError::Audit(lines.join("\n")))
    }
}

/// Audit `rootfs` against `resolution` and the expected runtime identity.
pub fn audit(rootfs: &Path, resolution: &Resolution, identity: &Identity) -> Result<AuditReport> {
    let db = PackageDb::load(rootfs)?;
    let installed = db.packages();
    let mut violations = Vec::new();

    for pkg in &resolution.excluded {
        if installed.contains(pkg) {
            violations.push(Violation::DevPackagePresent(pkg.key()));
        }
    }
    for pkg in &resolution.install {
        if !installed.contains(pkg) {
            violations.push(Violation::PackageMissing(pkg.key()));
        }
    }
    for pkg in &resolution.toolchain {
        if installed.contains(pkg) {
            violations.push(Violation::ToolchainPresent(pkg.key()));
        }
    }

    audit_identity(rootfs, identity, &mut violations)?;

    let report = AuditReport {
        installed: installed.iter().map(Package::key).collect(),
        digest: package_digest(installed),
        violations,
    };
    tracing::debug!(
        installed = report.installed.len(),
        violations = report.violations.len(),
        digest = %report.digest,
        "rootfs audited"
    );
    Ok(report)
}

fn audit_identity(rootfs: &Path, identity: &Identity, violations: &mut Vec<Violation>) -> Result<()> {
    let name = identity.name().to_string();
    let Some(account) = read_account(rootfs, identity.name())? else {
        violations.push(Violation::IdentityMissing(name));
        return Ok(());
    };

    if account.uid == 0 || account.gid == 0 || account.name == "root" {
        violations.push(Violation::IdentityIsRoot(name.clone()));
    }
    if (account.uid, account.gid) != (identity.uid(), identity.gid()) {
        violations.push(Violation::IdentityMismatch {
            name: name.clone(),
            expected: (identity.uid(), identity.gid()),
            found: (account.uid, account.gid),
        });
    }
    if account.has_usable_password() || !account.has_nologin_shell() {
        violations.push(Violation::UsableLogin(name));
    }
    if !account.home.is_empty() && account.home != "/" && rootfs_path(rootfs, &account.home).exists() {
        violations.push(Violation::HomeDirectoryPresent(account.home.clone()));
    }
    Ok(())
}

/// sha256 over `key requirement` lines of a package set.
pub fn package_digest(packages: &BTreeSet<Package>) -> String {
    let mut hasher = Sha256::new();
    for pkg in packages {
        hasher.update(pkg.key().as_bytes());
        hasher.update(b" ");
        hasher.update(pkg.requirement.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
