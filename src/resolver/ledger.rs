//! Package database stored inside the target rootfs.
//!
//! The ledger is the single source of truth for "what is installed" when
//! auditing an image, whichever backend performed the installs.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::manifest::Package;

/// Ledger location relative to the rootfs.
pub const LEDGER_PATH: &str = "var/lib/image-provisioner/packages.json";

const LEDGER_SCHEMA: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LedgerFile {
    schema: u32,
    packages: Vec<Package>,
}

/// Installed package set of one rootfs.
#[derive(Debug, Clone)]
pub struct PackageDb {
    path: PathBuf,
    packages: BTreeSet<Package>,
}

impl PackageDb {
    /// Load the ledger of `rootfs`; a missing ledger is an empty one.
    pub fn load(rootfs: &Path) -> Result<Self> {
        let path = rootfs.join(LEDGER_PATH);
        if !path.exists() {
            return Ok(Self {
                path,
                packages: BTreeSet::new(),
            });
        }

        let bytes = fs::read(&path)
            .with_context(|| format!("reading package ledger '{}'", path.display()))?;
        let parsed: LedgerFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing package ledger '{}'", path.display()))?;
        if parsed.schema != LEDGER_SCHEMA {
            bail!(
                "unsupported package ledger schema {} in '{}' (expected {})",
                parsed.schema,
                path.display(),
                LEDGER_SCHEMA
            );
        }

        Ok(Self {
            path,
            packages: parsed.packages.into_iter().collect(),
        })
    }

    pub fn packages(&self) -> &BTreeSet<Package> {
        &self.packages
    }

    pub fn contains(&self, package: &Package) -> bool {
        self.packages.contains(package)
    }

    /// Packages from `wanted` that are not recorded yet.
    pub fn missing<'a>(&self, wanted: &'a [Package]) -> Vec<&'a Package> {
        wanted.iter().filter(|pkg| !self.contains(pkg)).collect()
    }

    /// Record packages as installed. Re-recording replaces the requirement.
    pub fn record_installed(&mut self, packages: &[Package]) {
        for pkg in packages {
            self.packages.replace(pkg.clone());
        }
    }

    /// Record packages as removed. Removing an unrecorded package is an error.
    pub fn record_removed(&mut self, packages: &[Package]) -> Result<()> {
        let absent: Vec<String> = packages
            .iter()
            .filter(|pkg| !self.packages.contains(*pkg))
            .map(Package::key)
            .collect();
        if !absent.is_empty() {
            bail!("cannot remove packages that are not installed: {}", absent.join(", "));
        }
        for pkg in packages {
            self.packages.remove(pkg);
        }
        Ok(())
    }

    /// Persist atomically (write temp file, then rename).
    pub fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .context("package ledger path has no parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("creating ledger directory '{}'", parent.display()))?;

        let file = LedgerFile {
            schema: LEDGER_SCHEMA,
            packages: self.packages.iter().cloned().collect(),
        };
        let mut bytes = serde_json::to_vec_pretty(&file)?;
        bytes.push(b'\n');

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .with_context(|| format!("writing package ledger '{}'", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "moving package ledger '{}' -> '{}'",
                tmp.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sys(name: &str) -> Package {
        Package::system(name).unwrap()
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let temp = TempDir::new().unwrap();
        let db = PackageDb::load(temp.path()).unwrap();
        assert!(db.packages().is_empty());
    }

    #[test]
    fn test_record_and_persist() {
        let temp = TempDir::new().unwrap();
        let mut db = PackageDb::load(temp.path()).unwrap();
        db.record_installed(&[sys("libpq5"), sys("gcc")]);
        db.record_removed(&[sys("gcc")]).unwrap();
        db.save().unwrap();

        let reloaded = PackageDb::load(temp.path()).unwrap();
        assert!(reloaded.contains(&sys("libpq5")));
        assert!(!reloaded.contains(&sys("gcc")));
        assert!(!temp.path().join(LEDGER_PATH).with_extension("json.tmp").exists());
    }

    #[test]
    fn test_remove_unrecorded_fails() {
        let temp = TempDir::new().unwrap();
        let mut db = PackageDb::load(temp.path()).unwrap();
        let err = db.record_removed(&[sys("gcc")]).unwrap_err();
        assert!(err.to_string().contains("system:gcc"));
    }

    #[test]
    fn test_missing_filters_recorded() {
        let temp = TempDir::new().unwrap();
        let mut db = PackageDb::load(temp.path()).unwrap();
        db.record_installed(&[sys("libpq5")]);
        let wanted = vec![sys("libpq5"), sys("curl")];
        let missing = db.missing(&wanted);
        assert_eq!(missing, vec![&sys("curl")]);
    }

    #[test]
    fn test_ledger_output_is_stable() {
        let temp = TempDir::new().unwrap();
        let mut db = PackageDb::load(temp.path()).unwrap();
        db.record_installed(&[sys("zlib1g"), sys("curl")]);
        db.save().unwrap();
        let first = fs::read(temp.path().join(LEDGER_PATH)).unwrap();

        let mut db = PackageDb::load(temp.path()).unwrap();
        db.record_installed(&[sys("curl")]);
        db.save().unwrap();
        let second = fs::read(temp.path().join(LEDGER_PATH)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_unknown_schema() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(LEDGER_PATH);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"schema": 9, "packages": []}"#).unwrap();
        assert!(PackageDb::load(temp.path()).is_err());
    }
}
