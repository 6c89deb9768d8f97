//! Package backends.
//!
//! [`LedgerBackend`] only maintains the rootfs package database and a
//! virtual-environment skeleton; it is what staged builds use.
//! [`SystemBackend`] drives apt and pip for real and then records the result
//! in the same ledger. It is meant to run inside a disposable build
//! container, against the live root.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use super::ledger::PackageDb;
use crate::manifest::{Ecosystem, Package};
use crate::process::{ensure_exists, rootfs_path, run_checked};

/// Something that can install and remove packages in a rootfs.
///
/// Every call is fatal on failure; callers never retry.
pub trait PackageBackend {
    /// Name for logging and identification.
    fn name(&self) -> &'static str;

    /// Create (or upgrade) the virtual environment at an in-image path.
    fn create_venv(&mut self, venv_dir: &str, budget: Duration) -> Result<()>;

    /// Install packages. Already-installed packages are skipped.
    fn install(&mut self, packages: &[Package], budget: Duration) -> Result<()>;

    /// Remove exactly these packages.
    fn remove(&mut self, packages: &[Package], budget: Duration) -> Result<()>;

    /// Teardown removal after an install that may have stopped partway:
    /// packages that are not installed are skipped instead of failing.
    fn purge(&mut self, packages: &[Package], budget: Duration) -> Result<()> {
        self.remove(packages, budget)
    }
}

impl<B: PackageBackend + ?Sized> PackageBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn create_venv(&mut self, venv_dir: &str, budget: Duration) -> Result<()> {
        (**self).create_venv(venv_dir, budget)
    }

    fn install(&mut self, packages: &[Package], budget: Duration) -> Result<()> {
        (**self).install(packages, budget)
    }

    fn remove(&mut self, packages: &[Package], budget: Duration) -> Result<()> {
        (**self).remove(packages, budget)
    }

    fn purge(&mut self, packages: &[Package], budget: Duration) -> Result<()> {
        (**self).purge(packages, budget)
    }
}

/// Ledger-only backend for staged rootfs builds.
#[derive(Debug, Clone)]
pub struct LedgerBackend {
    root: PathBuf,
}

impl LedgerBackend {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PackageBackend for LedgerBackend {
    fn name(&self) -> &'static str {
        "ledger"
    }

    fn create_venv(&mut self, venv_dir: &str, _budget: Duration) -> Result<()> {
        let venv = rootfs_path(&self.root, venv_dir);
        fs::create_dir_all(venv.join("bin"))
            .with_context(|| format!("creating virtual environment '{}'", venv.display()))?;
        fs::create_dir_all(venv.join("lib"))?;
        fs::write(
            venv.join("pyvenv.cfg"),
            "home = /usr/bin\ninclude-system-site-packages = false\n",
        )
        .with_context(|| format!("writing '{}'", venv.join("pyvenv.cfg").display()))?;
        Ok(())
    }

    fn install(&mut self, packages: &[Package], _budget: Duration) -> Result<()> {
        let mut db = PackageDb::load(&self.root)?;
        for pkg in db.missing(packages) {
            tracing::debug!(package = %pkg, "recording install");
        }
        db.record_installed(packages);
        db.save()
    }

    fn remove(&mut self, packages: &[Package], _budget: Duration) -> Result<()> {
        let mut db = PackageDb::load(&self.root)?;
        db.record_removed(packages)?;
        db.save()
    }

    fn purge(&mut self, packages: &[Package], _budget: Duration) -> Result<()> {
        let mut db = PackageDb::load(&self.root)?;
        let present: Vec<Package> = packages
            .iter()
            .filter(|pkg| db.contains(pkg))
            .cloned()
            .collect();
        if present.is_empty() {
            return Ok(());
        }
        db.record_removed(&present)?;
        db.save()
    }
}

/// apt + pip backend operating on the live root.
#[derive(Debug)]
pub struct SystemBackend {
    ledger: LedgerBackend,
    venv_dir: Option<String>,
    apt_index_fresh: bool,
}

impl SystemBackend {
    /// Host tools the backend shells out to, as (command, package) pairs.
    pub const REQUIRED_TOOLS: &'static [(&'static str, &'static str)] = &[
        ("apt-get", "apt"),
        ("python3", "python3"),
    ];

    pub fn new(root: &Path) -> Result<Self> {
        if root != Path::new("/") {
            bail!(
                "system backend only operates on the live root '/', got '{}'",
                root.display()
            );
        }
        Ok(Self {
            ledger: LedgerBackend::new(root),
            venv_dir: None,
            apt_index_fresh: false,
        })
    }

    fn pip(&self) -> Result<PathBuf> {
        let venv_dir = self
            .venv_dir
            .as_deref()
            .context("python packages requested before the virtual environment was created")?;
        Ok(rootfs_path(self.ledger.root(), venv_dir).join("bin/pip"))
    }

    fn apt_update(&mut self, budget: Duration) -> Result<()> {
        if self.apt_index_fresh {
            return Ok(());
        }
        let mut cmd = Command::new(ensure_exists("apt-get")?);
        cmd.arg("update").env("DEBIAN_FRONTEND", "noninteractive");
        run_checked(&mut cmd, budget)?;
        self.apt_index_fresh = true;
        Ok(())
    }
}

impl PackageBackend for SystemBackend {
    fn name(&self) -> &'static str {
        "system"
    }

    fn create_venv(&mut self, venv_dir: &str, budget: Duration) -> Result<()> {
        let venv = rootfs_path(self.ledger.root(), venv_dir);
        let mut cmd = Command::new(ensure_exists("python3")?);
        cmd.arg("-m").arg("venv").arg(&venv);
        run_checked(&mut cmd, budget)?;

        self.venv_dir = Some(venv_dir.to_string());
        let mut cmd = Command::new(self.pip()?);
        cmd.args(["install", "--no-cache-dir", "--upgrade", "pip"]);
        run_checked(&mut cmd, budget)?;
        Ok(())
    }

    fn install(&mut self, packages: &[Package], budget: Duration) -> Result<()> {
        let db = PackageDb::load(self.ledger.root())?;
        let missing = db.missing(packages);
        let (system, python) = split_by_ecosystem(&missing);

        if !system.is_empty() {
            self.apt_update(budget)?;
            let mut cmd = Command::new(ensure_exists("apt-get")?);
            cmd.args(["install", "-y", "--no-install-recommends"])
                .args(system.iter().map(|p| p.requirement.as_str()))
                .env("DEBIAN_FRONTEND", "noninteractive");
            run_checked(&mut cmd, budget)?;
        }
        if !python.is_empty() {
            let mut cmd = Command::new(self.pip()?);
            cmd.args(["install", "--no-cache-dir"])
                .args(python.iter().map(|p| p.requirement.as_str()));
            run_checked(&mut cmd, budget)?;
        }

        self.ledger.install(packages, budget)
    }

    fn remove(&mut self, packages: &[Package], budget: Duration) -> Result<()> {
        let refs: Vec<&Package> = packages.iter().collect();
        let (system, python) = split_by_ecosystem(&refs);

        if !python.is_empty() {
            let mut cmd = Command::new(self.pip()?);
            cmd.args(["uninstall", "-y"])
                .args(python.iter().map(|p| p.name.as_str()));
            run_checked(&mut cmd, budget)?;
        }
        if !system.is_empty() {
            let mut cmd = Command::new(ensure_exists("apt-get")?);
            cmd.args(["purge", "-y", "--auto-remove"])
                .args(system.iter().map(|p| p.name.as_str()))
                .env("DEBIAN_FRONTEND", "noninteractive");
            run_checked(&mut cmd, budget)?;
        }

        self.ledger.remove(packages, budget)
    }

    /// apt and pip both skip packages that are not installed, so a killed
    /// install is purged with the same commands; only the ledger is filtered.
    fn purge(&mut self, packages: &[Package], budget: Duration) -> Result<()> {
        let refs: Vec<&Package> = packages.iter().collect();
        let (system, python) = split_by_ecosystem(&refs);

        if !python.is_empty() && self.venv_dir.is_some() {
            let mut cmd = Command::new(self.pip()?);
            cmd.args(["uninstall", "-y"])
                .args(python.iter().map(|p| p.name.as_str()));
            run_checked(&mut cmd, budget)?;
        }
        if !system.is_empty() {
            let mut cmd = Command::new(ensure_exists("apt-get")?);
            cmd.args(["purge", "-y", "--auto-remove"])
                .args(system.iter().map(|p| p.name.as_str()))
                .env("DEBIAN_FRONTEND", "noninteractive");
            run_checked(&mut cmd, budget)?;
        }

        self.ledger.purge(packages, budget)
    }
}

fn split_by_ecosystem<'a>(packages: &[&'a Package]) -> (Vec<&'a Package>, Vec<&'a Package>) {
    packages
        .iter()
        .copied()
        .partition(|pkg| pkg.ecosystem == Ecosystem::System)
}
