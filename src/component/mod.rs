//! Declarative stage definitions.
//!
//! Stages describe WHAT needs to happen to the image, not HOW. The
//! [`crate::planner`] validates an ordered list of them and the
//! [`crate::executor`] interprets each [`Op`] against the target rootfs.
//!
//! # Example
//!
//! ```rust
//! use image_provisioner::component::{dir, env, Phase, Stage};
//!
//! let stages = vec![
//!     Stage::new("app-dir", Phase::Base, dir("app")),
//!     Stage::new("unbuffered", Phase::Environment, env("PYTHONUNBUFFERED", "1")),
//! ];
//! assert!(stages[0].phase < stages[1].phase);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::manifest::Package;
use crate::privilege::Identity;

/// Build phases, in the order stages are expected to appear.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Phase {
    /// Directory skeleton and virtual environment.
    Base = 1,
    /// Runtime environment variables.
    Environment = 2,
    /// Temporary build-only toolchain.
    Toolchain = 3,
    /// Runtime (and optionally dev) packages.
    Packages = 4,
    /// Toolchain removal.
    Purge = 5,
    /// Application payload and working directory.
    Application = 6,
    /// Runtime identity creation.
    Identity = 7,
    /// Annotations and the privilege drop.
    Final = 8,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Base => write!(f, "Base"),
            Phase::Environment => write!(f, "Environment"),
            Phase::Toolchain => write!(f, "Toolchain"),
            Phase::Packages => write!(f, "Packages"),
            Phase::Purge => write!(f, "Purge"),
            Phase::Application => write!(f, "Application"),
            Phase::Identity => write!(f, "Identity"),
            Phase::Final => write!(f, "Final"),
        }
    }
}

/// Provisioning operations.
///
/// Paths are relative to the target rootfs unless noted otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    // ─────────────────────────────────────────────────────────────────────
    // Filesystem operations
    // ─────────────────────────────────────────────────────────────────────
    /// Create a directory (uses create_dir_all).
    Dir { path: String },

    /// Write a file with given content and optional mode.
    WriteFile {
        path: String,
        content: String,
        mode: Option<u32>,
    },

    /// Copy a build-context directory (relative to the recipe) into the rootfs.
    CopyTree { source: String, destination: String },

    /// Create the Python virtual environment.
    CreateVenv { path: String },

    // ─────────────────────────────────────────────────────────────────────
    // Package operations
    // ─────────────────────────────────────────────────────────────────────
    /// Install build-only packages; opens the toolchain scope.
    InstallToolchain { packages: Vec<Package> },

    /// Install runtime packages.
    InstallPackages { packages: Vec<Package> },

    /// Remove build-only packages; closes (part of) the toolchain scope.
    PurgeToolchain { packages: Vec<Package> },

    // ─────────────────────────────────────────────────────────────────────
    // Identity operations
    // ─────────────────────────────────────────────────────────────────────
    /// Create the non-root runtime identity.
    CreateIdentity { identity: Identity },

    /// Switch every later stage to the named identity. One-way.
    DropPrivileges { user: String },

    // ─────────────────────────────────────────────────────────────────────
    // Image metadata (no filesystem effect)
    // ─────────────────────────────────────────────────────────────────────
    /// Runtime environment variable. `$NAME` references in the value are
    /// kept verbatim for the runtime to expand.
    Env { key: String, value: String },

    /// Exposed port annotation.
    Expose { port: u16 },

    /// Runtime working directory (absolute, in-image path).
    Workdir { path: String },
}

impl Op {
    /// Whether this op needs the administrative identity.
    ///
    /// Metadata ops are the only ones allowed once privileges are dropped.
    pub fn is_privileged(&self) -> bool {
        !matches!(
            self,
            Op::Env { .. } | Op::Expose { .. } | Op::Workdir { .. }
        )
    }

    /// Short operation label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Op::Dir { .. } => "dir",
            Op::WriteFile { .. } => "write_file",
            Op::CopyTree { .. } => "copy_tree",
            Op::CreateVenv { .. } => "create_venv",
            Op::InstallToolchain { .. } => "install_toolchain",
            Op::InstallPackages { .. } => "install_packages",
            Op::PurgeToolchain { .. } => "purge_toolchain",
            Op::CreateIdentity { .. } => "create_identity",
            Op::DropPrivileges { .. } => "drop_privileges",
            Op::Env { .. } => "env",
            Op::Expose { .. } => "expose",
            Op::Workdir { .. } => "workdir",
        }
    }
}

/// One atomic provisioning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub phase: Phase,
    pub op: Op,
}

impl Stage {
    pub fn new(name: impl Into<String>, phase: Phase, op: Op) -> Self {
        Self {
            name: name.into(),
            phase,
            op,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.phase, self.name, self.op.label())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper functions for readable stage definitions
// ─────────────────────────────────────────────────────────────────────────────

/// Create a directory.
pub fn dir(path: impl Into<String>) -> Op {
    Op::Dir { path: path.into() }
}

/// Write a file.
pub fn write_file(path: impl Into<String>, content: impl Into<String>) -> Op {
    Op::WriteFile {
        path: path.into(),
        content: content.into(),
        mode: None,
    }
}

/// Write a file with permissions.
pub fn write_file_mode(path: impl Into<String>, content: impl Into<String>, mode: u32) -> Op {
    Op::WriteFile {
        path: path.into(),
        content: content.into(),
        mode: Some(mode),
    }
}

/// Copy a build-context tree into the rootfs.
pub fn copy_tree(source: impl Into<String>, destination: impl Into<String>) -> Op {
    Op::CopyTree {
        source: source.into(),
        destination: destination.into(),
    }
}

/// Create a virtual environment.
pub fn create_venv(path: impl Into<String>) -> Op {
    Op::CreateVenv { path: path.into() }
}

/// Install the build-only toolchain.
pub fn install_toolchain(packages: impl IntoIterator<Item = Package>) -> Op {
    Op::InstallToolchain {
        packages: packages.into_iter().collect(),
    }
}

/// Install runtime packages.
pub fn install_packages(packages: impl IntoIterator<Item = Package>) -> Op {
    Op::InstallPackages {
        packages: packages.into_iter().collect(),
    }
}

/// Purge the build-only toolchain.
pub fn purge_toolchain(packages: impl IntoIterator<Item = Package>) -> Op {
    Op::PurgeToolchain {
        packages: packages.into_iter().collect(),
    }
}

/// Create the runtime identity.
pub fn create_identity(identity: Identity) -> Op {
    Op::CreateIdentity { identity }
}

/// Drop to the runtime identity.
pub fn drop_privileges(user: impl Into<String>) -> Op {
    Op::DropPrivileges { user: user.into() }
}

/// Runtime environment variable.
pub fn env(key: impl Into<String>, value: impl Into<String>) -> Op {
    Op::Env {
        key: key.into(),
        value: value.into(),
    }
}

/// Exposed port annotation.
pub fn expose(port: u16) -> Op {
    Op::Expose { port }
}

/// Runtime working directory.
pub fn workdir(path: impl Into<String>) -> Op {
    Op::Workdir { path: path.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::Base < Phase::Environment);
        assert!(Phase::Toolchain < Phase::Packages);
        assert!(Phase::Packages < Phase::Purge);
        assert!(Phase::Purge < Phase::Identity);
        assert!(Phase::Identity < Phase::Final);
    }

    #[test]
    fn test_op_helpers() {
        assert_eq!(dir("app"), Op::Dir { path: "app".into() });
        assert_eq!(
            write_file_mode("etc/motd", "hi", 0o644),
            Op::WriteFile {
                path: "etc/motd".into(),
                content: "hi".into(),
                mode: Some(0o644)
            }
        );
        assert_eq!(expose(8000), Op::Expose { port: 8000 });
    }

    #[test]
    fn test_only_metadata_ops_are_unprivileged() {
        assert!(!env("A", "b").is_privileged());
        assert!(!expose(8000).is_privileged());
        assert!(!workdir("/app").is_privileged());
        assert!(dir("app").is_privileged());
        assert!(install_packages(vec![]).is_privileged());
        assert!(drop_privileges("app").is_privileged());
    }

    #[test]
    fn test_stage_serializes_with_op_tag() {
        let stage = Stage::new("port", Phase::Final, expose(8000));
        let json = serde_json::to_string(&stage).unwrap();
        assert_eq!(
            json,
            r#"{"name":"port","phase":"Final","op":{"op":"expose","port":8000}}"#
        );
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Base.to_string(), "Base");
        assert_eq!(Phase::Toolchain.to_string(), "Toolchain");
        assert_eq!(Phase::Final.to_string(), "Final");
    }
}
