//! Preflight checks for build validation.
//!
//! Validates that the host can run the selected backend before any stage
//! runs, so a missing tool fails the build up front instead of midway.
//!
//! # Example
//!
//! ```rust
//! use image_provisioner::preflight::{check_required_tools, command_exists};
//!
//! assert!(command_exists("sh"));
//!
//! let tools = &[("sh", "dash"), ("definitely_not_a_tool", "nothing")];
//! assert!(check_required_tools(tools).is_err());
//! ```

use anyhow::{bail, Result};

use crate::resolver::SystemBackend;

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// `tools` holds (command, package) pairs; the error lists every missing
/// command with the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<(&str, &str)> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .copied()
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// The system backend needs its package managers and an administrative
/// identity, since it installs into the live root.
pub fn check_system_backend() -> Result<()> {
    check_required_tools(SystemBackend::REQUIRED_TOOLS)?;
    // SAFETY: geteuid has no preconditions.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!(
            "the system backend must run as root (current euid {}); use the ledger backend for unprivileged builds",
            euid
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("fake-package"));
    }
}
