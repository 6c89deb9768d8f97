//! Directory operation handler: Op::Dir

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::process::rootfs_path;

/// Handle Op::Dir: create a directory inside the rootfs
pub fn handle_dir(rootfs: &Path, path: &str) -> Result<()> {
    let full_path = rootfs_path(rootfs, path);
    fs::create_dir_all(&full_path)
        .with_context(|| format!("creating directory '{}'", full_path.display()))?;
    Ok(())
}
