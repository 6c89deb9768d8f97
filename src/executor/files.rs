//! File operation handlers: Op::WriteFile, Op::CopyTree

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path};

use crate::process::rootfs_path;

/// Handle Op::WriteFile: write a file, optionally with specific permissions
pub fn handle_writefile(rootfs: &Path, path: &str, content: &str, mode: Option<u32>) -> Result<()> {
    let full_path = rootfs_path(rootfs, path);
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&full_path, content)
        .with_context(|| format!("writing '{}'", full_path.display()))?;
    if let Some(mode) = mode {
        fs::set_permissions(&full_path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// Handle Op::CopyTree: copy a build-context directory into the rootfs
///
/// `source` is relative to `context`, `destination` an in-image path.
/// Existing files at the destination are overwritten.
pub fn handle_copytree(context: &Path, rootfs: &Path, source: &str, destination: &str) -> Result<()> {
    let relative = Path::new(source);
    if relative.is_absolute() || relative.components().any(|c| c == Component::ParentDir) {
        bail!("copy source must stay inside the build context: {}", source);
    }
    let src = context.join(relative);
    if !src.is_dir() {
        bail!("directory not found: {}", src.display());
    }

    let dst = rootfs_path(rootfs, destination);
    copy_dir_recursive(&src, &dst)
        .with_context(|| format!("copying '{}' -> '{}'", src.display(), dst.display()))
}

/// Recursively copy a directory tree, keeping symlinks as symlinks.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.symlink_metadata().is_ok() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(target, &dst_path)?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_dirs() -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let rootfs = temp.path().join("rootfs");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&rootfs).unwrap();
        (temp, source, rootfs)
    }

    #[test]
    fn test_handle_writefile_creates_content() {
        let (_temp, _source, rootfs) = temp_dirs();

        handle_writefile(&rootfs, "/etc/test-config.conf", "test-content\nline two\n", None)
            .unwrap();

        let written = fs::read_to_string(rootfs.join("etc/test-config.conf")).unwrap();
        assert_eq!(written, "test-content\nline two\n");
    }

    #[test]
    fn test_handle_writefile_sets_permissions() {
        let (_temp, _source, rootfs) = temp_dirs();

        handle_writefile(&rootfs, "secret.txt", "secret content", Some(0o600)).unwrap();

        let metadata = fs::metadata(rootfs.join("secret.txt")).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_handle_copytree_copies_directory() {
        let (_temp, source, rootfs) = temp_dirs();

        fs::create_dir_all(source.join("pkg")).unwrap();
        fs::write(source.join("manage.py"), "print('hi')\n").unwrap();
        fs::write(source.join("pkg/__init__.py"), "").unwrap();
        std::os::unix::fs::symlink("manage.py", source.join("entry.py")).unwrap();

        handle_copytree(source.parent().unwrap(), &rootfs, "source", "/app").unwrap();

        assert_eq!(
            fs::read_to_string(rootfs.join("app/manage.py")).unwrap(),
            "print('hi')\n"
        );
        assert!(rootfs.join("app/pkg/__init__.py").is_file());
        assert!(rootfs.join("app/entry.py").is_symlink());
    }

    #[test]
    fn test_handle_copytree_missing_source() {
        let (temp, _source, rootfs) = temp_dirs();

        let result = handle_copytree(temp.path(), &rootfs, "nope", "/app");
        assert!(result.is_err(), "Should fail for missing directory");
    }

    #[test]
    fn test_handle_copytree_rejects_escaping_source() {
        let (temp, source, rootfs) = temp_dirs();
        assert!(handle_copytree(temp.path(), &rootfs, "../source", "/app").is_err());
        assert!(handle_copytree(temp.path(), &rootfs, source.to_str().unwrap(), "/app").is_err());
    }
}
