use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

/// Resolve a recipe-relative path. Absolute paths and `..` are rejected so a
/// recipe can only reference files next to it.
pub(crate) fn resolve_recipe_path(recipe_dir: &Path, path: &str, field: &str) -> Result<PathBuf> {
    Ok(recipe_dir.join(normalize_recipe_relative(path, field)?))
}

/// Canonical spelling of a recipe-relative path: `.` components dropped,
/// `/` separators. `./src/` and `src` both become `src`.
pub(crate) fn normalize_recipe_relative(path: &str, field: &str) -> Result<String> {
    let candidate = Path::new(path.trim());
    if candidate.as_os_str().is_empty() {
        bail!("{} must not be empty", field);
    }
    let mut parts = Vec::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => bail!("{} must not contain '..': {}", field, path),
            Component::RootDir | Component::Prefix(_) => {
                bail!("{} must be relative to the recipe: {}", field, path)
            }
        }
    }
    if parts.is_empty() {
        return Ok(".".to_string());
    }
    Ok(parts.join("/"))
}

/// In-image directories must be absolute and free of `..`.
pub(crate) fn validate_image_dir(path: &str, field: &str) -> Result<()> {
    let candidate = Path::new(path);
    if !candidate.is_absolute() {
        bail!("{} must be an absolute in-image path: {}", field, path);
    }
    if candidate.components().any(|c| c == Component::ParentDir) {
        bail!("{} must not contain '..': {}", field, path);
    }
    if candidate == Path::new("/") {
        bail!("{} must not be the image root", field);
    }
    Ok(())
}
