//! `provision.toml` loading.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ProvisionError;
use crate::manifest::requirements::parse_requirements_file;
use crate::manifest::{Manifest, Package};
use crate::pipeline::paths::{
    normalize_recipe_relative, resolve_recipe_path, validate_image_dir,
};
use crate::privilege::Identity;

pub const DEFAULT_RECIPE: &str = "provision.toml";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 900;
const DEFAULT_KEEP_RUNS: usize = 3;
const DEFAULT_RUNTIME_REQUIREMENTS: &str = "requirements.txt";
const DEFAULT_DEV_REQUIREMENTS: &str = "requirements-dev.txt";

/// Variables the pipeline always sets itself; a recipe may not override them.
const RESERVED_ENV: &[&str] = &["PATH", "PYTHONUNBUFFERED"];

/// A loaded, validated recipe.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub path: PathBuf,
    pub name: String,
    pub base_rootfs: Option<PathBuf>,
    pub app_dir: String,
    pub venv_dir: String,
    pub expose: Vec<u16>,
    pub keep_runs: usize,
    pub env: BTreeMap<String, String>,
    /// Directory copied into `app_dir`, relative to the recipe directory and
    /// normalized so the layer keys do not depend on how the recipe was named.
    pub application_source: Option<String>,
    pub manifest: Manifest,
    pub identity: Identity,
    /// `build.dev`, the lowest-precedence source of the DEV flag.
    pub dev_default: bool,
    pub stage_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeToml {
    image: ImageToml,
    application: Option<ApplicationToml>,
    packages: Option<PackagesToml>,
    requirements: Option<RequirementsToml>,
    identity: Option<IdentityToml>,
    build: Option<BuildToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    name: String,
    base_rootfs: Option<String>,
    app_dir: Option<String>,
    venv_dir: Option<String>,
    expose: Option<Vec<u16>>,
    keep_runs: Option<usize>,
    env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ApplicationToml {
    source: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackagesToml {
    runtime: Option<Vec<String>>,
    build_only: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequirementsToml {
    runtime: Option<String>,
    dev: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IdentityToml {
    name: String,
    uid: u32,
    gid: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    dev: Option<bool>,
    stage_timeout_secs: Option<u64>,
}

/// Load a recipe. Malformed recipes are configuration errors; unreadable or
/// malformed package lists are resolution errors.
pub fn load_recipe(path: &Path) -> Result<Recipe, ProvisionError> {
    let (parsed, recipe_dir) =
        read_recipe(path).map_err(|err| ProvisionError::Config(format!("{:#}", err)))?;
    build_recipe(path, &recipe_dir, parsed)
}

fn read_recipe(path: &Path) -> Result<(RecipeToml, PathBuf)> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading recipe '{}'", path.display()))?;
    let parsed: RecipeToml =
        toml::from_str(&text).with_context(|| format!("parsing recipe '{}'", path.display()))?;
    let recipe_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let recipe_dir = if recipe_dir.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        recipe_dir
    };
    Ok((parsed, recipe_dir))
}

fn build_recipe(
    path: &Path,
    recipe_dir: &Path,
    parsed: RecipeToml,
) -> Result<Recipe, ProvisionError> {
    let config = |err: anyhow::Error| {
        ProvisionError::Config(format!("invalid recipe '{}': {:#}", path.display(), err))
    };
    let resolution = |err: anyhow::Error| ProvisionError::Resolution(format!("{:#}", err));

    let image = parsed.image;
    let name = image.name.trim().to_string();
    if name.is_empty() {
        return Err(config(anyhow::anyhow!("image.name must not be empty")));
    }
    let app_dir = image.app_dir.unwrap_or_else(|| "/app".to_string());
    validate_image_dir(&app_dir, "image.app_dir").map_err(config)?;
    let venv_dir = image.venv_dir.unwrap_or_else(|| "/opt/venv".to_string());
    validate_image_dir(&venv_dir, "image.venv_dir").map_err(config)?;

    let mut expose = image.expose.unwrap_or_else(|| vec![DEFAULT_PORT]);
    if expose.contains(&0) {
        return Err(config(anyhow::anyhow!("image.expose must not contain port 0")));
    }
    expose.sort_unstable();
    expose.dedup();

    let env = image.env.unwrap_or_default();
    if let Some(key) = env.keys().find(|key| RESERVED_ENV.contains(&key.as_str())) {
        return Err(config(anyhow::anyhow!(
            "image.env must not set {}; the virtual environment owns it",
            key
        )));
    }

    let keep_runs = image.keep_runs.unwrap_or(DEFAULT_KEEP_RUNS);
    if keep_runs == 0 {
        return Err(config(anyhow::anyhow!("image.keep_runs must be at least 1")));
    }

    let base_rootfs = image
        .base_rootfs
        .as_deref()
        .map(|p| resolve_recipe_path(recipe_dir, p, "image.base_rootfs"))
        .transpose()
        .map_err(config)?;
    let application_source = parsed
        .application
        .map(|app| normalize_recipe_relative(&app.source, "application.source"))
        .transpose()
        .map_err(config)?;

    let identity = match parsed.identity {
        Some(id) => Identity::new(id.name.trim(), id.uid, id.gid).map_err(config)?,
        None => Identity::new("app", 1000, 1000).map_err(config)?,
    };

    let build = parsed.build.unwrap_or_default();
    let stage_timeout_secs = build
        .stage_timeout_secs
        .unwrap_or(DEFAULT_STAGE_TIMEOUT_SECS);
    if stage_timeout_secs == 0 {
        return Err(config(anyhow::anyhow!(
            "build.stage_timeout_secs must be greater than 0"
        )));
    }

    let requirements = parsed.requirements.unwrap_or_default();
    let runtime_reqs = requirement_list(
        recipe_dir,
        requirements.runtime.as_deref(),
        DEFAULT_RUNTIME_REQUIREMENTS,
        "requirements.runtime",
    )
    .map_err(config)?;
    let dev_reqs = requirement_list(
        recipe_dir,
        requirements.dev.as_deref(),
        DEFAULT_DEV_REQUIREMENTS,
        "requirements.dev",
    )
    .map_err(config)?;

    let packages = parsed.packages.unwrap_or_default();
    let mut runtime = system_packages(packages.runtime.unwrap_or_default()).map_err(resolution)?;
    let build_only = system_packages(packages.build_only.unwrap_or_default()).map_err(resolution)?;
    if let Some(path) = runtime_reqs {
        runtime.extend(parse_requirements_file(&path).map_err(resolution)?);
    }
    let dev = match dev_reqs {
        Some(path) => parse_requirements_file(&path).map_err(resolution)?,
        None => Vec::new(),
    };

    Ok(Recipe {
        path: path.to_path_buf(),
        name,
        base_rootfs,
        app_dir,
        venv_dir,
        expose,
        keep_runs,
        env,
        application_source,
        manifest: Manifest::new(runtime, build_only, dev),
        identity,
        dev_default: build.dev.unwrap_or(false),
        stage_timeout: Duration::from_secs(stage_timeout_secs),
    })
}

/// An explicitly configured requirements file must exist; the default one
/// is optional.
fn requirement_list(
    recipe_dir: &Path,
    configured: Option<&str>,
    default: &str,
    field: &str,
) -> Result<Option<PathBuf>> {
    match configured {
        Some(path) => Ok(Some(resolve_recipe_path(recipe_dir, path, field)?)),
        None => {
            let path = resolve_recipe_path(recipe_dir, default, field)?;
            Ok(path.is_file().then_some(path))
        }
    }
}

fn system_packages(names: Vec<String>) -> Result<Vec<Package>> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            bail!("empty system package name");
        }
        out.push(Package::system(trimmed)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_recipe_with_defaults() {
        let temp = TempDir::new().unwrap();
        let recipe = write(temp.path(), "provision.toml", "[image]\nname = \"web\"\n");

        let loaded = load_recipe(&recipe).unwrap();
        assert_eq!(loaded.name, "web");
        assert_eq!(loaded.app_dir, "/app");
        assert_eq!(loaded.venv_dir, "/opt/venv");
        assert_eq!(loaded.expose, vec![8000]);
        assert_eq!(loaded.keep_runs, 3);
        assert_eq!(loaded.identity.name(), "app");
        assert!(!loaded.dev_default);
        assert_eq!(loaded.stage_timeout, Duration::from_secs(900));
        assert!(loaded.manifest.runtime().is_empty());
    }

    #[test]
    fn test_load_recipe_reads_requirement_files() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "requirements.txt", "django>=4.2\npsycopg==3.1\n");
        write(temp.path(), "requirements-dev.txt", "-r requirements.txt\npytest\n");
        let recipe = write(
            temp.path(),
            "provision.toml",
            r#"
[image]
name = "web"

[packages]
runtime = ["libpq5"]
build_only = ["gcc", "libpq-dev"]

[build]
dev = true
stage_timeout_secs = 60
"#,
        );

        let loaded = load_recipe(&recipe).unwrap();
        assert_eq!(loaded.manifest.runtime().len(), 3);
        assert_eq!(loaded.manifest.build_only().len(), 2);
        assert_eq!(loaded.manifest.dev().len(), 3);
        assert!(loaded.dev_default);
        assert_eq!(loaded.stage_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_field_is_config_error() {
        let temp = TempDir::new().unwrap();
        let recipe = write(
            temp.path(),
            "provision.toml",
            "[image]\nname = \"web\"\ncolour = \"blue\"\n",
        );

        let err = load_recipe(&recipe).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }

    #[test]
    fn test_missing_configured_requirements_is_resolution_error() {
        let temp = TempDir::new().unwrap();
        let recipe = write(
            temp.path(),
            "provision.toml",
            "[image]\nname = \"web\"\n\n[requirements]\nruntime = \"reqs/prod.txt\"\n",
        );

        let err = load_recipe(&recipe).unwrap_err();
        assert!(matches!(err, ProvisionError::Resolution(_)));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let recipe = write(
            temp.path(),
            "provision.toml",
            "[image]\nname = \"web\"\n\n[application]\nsource = \"../elsewhere\"\n",
        );
        assert!(matches!(
            load_recipe(&recipe).unwrap_err(),
            ProvisionError::Config(_)
        ));
    }

    #[test]
    fn test_rejects_root_identity() {
        let temp = TempDir::new().unwrap();
        let recipe = write(
            temp.path(),
            "provision.toml",
            "[image]\nname = \"web\"\n\n[identity]\nname = \"root\"\nuid = 0\ngid = 0\n",
        );
        assert!(matches!(
            load_recipe(&recipe).unwrap_err(),
            ProvisionError::Config(_)
        ));
    }

    #[test]
    fn test_rejects_reserved_env() {
        let temp = TempDir::new().unwrap();
        for (key, value) in [("PATH", "/usr/bin"), ("PYTHONUNBUFFERED", "0")] {
            let recipe = write(
                temp.path(),
                "provision.toml",
                &format!(
                    "[image]\nname = \"web\"\n\n[image.env]\n{} = \"{}\"\n",
                    key, value
                ),
            );
            let err = load_recipe(&recipe).unwrap_err();
            assert!(matches!(err, ProvisionError::Config(_)), "{}: {:?}", key, err);
            assert!(err.to_string().contains(key));
        }
    }

    #[test]
    fn test_application_source_is_normalized() {
        let temp = TempDir::new().unwrap();
        let recipe = write(
            temp.path(),
            "provision.toml",
            "[image]\nname = \"web\"\n\n[application]\nsource = \"./src/\"\n",
        );
        let loaded = load_recipe(&recipe).unwrap();
        assert_eq!(loaded.application_source.as_deref(), Some("src"));
    }

    #[test]
    fn test_rejects_relative_app_dir() {
        let temp = TempDir::new().unwrap();
        let recipe = write(
            temp.path(),
            "provision.toml",
            "[image]\nname = \"web\"\napp_dir = \"app\"\n",
        );
        assert!(load_recipe(&recipe).is_err());
    }
}
