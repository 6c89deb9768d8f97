//! Layer planner.
//!
//! The planner never reorders anything. It takes a static stage list,
//! checks the ordering rules below and, only if all of them hold, wraps the
//! list in a [`ValidatedPlan`], the one type the executor accepts.
//!
//! 1. The plan is non-empty and stage names are unique.
//! 2. A toolchain purge only removes packages an earlier toolchain install
//!    opened and nothing purged since.
//! 3. Every toolchain package is purged before the privilege drop.
//! 4. Exactly one identity creation and one privilege drop, in that order,
//!    naming the same user.
//! 5. Only metadata ops follow the drop.
//! 6. Runtime installs never include a toolchain package.
//! 7. In-image paths never contain `..`; the working directory is absolute.

use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::path::{Component, Path};

use crate::component::{
    copy_tree, create_identity, create_venv, dir, drop_privileges, env, expose, install_packages,
    install_toolchain, purge_toolchain, workdir, Op, Phase, Stage,
};
use crate::error::{ProvisionError, Result};
use crate::manifest::Package;
use crate::pipeline::config::Recipe;
use crate::privilege::Identity;
use crate::resolver::Resolution;

/// A stage list that passed validation, with its layer keys.
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    stages: Vec<Stage>,
    layer_keys: Vec<String>,
    identity: Identity,
}

impl ValidatedPlan {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn layer_keys(&self) -> &[String] {
        &self.layer_keys
    }

    /// Identity the plan creates and drops to.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Key of the last stage; identifies the whole plan.
    pub fn final_key(&self) -> &str {
        self.layer_keys.last().map(String::as_str).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Stage, &str)> {
        self.stages
            .iter()
            .zip(self.layer_keys.iter().map(String::as_str))
    }
}

/// Build the canonical stage list for a recipe and its resolution.
pub fn stages_for(recipe: &Recipe, resolution: &Resolution) -> Vec<Stage> {
    let mut stages = vec![
        Stage::new("app-dir", Phase::Base, dir(&recipe.app_dir)),
        Stage::new("venv", Phase::Base, create_venv(&recipe.venv_dir)),
        Stage::new(
            "env-pythonunbuffered",
            Phase::Environment,
            env("PYTHONUNBUFFERED", "1"),
        ),
        Stage::new(
            "env-path",
            Phase::Environment,
            env("PATH", format!("{}/bin:$PATH", recipe.venv_dir)),
        ),
    ];
    for (key, value) in &recipe.env {
        stages.push(Stage::new(
            format!("env-extra-{}", key),
            Phase::Environment,
            env(key, value),
        ));
    }

    if !resolution.toolchain.is_empty() {
        stages.push(Stage::new(
            "toolchain",
            Phase::Toolchain,
            install_toolchain(resolution.toolchain.iter().cloned()),
        ));
    }
    if !resolution.install.is_empty() {
        stages.push(Stage::new(
            "packages",
            Phase::Packages,
            install_packages(resolution.install.iter().cloned()),
        ));
    }
    if !resolution.toolchain.is_empty() {
        stages.push(Stage::new(
            "purge-toolchain",
            Phase::Purge,
            purge_toolchain(resolution.toolchain.iter().cloned()),
        ));
    }

    if let Some(source) = &recipe.application_source {
        stages.push(Stage::new(
            "app-source",
            Phase::Application,
            copy_tree(source, &recipe.app_dir),
        ));
    }
    stages.push(Stage::new("workdir", Phase::Application, workdir(&recipe.app_dir)));
    stages.push(Stage::new(
        "identity",
        Phase::Identity,
        create_identity(recipe.identity.clone()),
    ));
    for port in &recipe.expose {
        stages.push(Stage::new(format!("expose-{}", port), Phase::Final, expose(*port)));
    }
    stages.push(Stage::new(
        "drop-privileges",
        Phase::Final,
        drop_privileges(recipe.identity.name()),
    ));
    stages
}

/// Canonical stages for `recipe`, validated.
pub fn plan(recipe: &Recipe, resolution: &Resolution) -> Result<ValidatedPlan> {
    validate(stages_for(recipe, resolution))
}

/// Check every ordering rule. Nothing is executed here.
pub fn validate(stages: Vec<Stage>) -> Result<ValidatedPlan> {
    if stages.is_empty() {
        return Err(invalid("plan has no stages"));
    }

    let mut names = HashSet::new();
    for stage in &stages {
        if !names.insert(stage.name.as_str()) {
            return Err(invalid(format!("duplicate stage name '{}'", stage.name)));
        }
    }

    let toolchain_packages: BTreeSet<&Package> = stages
        .iter()
        .filter_map(|stage| match &stage.op {
            Op::InstallToolchain { packages } => Some(packages.iter()),
            _ => None,
        })
        .flatten()
        .collect();

    let mut open: BTreeSet<&Package> = BTreeSet::new();
    let mut created: Option<&Identity> = None;
    let mut dropped = false;

    for stage in &stages {
        if dropped && stage.op.is_privileged() {
            return Err(invalid(format!(
                "stage '{}' ({}) runs after the privilege drop",
                stage.name,
                stage.op.label()
            )));
        }

        check_paths(stage)?;

        match &stage.op {
            Op::InstallToolchain { packages } => {
                for pkg in packages {
                    if !open.insert(pkg) {
                        return Err(invalid(format!(
                            "stage '{}' installs toolchain package '{}' that is already installed",
                            stage.name, pkg
                        )));
                    }
                }
            }
            Op::PurgeToolchain { packages } => {
                for pkg in packages {
                    if !open.remove(pkg) {
                        return Err(invalid(format!(
                            "stage '{}' purges '{}' before any stage installed it",
                            stage.name, pkg
                        )));
                    }
                }
            }
            Op::InstallPackages { packages } => {
                if let Some(pkg) = packages.iter().find(|p| toolchain_packages.contains(p)) {
                    return Err(invalid(format!(
                        "stage '{}' installs toolchain package '{}' as a runtime package",
                        stage.name, pkg
                    )));
                }
            }
            Op::CreateIdentity { identity } => {
                if created.is_some() {
                    return Err(invalid(format!(
                        "stage '{}' creates a second identity",
                        stage.name
                    )));
                }
                created = Some(identity);
            }
            Op::DropPrivileges { user } => {
                // A second drop is caught by the is_privileged check above.
                let Some(identity) = created else {
                    return Err(invalid(format!(
                        "stage '{}' drops privileges before the identity is created",
                        stage.name
                    )));
                };
                if identity.name() != user {
                    return Err(invalid(format!(
                        "stage '{}' drops to '{}' but the plan creates '{}'",
                        stage.name,
                        user,
                        identity.name()
                    )));
                }
                if !open.is_empty() {
                    return Err(invalid(format!(
                        "stage '{}' drops privileges while toolchain packages are still installed: {}",
                        stage.name,
                        join(&open)
                    )));
                }
                dropped = true;
            }
            _ => {}
        }
    }

    if !open.is_empty() {
        return Err(invalid(format!(
            "toolchain packages are never purged: {}",
            join(&open)
        )));
    }
    let Some(identity) = created.cloned() else {
        return Err(invalid("plan never creates the runtime identity"));
    };
    if !dropped {
        return Err(invalid("plan never drops privileges"));
    }

    let layer_keys =
        layer_keys(&stages).map_err(|err| invalid(format!("hashing stages: {:#}", err)))?;
    Ok(ValidatedPlan {
        stages,
        layer_keys,
        identity,
    })
}

/// Chained stage keys: `key[i] = sha256(key[i-1] || json(stage[i]))`, with
/// `key[-1]` the hash of the empty string.
pub fn layer_keys(stages: &[Stage]) -> anyhow::Result<Vec<String>> {
    let mut previous = format!("{:x}", Sha256::digest(b""));
    let mut keys = Vec::with_capacity(stages.len());
    for stage in stages {
        let mut hasher = Sha256::new();
        hasher.update(previous.as_bytes());
        hasher.update(serde_json::to_vec(stage)?);
        previous = format!("{:x}", hasher.finalize());
        keys.push(previous.clone());
    }
    Ok(keys)
}

fn check_paths(stage: &Stage) -> Result<()> {
    let paths: Vec<&str> = match &stage.op {
        Op::Dir { path } | Op::CreateVenv { path } | Op::WriteFile { path, .. } => {
            vec![path.as_str()]
        }
        Op::CopyTree {
            source,
            destination,
        } => vec![source.as_str(), destination.as_str()],
        Op::Workdir { path } => {
            if !path.starts_with('/') {
                return Err(invalid(format!(
                    "stage '{}' sets a relative working directory '{}'",
                    stage.name, path
                )));
            }
            vec![path.as_str()]
        }
        _ => Vec::new(),
    };
    for path in paths {
        if Path::new(path)
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(invalid(format!(
                "stage '{}' uses a path containing '..': {}",
                stage.name, path
            )));
        }
    }
    Ok(())
}

fn join(packages: &BTreeSet<&Package>) -> String {
    packages
        .iter()
        .map(|p| p.key())
        .collect::<Vec<_>>()
        .join(", ")
}

fn invalid(message: impl Into<String>) -> ProvisionError {
    ProvisionError::InvalidPlan(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{BuildFlags, Manifest};
    use crate::resolver::resolve;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn sys(name: &str) -> Package {
        Package::system(name).unwrap()
    }

    fn py(req: &str) -> Package {
        Package::python(req).unwrap()
    }

    fn app() -> Identity {
        Identity::new("app", 1000, 1000).unwrap()
    }

    fn recipe() -> Recipe {
        Recipe {
            path: PathBuf::from("/work/provision.toml"),
            name: "web".into(),
            base_rootfs: None,
            app_dir: "/app".into(),
            venv_dir: "/opt/venv".into(),
            expose: vec![8000],
            keep_runs: 3,
            env: BTreeMap::new(),
            application_source: Some("src".to_string()),
            manifest: Manifest::new(
                vec![sys("libpq5"), py("django>=4.2")],
                vec![sys("gcc"), sys("libpq-dev")],
                vec![py("pytest")],
            ),
            identity: app(),
            dev_default: false,
            stage_timeout: Duration::from_secs(900),
        }
    }

    fn canonical(dev: bool) -> Vec<Stage> {
        let recipe = recipe();
        let resolution = resolve(&recipe.manifest, BuildFlags { dev }).unwrap();
        stages_for(&recipe, &resolution)
    }

    /// Minimal valid plan used as a base for rule tests.
    fn minimal() -> Vec<Stage> {
        vec![
            Stage::new("toolchain", Phase::Toolchain, install_toolchain(vec![sys("gcc")])),
            Stage::new("packages", Phase::Packages, install_packages(vec![sys("libpq5")])),
            Stage::new("purge", Phase::Purge, purge_toolchain(vec![sys("gcc")])),
            Stage::new("identity", Phase::Identity, create_identity(app())),
            Stage::new("drop", Phase::Final, drop_privileges("app")),
        ]
    }

    fn names(stages: &[Stage]) -> Vec<&str> {
        stages.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_canonical_order() {
        let stages = canonical(false);
        assert_eq!(
            names(&stages),
            vec![
                "app-dir",
                "venv",
                "env-pythonunbuffered",
                "env-path",
                "toolchain",
                "packages",
                "purge-toolchain",
                "app-source",
                "workdir",
                "identity",
                "expose-8000",
                "drop-privileges",
            ]
        );
        assert_eq!(
            stages[7].op,
            copy_tree("src", "/app"),
            "application source is recorded relative to the recipe"
        );
        assert!(validate(stages).is_ok());
    }

    #[test]
    fn test_canonical_plan_is_passed_through_unchanged() {
        let stages = canonical(true);
        let plan = validate(stages.clone()).unwrap();
        assert_eq!(plan.stages(), stages.as_slice());
        assert_eq!(plan.layer_keys().len(), stages.len());
        assert_eq!(plan.identity(), &app());
    }

    #[test]
    fn test_env_keys_differing_in_case_get_distinct_stages() {
        let mut recipe = recipe();
        recipe.env = BTreeMap::from([
            ("Foo".to_string(), "a".to_string()),
            ("FOO".to_string(), "b".to_string()),
        ]);
        let resolution = resolve(&recipe.manifest, BuildFlags::default()).unwrap();
        let stages = stages_for(&recipe, &resolution);
        assert!(names(&stages).contains(&"env-extra-Foo"));
        assert!(names(&stages).contains(&"env-extra-FOO"));
        assert!(validate(stages).is_ok());
    }

    #[test]
    fn test_keys_ignore_recipe_location() {
        let resolution = resolve(&recipe().manifest, BuildFlags::default()).unwrap();
        let mut relative = recipe();
        relative.path = PathBuf::from("provision.toml");
        let mut moved = recipe();
        moved.path = PathBuf::from("/elsewhere/checkout/provision.toml");

        let a = plan(&relative, &resolution).unwrap();
        let b = plan(&moved, &resolution).unwrap();
        assert_eq!(a.final_key(), b.final_key());
    }

    #[test]
    fn test_no_toolchain_means_no_purge_stage() {
        let mut recipe = recipe();
        recipe.manifest = Manifest::new(vec![py("flask")], vec![], vec![]);
        let resolution = resolve(&recipe.manifest, BuildFlags::default()).unwrap();
        let stages = stages_for(&recipe, &resolution);
        assert!(!names(&stages).contains(&"toolchain"));
        assert!(!names(&stages).contains(&"purge-toolchain"));
        assert!(validate(stages).is_ok());
    }

    #[test]
    fn test_rejects_empty_plan() {
        assert!(matches!(
            validate(vec![]).unwrap_err(),
            ProvisionError::InvalidPlan(_)
        ));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let mut stages = minimal();
        stages.insert(0, Stage::new("drop", Phase::Base, dir("/app")));
        assert!(validate(stages).is_err());
    }

    #[test]
    fn test_rejects_purge_before_install() {
        let mut stages = minimal();
        stages.swap(0, 2);
        let err = validate(stages).unwrap_err();
        assert!(err.to_string().contains("before any stage installed it"));
    }

    #[test]
    fn test_rejects_purge_after_drop() {
        let mut stages = minimal();
        let purge = stages.remove(2);
        stages.push(purge);
        let err = validate(stages).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidPlan(_)));
    }

    #[test]
    fn test_rejects_unpurged_toolchain() {
        let mut stages = minimal();
        stages.remove(2);
        let err = validate(stages).unwrap_err();
        assert!(err.to_string().contains("system:gcc"));
    }

    #[test]
    fn test_rejects_partial_purge() {
        let mut stages = minimal();
        stages[0] = Stage::new(
            "toolchain",
            Phase::Toolchain,
            install_toolchain(vec![sys("gcc"), sys("make")]),
        );
        assert!(validate(stages).is_err());
    }

    #[test]
    fn test_rejects_missing_identity_or_drop() {
        let mut no_identity = minimal();
        no_identity.remove(3);
        assert!(validate(no_identity).is_err());

        let mut no_drop = minimal();
        no_drop.pop();
        let err = validate(no_drop).unwrap_err();
        assert!(err.to_string().contains("never drops"));
    }

    #[test]
    fn test_rejects_drop_to_other_user() {
        let mut stages = minimal();
        stages[4] = Stage::new("drop", Phase::Final, drop_privileges("nobody"));
        assert!(validate(stages).is_err());
    }

    #[test]
    fn test_rejects_privileged_stage_after_drop() {
        let mut stages = minimal();
        stages.push(Stage::new("late-dir", Phase::Final, dir("/data")));
        let err = validate(stages).unwrap_err();
        assert!(err.to_string().contains("after the privilege drop"));
    }

    #[test]
    fn test_allows_metadata_after_drop() {
        let mut stages = minimal();
        stages.push(Stage::new("late-env", Phase::Final, env("A", "b")));
        stages.push(Stage::new("late-port", Phase::Final, expose(9000)));
        assert!(validate(stages).is_ok());
    }

    #[test]
    fn test_rejects_second_drop() {
        let mut stages = minimal();
        stages.push(Stage::new("drop-again", Phase::Final, drop_privileges("app")));
        assert!(validate(stages).is_err());
    }

    #[test]
    fn test_rejects_toolchain_package_as_runtime_package() {
        let mut stages = minimal();
        stages[1] = Stage::new("packages", Phase::Packages, install_packages(vec![sys("gcc")]));
        let err = validate(stages).unwrap_err();
        assert!(err.to_string().contains("as a runtime package"));
    }

    #[test]
    fn test_rejects_parent_dir_paths() {
        let mut stages = minimal();
        stages.insert(0, Stage::new("escape", Phase::Base, dir("/app/../../etc")));
        assert!(validate(stages).is_err());

        let mut stages = minimal();
        stages.push(Stage::new("wd", Phase::Final, workdir("app")));
        assert!(validate(stages).is_err());
    }

    #[test]
    fn test_layer_keys_are_stable_and_chained() {
        let a = layer_keys(&canonical(false)).unwrap();
        let b = layer_keys(&canonical(false)).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|k| k.len() == 64));

        // Changing the package stage changes its key and every later key,
        // but not the keys before it.
        let c = layer_keys(&canonical(true)).unwrap();
        let packages = canonical(false)
            .iter()
            .position(|s| s.name == "packages")
            .unwrap();
        assert_eq!(&a[..packages], &c[..packages]);
        assert!(a[packages..].iter().zip(&c[packages..]).all(|(x, y)| x != y));
    }
}
