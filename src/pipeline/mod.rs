//! End-to-end build: recipe → resolution → validated plan → executed rootfs
//! → audit → published run.
//!
//! A run is published only after every stage succeeded and the audit came
//! back clean. Any earlier exit drops the [`PartialRun`] guard, which
//! deletes the staged rootfs and everything written next to it.

pub mod config;
mod paths;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::{create_tar_zst, sha256_file, IMAGE_CONFIG, ROOTFS_ARCHIVE};
use crate::error::{ProvisionError, Result};
use crate::executor::files::copy_dir_recursive;
use crate::executor::Executor;
use crate::manifest::BuildFlags;
use crate::planner::{self, ValidatedPlan};
use crate::preflight;
use crate::resolver::{self, LedgerBackend, PackageBackend, Resolution, SystemBackend};
use crate::stage_runs::{
    lock_output, now_utc_compact, prune_old_runs, sweep_stale_partials, write_run_manifest,
    ArtifactRecord, PartialRun, RunManifest, RUN_MANIFEST_SCHEMA, STATUS_SUCCESS,
};
use crate::verify::{self, AuditReport};

pub use config::{load_recipe, Recipe};

/// Which package backend executes package stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Staged rootfs under the run directory, packages recorded in the ledger.
    #[default]
    Ledger,
    /// apt/pip against the live root.
    System,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Ledger => write!(f, "ledger"),
            BackendKind::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub recipe: PathBuf,
    pub output: PathBuf,
    /// `--dev` / `--no-dev`; `None` defers to `DEV` and the recipe.
    pub dev: Option<bool>,
    pub backend: BackendKind,
    /// Overrides `build.stage_timeout_secs`.
    pub stage_timeout: Option<Duration>,
}

/// A resolved, validated plan that has not run yet.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub recipe: Recipe,
    pub resolution: Resolution,
    pub plan: ValidatedPlan,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub run_dir: PathBuf,
    pub manifest: RunManifest,
    pub audit: AuditReport,
}

/// Load, resolve and validate. Nothing touches the filesystem beyond
/// reading the recipe and its requirement files.
pub fn prepare(recipe_path: &Path, dev: Option<bool>) -> Result<Prepared> {
    let recipe = load_recipe(recipe_path)?;
    let env_dev = std::env::var("DEV").ok();
    let flags = BuildFlags::resolve(dev, env_dev.as_deref(), recipe.dev_default);
    let resolution = resolver::resolve(&recipe.manifest, flags)?;
    let plan = planner::plan(&recipe, &resolution)?;
    tracing::info!(
        image = %recipe.name,
        dev = flags.dev,
        stages = plan.stages().len(),
        plan_key = %plan.final_key(),
        "plan validated"
    );
    Ok(Prepared {
        recipe,
        resolution,
        plan,
    })
}

/// Build with the backend named in the request.
pub fn build(request: &BuildRequest) -> Result<BuildOutcome> {
    match request.backend {
        BackendKind::Ledger => build_with(request, |root| Ok(LedgerBackend::new(root))),
        BackendKind::System => {
            preflight::check_system_backend().map_err(|err| step("preflight", err))?;
            build_with(request, SystemBackend::new)
        }
    }
}

/// Build with a caller-supplied backend, created for the rootfs it will
/// operate on.
pub fn build_with<B, F>(request: &BuildRequest, make_backend: F) -> Result<BuildOutcome>
where
    B: PackageBackend,
    F: FnOnce(&Path) -> anyhow::Result<B>,
{
    let created_at_utc = now_utc_compact().map_err(|err| step("timestamp", err))?;
    let prepared = prepare(&request.recipe, request.dev)?;
    let Prepared {
        recipe,
        resolution,
        plan,
    } = prepared;
    let stage_budget = request.stage_timeout.unwrap_or(recipe.stage_timeout);

    let _lock =
        lock_output(&request.output).map_err(|err| ProvisionError::Locked(format!("{:#}", err)))?;
    sweep_stale_partials(&request.output).map_err(|err| step("sweep", err))?;
    let run = PartialRun::allocate(&request.output).map_err(|err| step("allocate-run", err))?;
    tracing::info!(run_id = run.run_id(), backend = %request.backend, "build started");

    let staged = request.backend == BackendKind::Ledger;
    let rootfs = if staged {
        let rootfs = run.path().join("rootfs");
        seed_rootfs(recipe.base_rootfs.as_deref(), &rootfs)
            .map_err(|err| step("seed-rootfs", err))?;
        rootfs
    } else {
        PathBuf::from("/")
    };

    let backend = make_backend(&rootfs).map_err(|err| step("backend", err))?;
    let backend_name = backend.name().to_string();
    let context = recipe
        .path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let build_args = BTreeMap::from([("DEV".to_string(), resolution.flags.dev.to_string())]);

    let report = Executor::new(&rootfs, context, backend, stage_budget)
        .with_build_args(build_args)
        .run(&plan)?;

    let audit = verify::audit(&rootfs, &resolution, plan.identity())
        .map_err(|err| step("audit", err))?;
    audit.ensure_clean()?;

    let mut artifacts = Vec::new();
    if staged {
        let archive = run.path().join(ROOTFS_ARCHIVE);
        create_tar_zst(&rootfs, &archive).map_err(|err| step("archive", err))?;
        fs::remove_dir_all(&rootfs)?;
        artifacts.push(record(&archive, ROOTFS_ARCHIVE)?);
    }
    let config_path = run.path().join(IMAGE_CONFIG);
    report
        .config
        .write(&config_path)
        .map_err(|err| step("image-config", err))?;
    artifacts.push(record(&config_path, IMAGE_CONFIG)?);

    let manifest = RunManifest {
        schema: RUN_MANIFEST_SCHEMA,
        run_id: run.run_id().to_string(),
        image: recipe.name.clone(),
        status: STATUS_SUCCESS.to_string(),
        created_at_utc,
        finished_at_utc: Some(now_utc_compact().map_err(|err| step("timestamp", err))?),
        dev: resolution.flags.dev,
        backend: backend_name,
        identity: plan.identity().clone(),
        plan_key: plan.final_key().to_string(),
        stages: report.stages,
        packages: audit.installed.clone(),
        package_digest: audit.digest.clone(),
        artifacts,
    };
    write_run_manifest(run.path(), &manifest).map_err(|err| step("run-manifest", err))?;

    let run_dir = run.commit().map_err(|err| step("publish", err))?;
    tracing::info!(
        run_id = %manifest.run_id,
        digest = %manifest.package_digest,
        path = %run_dir.display(),
        "run published"
    );

    match prune_old_runs(&request.output, recipe.keep_runs) {
        Ok(pruned) if !pruned.is_empty() => {
            tracing::info!(count = pruned.len(), "pruned old runs");
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %format!("{:#}", err), "pruning old runs failed"),
    }

    Ok(BuildOutcome {
        run_dir,
        manifest,
        audit,
    })
}

/// Start the staged rootfs empty or as a copy of the base rootfs.
fn seed_rootfs(base: Option<&Path>, rootfs: &Path) -> anyhow::Result<()> {
    match base {
        Some(base) => {
            if !base.is_dir() {
                anyhow::bail!("base rootfs not found: {}", base.display());
            }
            tracing::info!(base = %base.display(), "seeding rootfs");
            copy_dir_recursive(base, rootfs)
        }
        None => {
            fs::create_dir_all(rootfs)?;
            Ok(())
        }
    }
}

fn record(path: &Path, file: &str) -> Result<ArtifactRecord> {
    let (sha256, size) = sha256_file(path).map_err(|err| step("checksum", err))?;
    Ok(ArtifactRecord {
        file: file.to_string(),
        sha256,
        size,
    })
}

fn step(name: &str, err: anyhow::Error) -> ProvisionError {
    ProvisionError::stage(name, err)
}
