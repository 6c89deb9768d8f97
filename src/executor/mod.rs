//! Stage executor - interprets each [`Op`] of a [`ValidatedPlan`] against
//! the target rootfs.
//!
//! Stages run strictly in order on the calling thread, each under its own
//! wall-clock budget. The first failure ends the run; nothing is retried.
//! Dropping the executor (on any exit path) tears down an open toolchain
//! through its [`ToolchainScope`].

pub mod directories;
pub mod files;
pub mod image_config;
pub mod users;

pub use image_config::ImageConfig;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::component::{Op, Phase, Stage};
use crate::error::{ProvisionError, Result};
use crate::planner::ValidatedPlan;
use crate::privilege::{Identity, PrivilegeState};
use crate::process::BudgetExceeded;
use crate::resolver::{PackageBackend, ToolchainScope};

/// Timing and key of one finished stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub phase: Phase,
    pub op: String,
    pub layer_key: String,
    pub elapsed_ms: u64,
}

/// Everything a successful run produced besides the rootfs itself.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub config: ImageConfig,
    pub stages: Vec<StageRecord>,
}

pub struct Executor<B: PackageBackend> {
    rootfs: PathBuf,
    context: PathBuf,
    scope: ToolchainScope<B>,
    privilege: PrivilegeState,
    identities: BTreeMap<String, Identity>,
    config: ImageConfig,
    stage_budget: Duration,
}

impl<B: PackageBackend> Executor<B> {
    /// `context` is the directory `CopyTree` sources are relative to.
    pub fn new(rootfs: &Path, context: &Path, backend: B, stage_budget: Duration) -> Self {
        Self {
            rootfs: rootfs.to_path_buf(),
            context: context.to_path_buf(),
            scope: ToolchainScope::new(backend, stage_budget),
            privilege: PrivilegeState::default(),
            identities: BTreeMap::new(),
            config: ImageConfig::default(),
            stage_budget,
        }
    }

    /// Record build parameters in the image config.
    pub fn with_build_args(mut self, args: BTreeMap<String, String>) -> Self {
        self.config.build_args = args;
        self
    }

    /// Run every stage of `plan`. Consumes the executor so a failed run
    /// cannot be resumed.
    pub fn run(mut self, plan: &ValidatedPlan) -> Result<ExecutionReport> {
        let total = plan.stages().len();
        let mut records = Vec::with_capacity(total);

        for (idx, (stage, key)) in plan.iter().enumerate() {
            tracing::info!(
                stage = %stage.name,
                phase = %stage.phase,
                op = stage.op.label(),
                layer = &key[..12],
                "stage {}/{} started",
                idx + 1,
                total
            );
            let started = Instant::now();
            self.run_stage(stage)?;
            let elapsed = started.elapsed();
            if elapsed > self.stage_budget {
                return Err(ProvisionError::Timeout {
                    stage: stage.name.clone(),
                    budget: self.stage_budget,
                });
            }
            tracing::info!(
                stage = %stage.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "stage finished"
            );

            records.push(StageRecord {
                name: stage.name.clone(),
                phase: stage.phase,
                op: stage.op.label().to_string(),
                layer_key: key.to_string(),
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        if !self.scope.is_clear() {
            let open: Vec<String> = self.scope.open_packages().map(|p| p.key()).collect();
            return Err(ProvisionError::Toolchain {
                stage: "<end of plan>".to_string(),
                source: format!("toolchain still installed: {}", open.join(", ")).into(),
            });
        }

        self.config.user = self.privilege.identity().cloned();
        Ok(ExecutionReport {
            config: std::mem::take(&mut self.config),
            stages: records,
        })
    }

    fn run_stage(&mut self, stage: &Stage) -> Result<()> {
        if stage.op.is_privileged() {
            self.privilege.require_elevated(&stage.name)?;
        }

        let budget = self.stage_budget;
        let outcome = match &stage.op {
            Op::Dir { path } => directories::handle_dir(&self.rootfs, path),
            Op::WriteFile {
                path,
                content,
                mode,
            } => files::handle_writefile(&self.rootfs, path, content, *mode),
            Op::CopyTree {
                source,
                destination,
            } => files::handle_copytree(&self.context, &self.rootfs, source, destination),
            Op::CreateVenv { path } => self.scope.backend_mut().create_venv(path, budget),
            Op::InstallToolchain { packages } => self.scope.acquire(packages, budget),
            Op::InstallPackages { packages } => self.scope.backend_mut().install(packages, budget),
            Op::PurgeToolchain { packages } => self.scope.release(packages, budget),
            Op::CreateIdentity { identity } => users::create_identity(&self.rootfs, identity)
                .map(|()| {
                    self.identities
                        .insert(identity.name().to_string(), identity.clone());
                }),
            Op::DropPrivileges { user } => {
                let identity = self.identities.get(user).cloned().ok_or_else(|| {
                    ProvisionError::stage(
                        &stage.name,
                        anyhow::anyhow!("identity '{}' was not created by this build", user),
                    )
                })?;
                return self.privilege.drop_to(&stage.name, identity);
            }
            Op::Env { key, value } => self.config.set_env(key, value),
            Op::Expose { port } => {
                self.config.exposed_ports.insert(*port);
                Ok(())
            }
            Op::Workdir { path } => {
                self.config.working_dir = Some(path.clone());
                Ok(())
            }
        };

        outcome.map_err(|err| classify(stage, err, budget))
    }
}

/// Map a stage failure onto the error taxonomy.
fn classify(stage: &Stage, err: anyhow::Error, budget: Duration) -> ProvisionError {
    if err.chain().any(|cause| cause.is::<BudgetExceeded>()) {
        return ProvisionError::Timeout {
            stage: stage.name.clone(),
            budget,
        };
    }

    let name = stage.name.clone();
    match &stage.op {
        Op::InstallPackages { .. } => ProvisionError::Compilation {
            stage: name,
            source: err.into(),
        },
        Op::InstallToolchain { .. } | Op::PurgeToolchain { .. } => ProvisionError::Toolchain {
            stage: name,
            source: err.into(),
        },
        Op::CreateIdentity { identity } => ProvisionError::Identity {
            name: identity.name().to_string(),
            source: err.into(),
        },
        _ => ProvisionError::stage(&stage.name, err),
    }
}
