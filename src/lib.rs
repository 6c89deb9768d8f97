//! Declarative, layered provisioning of runtime images.
//!
//! A recipe names a package manifest (runtime, build-only and dev-only sets),
//! an application directory and a runtime identity. The pipeline turns it
//! into an ordered, validated stage list and executes it against a rootfs:
//!
//! - **Manifest** - package sets parsed from the recipe and requirement files
//! - **Resolver** - DEV-aware resolution, package backends, toolchain scope
//! - **Planner** - canonical stage order, ordering rules, layer cache keys
//! - **Executor** - runs a [`planner::ValidatedPlan`] and nothing else
//! - **Privilege** - runtime identity and the one-way privilege downgrade
//! - **Verify** - audits the finished rootfs before anything is published
//!
//! # Architecture
//!
//! ```text
//! provision.toml ──► pipeline::config ──► manifest::Manifest
//!                                              │
//!                            resolver::resolve ▼
//!                                        Resolution
//!                                              │
//!                              planner::plan   ▼
//!                                      ValidatedPlan ──► executor::Executor
//!                                                              │
//!                                              verify::audit   ▼
//!                                        <output>/<run_id>/{rootfs.tar.zst,
//!                                          image-config.json, run-manifest.json}
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use image_provisioner::pipeline::{build, BackendKind, BuildRequest};
//!
//! let outcome = build(&BuildRequest {
//!     recipe: "provision.toml".into(),
//!     output: "out".into(),
//!     dev: None,
//!     backend: BackendKind::Ledger,
//!     stage_timeout: None,
//! })?;
//! println!("published {}", outcome.run_dir.display());
//! ```

pub mod artifact;
pub mod component;
pub mod error;
pub mod executor;
pub mod manifest;
pub mod pipeline;
pub mod planner;
pub mod preflight;
pub mod privilege;
pub mod process;
pub mod resolver;
pub mod stage_runs;
pub mod verify;

pub use component::{Op, Phase, Stage};
pub use error::{ProvisionError, Result};
pub use manifest::{BuildFlags, Manifest, Package};
pub use planner::ValidatedPlan;
pub use privilege::Identity;
