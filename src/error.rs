//! Error taxonomy for the provisioning pipeline.
//!
//! Every variant is fatal. The pipeline never retries a stage and never
//! publishes a partial artifact, so callers only need to know which class of
//! failure ended the build.

use std::time::Duration;

use thiserror::Error;

/// Boxed source error carried by stage failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used by the public pipeline entry points.
pub type Result<T> = std::result::Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Recipe could not be read or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A package is missing, malformed or unsatisfiable.
    #[error("manifest resolution failed: {0}")]
    Resolution(String),

    /// The stage list violates an ordering rule; nothing was executed.
    #[error("invalid stage plan: {0}")]
    InvalidPlan(String),

    /// Installing runtime packages failed (typically a native build).
    #[error("stage '{stage}' failed to install runtime packages")]
    Compilation {
        stage: String,
        #[source]
        source: BoxError,
    },

    /// Installing or purging the build-only toolchain failed.
    #[error("stage '{stage}' failed to manage the build toolchain")]
    Toolchain {
        stage: String,
        #[source]
        source: BoxError,
    },

    /// The runtime identity could not be created.
    #[error("identity creation failed for '{name}'")]
    Identity {
        name: String,
        #[source]
        source: BoxError,
    },

    /// A stage attempted to use elevated rights after the downgrade.
    #[error("stage '{stage}' requires elevated privileges after the identity downgrade")]
    PrivilegeRegression { stage: String },

    /// A stage ran past its wall-clock budget.
    #[error("stage '{stage}' exceeded its wall-clock budget of {budget:?}")]
    Timeout { stage: String, budget: Duration },

    /// Any other stage failure.
    #[error("stage '{stage}' failed")]
    Stage {
        stage: String,
        #[source]
        source: BoxError,
    },

    /// The finished rootfs violates an image invariant.
    #[error("image audit failed:\n{0}")]
    Audit(String),

    /// Another build holds the output directory lock.
    #[error("output directory is locked by another build: {0}")]
    Locked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::Config(_) | ProvisionError::Resolution(_) => 2,
            ProvisionError::InvalidPlan(_) => 3,
            ProvisionError::Compilation { .. }
            | ProvisionError::Toolchain { .. }
            | ProvisionError::Timeout { .. } => 4,
            ProvisionError::Identity { .. } | ProvisionError::PrivilegeRegression { .. } => 5,
            ProvisionError::Audit(_) => 6,
            ProvisionError::Stage { .. } | ProvisionError::Locked(_) | ProvisionError::Io(_) => 1,
        }
    }

    pub(crate) fn stage(stage: &str, err: anyhow::Error) -> Self {
        ProvisionError::Stage {
            stage: stage.to_string(),
            source: err.into(),
        }
    }
}
