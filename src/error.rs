//! Error taxonomy for component creation.
//!
//! Every expected failure mode of a run has a typed variant here. The
//! orchestrator converts all of them into a non-throwing
//! [`CreationResult`](crate::orchestrator::CreationResult), so these types are
//! mostly seen by code that talks to a single gateway directly.

use std::path::PathBuf;
use thiserror::Error;

/// Failures detected before anything is generated or persisted.
///
/// None of these are ever retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("Invalid component name '{0}'. It should contain only A-Z, a-z, 0-9, '_' and '-'.")]
    InvalidName(String),

    #[error("Project at {} is not initialized. Run `infraheal init` first.", .0.display())]
    ProjectNotInitialized(PathBuf),

    #[error("Component '{0}' already exists. Please choose a different name.")]
    ComponentAlreadyExists(String),

    #[error("Component '{0}' not found")]
    ComponentNotFound(String),

    #[error("max_attempts must be at least 1")]
    InvalidRetryPolicy,
}

/// The code generator failed or answered with something unusable.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("code generator request failed: {0}")]
    Request(String),

    #[error("malformed generator response: missing required '{label}' section")]
    MissingSection { label: String },

    #[error("malformed generator response: {0}")]
    Malformed(String),
}

/// Writing component files failed.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("component file {} already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An invocation of the provisioning tool failed.
///
/// `output` always holds the verbatim stdout+stderr of the failing call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("terraform {operation} failed: {output}")]
    CommandFailed { operation: String, output: String },

    #[error("terraform {operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("could not run terraform {operation}: {reason}")]
    Spawn { operation: String, reason: String },

    #[error("could not parse terraform output: {0}")]
    InvalidOutput(String),
}

impl ProvisionError {
    /// The terraform subcommand that failed.
    pub fn operation(&self) -> &str {
        match self {
            ProvisionError::CommandFailed { operation, .. }
            | ProvisionError::Timeout { operation, .. }
            | ProvisionError::Spawn { operation, .. } => operation,
            ProvisionError::InvalidOutput(_) => "output",
        }
    }

    /// The text handed to the repair step: the captured diagnostics when the
    /// tool ran, the rendered error otherwise.
    pub fn diagnostic_text(&self) -> String {
        match self {
            ProvisionError::CommandFailed { output, .. } => output.clone(),
            other => other.to_string(),
        }
    }
}

/// The advisory run lock could not be taken.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("another run is already in progress for component '{component}' in {}", workdir.display())]
    Busy { component: String, workdir: PathBuf },

    #[error("failed to acquire run lock: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything that can end an orchestration run unsuccessfully.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Code generation failed: {0}")]
    Generation(#[source] GenerationError),

    #[error("Self-healing repair failed: {0}")]
    Repair(#[source] GenerationError),

    #[error("Failed to save component: {0}")]
    Store(#[from] StoreError),

    #[error("An error occurred during terraform {}: {}", .0.operation(), .0.diagnostic_text())]
    Provision(#[from] ProvisionError),

    #[error("Self-healing exhausted after {attempts} attempts. Could not fix the errors. Last error during terraform {operation}: {last_error}")]
    SelfHealingExhausted {
        attempts: u32,
        operation: String,
        last_error: String,
    },

    #[error("Run cancelled at attempt {attempt}")]
    Cancelled { attempt: u32 },
}
