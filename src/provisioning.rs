//! Provisioning gateway over the `terraform` CLI.
//!
//! Every operation is one out-of-process call in the project workdir. A
//! non-zero exit is always a [`ProvisionError`] carrying the verbatim
//! stdout+stderr; expiry of the per-call timeout is reported the same way.

use crate::component_store::Component;
use crate::error::ProvisionError;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

// =============================================================================
// Process execution
// =============================================================================

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout followed by stderr, as a user would have seen them.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) if self.stdout.ends_with('\n') => format!("{}{}", self.stdout, self.stderr),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Why a process produced no [`CommandOutput`].
#[derive(Debug)]
pub enum RunError {
    Timeout,
    Spawn(std::io::Error),
}

/// Trait for running external programs.
///
/// This abstraction enables testing the gateway without a terraform binary.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `program` to completion in `cwd`, giving up after `timeout`.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, RunError>;

    /// Checks if a program exists in PATH.
    fn program_exists(&self, program: &str) -> bool;
}

/// Default runner backed by `tokio::process`.
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, RunError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result.map_err(RunError::Spawn)?,
            Err(_) => return Err(RunError::Timeout),
        };

        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn program_exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Result of a successful plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutput {
    pub text: String,
    /// The one-line change summary, when terraform printed one.
    pub summary: Option<String>,
}

/// Result of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutput {
    pub text: String,
}

/// One entry of `terraform output -json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
}

pub type Outputs = BTreeMap<String, OutputValue>;

static PLAN_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(Plan: \d+ to add, \d+ to change, \d+ to destroy\.|No changes\..*)$")
        .expect("static regex")
});

static DECLARED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(resource|data|module)\s+"([^"]+)"(?:\s+"([^"]+)")?"#)
        .expect("static regex")
});

/// Extracts the human-readable change summary from plan output.
pub fn summarize_plan(plan_text: &str) -> Option<String> {
    PLAN_SUMMARY
        .captures(plan_text)
        .map(|caps| caps[1].trim().to_string())
}

/// Terraform addresses of every block a component declares, for `-target`.
pub fn declared_addresses(code: &str) -> Vec<String> {
    DECLARED_BLOCK
        .captures_iter(code)
        .filter_map(|caps| {
            let kind = &caps[1];
            let first = &caps[2];
            match (kind, caps.get(3)) {
                ("resource", Some(name)) => Some(format!("{}.{}", first, name.as_str())),
                ("data", Some(name)) => Some(format!("data.{}.{}", first, name.as_str())),
                ("module", None) => Some(format!("module.{first}")),
                _ => None,
            }
        })
        .collect()
}

/// Lifecycle operations of the provisioning tool for one workdir.
///
/// The gateway is the only code that mutates live infrastructure.
pub struct ProvisioningGateway {
    runner: Arc<dyn ProcessRunner>,
    terraform_bin: String,
    workdir: PathBuf,
    timeout: Duration,
}

impl ProvisioningGateway {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        terraform_bin: impl Into<String>,
        workdir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            terraform_bin: terraform_bin.into(),
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Runs one terraform subcommand, mapping every failure to a
    /// [`ProvisionError`] tagged with `operation`.
    async fn invoke(&self, operation: &str, args: Vec<String>) -> Result<CommandOutput, ProvisionError> {
        debug!("Running {} {}", self.terraform_bin, args.join(" "));

        let output = self
            .runner
            .run(&self.terraform_bin, &args, &self.workdir, self.timeout)
            .await
            .map_err(|e| match e {
                RunError::Timeout => ProvisionError::Timeout {
                    operation: operation.to_string(),
                    seconds: self.timeout.as_secs(),
                },
                RunError::Spawn(err) => ProvisionError::Spawn {
                    operation: operation.to_string(),
                    reason: err.to_string(),
                },
            })?;

        if output.success {
            Ok(output)
        } else {
            error!("terraform {} exited with {:?}", operation, output.exit_code);
            Err(ProvisionError::CommandFailed {
                operation: operation.to_string(),
                output: output.combined(),
            })
        }
    }

    /// Initializes provider plugins and backend state. Safe to repeat.
    pub async fn init(&self, verbose: bool) -> Result<String, ProvisionError> {
        if !self.runner.program_exists(&self.terraform_bin) {
            return Err(ProvisionError::Spawn {
                operation: "init".to_string(),
                reason: format!("'{}' was not found in PATH", self.terraform_bin),
            });
        }

        let output = self
            .invoke("init", args(&["init", "-input=false", "-no-color"]))
            .await?;
        if verbose {
            info!("terraform init:\n{}", output.combined());
        }
        Ok(output.combined())
    }

    /// Computes the pending changes and saves them as the component's plan file.
    pub async fn plan(&self, component: &Component) -> Result<PlanOutput, ProvisionError> {
        let out = format!("-out={}", component.plan_file_name());
        let output = self
            .invoke("plan", args(&["plan", "-input=false", "-no-color", out.as_str()]))
            .await?;

        let text = output.combined();
        let summary = summarize_plan(&text);
        info!(
            "Plan for '{}': {}",
            component.name,
            summary.as_deref().unwrap_or("no summary")
        );
        Ok(PlanOutput { text, summary })
    }

    /// Applies the plan file written by [`plan`](Self::plan).
    pub async fn apply(&self, component: &Component) -> Result<ApplyOutput, ProvisionError> {
        let plan_file = component.plan_file_name();
        let result = self
            .invoke(
                "apply",
                args(&["apply", "-input=false", "-no-color", "-auto-approve", plan_file.as_str()]),
            )
            .await;

        let plan_path = self.workdir.join(&plan_file);
        if let Err(e) = std::fs::remove_file(&plan_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove plan file {}: {}", plan_path.display(), e);
            }
        }

        let output = result?;
        info!("Applied component '{}'", component.name);
        Ok(ApplyOutput {
            text: output.combined(),
        })
    }

    pub async fn get_outputs(&self) -> Result<Outputs, ProvisionError> {
        let output = self
            .invoke("output", args(&["output", "-json", "-no-color"]))
            .await?;
        parse_outputs(&output.stdout)
    }

    /// Destroys the resources of one component, or of the whole workdir when
    /// `component` is `None`.
    pub async fn destroy(&self, component: Option<&Component>) -> Result<String, ProvisionError> {
        let mut destroy_args = args(&["destroy", "-input=false", "-no-color", "-auto-approve"]);

        if let Some(component) = component {
            let targets = declared_addresses(&component.code);
            if targets.is_empty() {
                warn!("Component '{}' declares no resources, nothing to destroy", component.name);
                return Ok(String::new());
            }
            destroy_args.extend(targets.into_iter().map(|t| format!("-target={t}")));
            info!("Destroying resources of component '{}'", component.name);
        } else {
            info!("Destroying all resources in {}", self.workdir.display());
        }

        Ok(self.invoke("destroy", destroy_args).await?.combined())
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn parse_outputs(json_text: &str) -> Result<Outputs, ProvisionError> {
    if json_text.trim().is_empty() {
        return Ok(Outputs::new());
    }
    serde_json::from_str(json_text).map_err(|e| ProvisionError::InvalidOutput(e.to_string()))
}
