//! Programmatic API used by the CLI and any other front end.
//!
//! Every operation here returns a plain response value with a `success` flag
//! and a human-readable message; failures are never propagated to callers.

use crate::component_store::{validate_component_name, Component, ComponentStore, RESERVED_FILES};
use crate::config::Config;
use crate::error::PreconditionError;
use crate::generation::{CompletionClient, GenerationGateway, MockCompletionClient, OpenAiClient};
use crate::http_client::ReqwestHttpClient;
use crate::orchestrator::{CancelToken, CreationResult, Orchestrator, RetryPolicy};
use crate::providers::{SystemTimeProvider, TimeProvider};
use crate::provisioning::{ProcessRunner, ProvisioningGateway, TokioProcessRunner};
use crate::run_lock::RunLock;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_WORKDIR: &str = ".infraheal/default";
/// Subdirectory whose presence marks a directory as holding infraheal projects.
pub const PROJECT_MARKER_DIR: &str = ".infraheal";

const GENERATION_TIMEOUT: Duration = Duration::from_secs(300);

const AWS_PROVIDER: &str = r#"provider "aws" {
  region = var.aws_region
}

variable "aws_region" {
  default = null
}
"#;

const LOCALSTACK_PROVIDER: &str = r#"provider "aws" {
  region                      = var.aws_region
  access_key                  = "test"
  secret_key                  = "test"
  skip_credentials_validation = true
  skip_metadata_api_check     = true
  skip_requesting_account_id  = true
  s3_use_path_style           = true

  endpoints {
    apigateway     = "http://localhost:4566"
    cloudwatch     = "http://localhost:4566"
    dynamodb       = "http://localhost:4566"
    ec2            = "http://localhost:4566"
    iam            = "http://localhost:4566"
    lambda         = "http://localhost:4566"
    s3             = "http://localhost:4566"
    sns            = "http://localhost:4566"
    sqs            = "http://localhost:4566"
    sts            = "http://localhost:4566"
  }
}

variable "aws_region" {
  default = "us-east-1"
}
"#;

const LOCAL_BACKEND: &str = r#"terraform {
  backend "local" {
    path = "terraform.tfstate"
  }
}
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitProjectResponse {
    pub success: bool,
    pub message: String,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListProjectsResponse {
    pub success: bool,
    pub message: String,
    pub projects: Vec<PathBuf>,
}

/// Result of listing, destroying or deleting components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentsResponse {
    pub success: bool,
    pub message: String,
    pub components: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl ComponentsResponse {
    fn failed(message: String) -> Self {
        Self {
            success: false,
            message,
            components: Vec::new(),
            output: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateComponentRequest {
    pub prompt: String,
    pub name: String,
    /// Falls back to the configured default model when `None`.
    pub model: Option<String>,
    pub self_healing: bool,
    pub max_attempts: u32,
    pub keep_on_failure: bool,
    pub workdir: PathBuf,
}

impl CreateComponentRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        let policy = RetryPolicy::default();
        Self {
            prompt: prompt.into(),
            name: "main".to_string(),
            model: None,
            self_healing: policy.self_healing,
            max_attempts: policy.max_attempts,
            keep_on_failure: policy.keep_artifacts_on_failure,
            workdir: PathBuf::from(DEFAULT_WORKDIR),
        }
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            self_healing: self.self_healing,
            keep_artifacts_on_failure: self.keep_on_failure,
        }
    }
}

/// Entry point for all project and component operations.
pub struct InfraService {
    completion: Arc<dyn CompletionClient>,
    runner: Arc<dyn ProcessRunner>,
    clock: Arc<dyn TimeProvider>,
    terraform_bin: String,
    default_model: String,
    command_timeout: Duration,
    cancel: CancelToken,
}

impl InfraService {
    pub fn new(
        completion: Arc<dyn CompletionClient>,
        runner: Arc<dyn ProcessRunner>,
        terraform_bin: impl Into<String>,
        default_model: impl Into<String>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            completion,
            runner,
            clock: Arc::new(SystemTimeProvider),
            terraform_bin: terraform_bin.into(),
            default_model: default_model.into(),
            command_timeout,
            cancel: CancelToken::new(),
        }
    }

    /// Builds the service with real collaborators, or the offline generator
    /// when mock mode is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let completion: Arc<dyn CompletionClient> = if config.is_mock_mode() {
            Arc::new(MockCompletionClient::new())
        } else {
            let http = ReqwestHttpClient::with_timeout(GENERATION_TIMEOUT)?;
            let api_key = config.get_api_key().cloned().unwrap_or_default();
            Arc::new(OpenAiClient::new(http, config.api_base.clone(), api_key))
        };

        Ok(Self::new(
            completion,
            Arc::new(TokioProcessRunner),
            config.terraform_bin.clone(),
            config.default_model.clone(),
            Duration::from_secs(config.command_timeout_secs),
        ))
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    fn provisioner(&self, workdir: &Path) -> ProvisioningGateway {
        ProvisioningGateway::new(
            self.runner.clone(),
            self.terraform_bin.clone(),
            workdir,
            self.command_timeout,
        )
    }

    // =========================================================================
    // Projects
    // =========================================================================

    /// Creates the workdir, writes the shared provider and backend files if
    /// they are missing and runs `terraform init`.
    pub async fn initialize_project(
        &self,
        workdir: &Path,
        verbose: bool,
        use_local_backend: bool,
    ) -> InitProjectResponse {
        match self.try_initialize(workdir, verbose, use_local_backend).await {
            Ok(()) => InitProjectResponse {
                success: true,
                message: "Project initialized successfully".to_string(),
                workdir: workdir.to_path_buf(),
            },
            Err(e) => {
                error!("Error initializing project: {:#}", e);
                InitProjectResponse {
                    success: false,
                    message: format!("Project initialization failed: {e:#}"),
                    workdir: workdir.to_path_buf(),
                }
            }
        }
    }

    async fn try_initialize(&self, workdir: &Path, verbose: bool, use_local_backend: bool) -> Result<()> {
        fs::create_dir_all(workdir)
            .with_context(|| format!("Failed to create {}", workdir.display()))?;

        let provider = if use_local_backend { LOCALSTACK_PROVIDER } else { AWS_PROVIDER };
        write_if_absent(&workdir.join(RESERVED_FILES[0]), provider)?;
        write_if_absent(&workdir.join(RESERVED_FILES[1]), LOCAL_BACKEND)?;

        self.provisioner(workdir).init(verbose).await?;
        info!("Initialized project in {}", workdir.display());
        Ok(())
    }

    // =========================================================================
    // Components
    // =========================================================================

    pub async fn create_component(&self, request: &CreateComponentRequest) -> CreationResult {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let orchestrator = Orchestrator::new(
            GenerationGateway::new(self.completion.clone(), model),
            self.provisioner(&request.workdir),
            ComponentStore::new(&request.workdir),
        )
        .with_cancel_token(self.cancel.clone())
        .with_clock(self.clock.clone());

        orchestrator
            .create_component(&request.prompt, &request.name, &request.policy())
            .await
    }

    pub fn list_components(&self, workdir: &Path) -> ComponentsResponse {
        match ComponentStore::new(workdir).list_components() {
            Ok(components) => ComponentsResponse {
                success: true,
                message: format!("Found {} components", components.len()),
                components,
                output: String::new(),
            },
            Err(e) => ComponentsResponse::failed(format!(
                "Failed to list components in {}: {}",
                workdir.display(),
                e
            )),
        }
    }

    /// Tears down live resources of one component, or of every component
    /// when `name` is `None`. Component files are kept.
    pub async fn destroy_components(&self, workdir: &Path, name: Option<&str>) -> ComponentsResponse {
        self.run_teardown(workdir, name, false).await
    }

    /// Destroys resources like [`destroy_components`](Self::destroy_components)
    /// and then removes the component files.
    pub async fn delete_components(&self, workdir: &Path, name: Option<&str>) -> ComponentsResponse {
        self.run_teardown(workdir, name, true).await
    }

    async fn run_teardown(&self, workdir: &Path, name: Option<&str>, delete_files: bool) -> ComponentsResponse {
        let verb = if delete_files { "Deleted" } else { "Destroyed" };
        match self.teardown(workdir, name, delete_files).await {
            Ok((components, output)) => ComponentsResponse {
                success: true,
                message: format!("{} {} components", verb, components.len()),
                components,
                output,
            },
            Err(e) => {
                error!("Teardown failed: {:#}", e);
                ComponentsResponse::failed(format!("{e:#}"))
            }
        }
    }

    async fn teardown(
        &self,
        workdir: &Path,
        name: Option<&str>,
        delete_files: bool,
    ) -> Result<(Vec<String>, String)> {
        let store = ComponentStore::new(workdir);
        if !store.ensure_project_initialized() {
            return Err(PreconditionError::ProjectNotInitialized(workdir.to_path_buf()).into());
        }

        let components = match name {
            Some(name) => {
                validate_component_name(name)?;
                if !store.exists(&Component::new(name)) {
                    return Err(PreconditionError::ComponentNotFound(name.to_string()).into());
                }
                vec![store.load(name)?]
            }
            None => store
                .list_components()?
                .iter()
                .map(|name| store.load(name))
                .collect::<std::io::Result<Vec<_>>>()?,
        };

        // Hold every affected component's lock for the whole teardown.
        let _locks = components
            .iter()
            .map(|c| RunLock::acquire(workdir, &c.name, self.clock.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let provisioner = self.provisioner(workdir);
        let output = match name {
            Some(_) => provisioner.destroy(components.first()).await?,
            None => provisioner.destroy(None).await?,
        };

        if delete_files {
            for component in &components {
                store
                    .delete(component)
                    .with_context(|| format!("Failed to delete files of '{}'", component.name))?;
            }
        }

        Ok((components.into_iter().map(|c| c.name).collect(), output))
    }
}

fn write_if_absent(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        info!("Keeping existing {}", path.display());
        return Ok(());
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Lists projects in `parent_dir` and its direct children.
///
/// A directory is a project iff it has a `.infraheal` subdirectory.
pub fn list_projects(parent_dir: &Path) -> ListProjectsResponse {
    if !parent_dir.is_dir() {
        return ListProjectsResponse {
            success: false,
            message: format!(
                "Parent directory '{}' does not exist or is not a directory",
                parent_dir.display()
            ),
            projects: Vec::new(),
        };
    }

    match find_projects(parent_dir) {
        Ok(projects) => ListProjectsResponse {
            success: true,
            message: format!("Found {} infraheal projects", projects.len()),
            projects,
        },
        Err(e) => {
            warn!("Error while listing projects: {:#}", e);
            ListProjectsResponse {
                success: false,
                message: format!("Failed to list projects: {e:#}"),
                projects: Vec::new(),
            }
        }
    }
}

fn find_projects(parent_dir: &Path) -> Result<Vec<PathBuf>> {
    let is_project = |dir: &Path| dir.join(PROJECT_MARKER_DIR).is_dir();
    let absolute = |dir: &Path| std::path::absolute(dir).context("Failed to resolve path");

    let mut projects = Vec::new();
    if is_project(parent_dir) {
        projects.push(absolute(parent_dir)?);
    }

    let mut children = Vec::new();
    for entry in fs::read_dir(parent_dir)? {
        let path = entry?.path();
        if path.is_dir() && is_project(&path) {
            children.push(absolute(&path)?);
        }
    }
    children.sort();
    projects.extend(children);
    Ok(projects)
}
