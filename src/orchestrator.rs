//! Self-healing component creation.
//!
//! A run moves through
//!
//! ```text
//! Init -> Generating -> Saving -> Planning -> Applying -> Succeeded
//!                         ^                      |
//!                         +------ Fixing <-------+  (plan/apply failed, budget left)
//! ```
//!
//! and ends in `Failed` from any stage. Attempts are strictly sequential and
//! only the latest generated artifact is ever saved and applied.

use crate::component_store::{validate_component_name, Component, ComponentStore};
use crate::error::{OrchestrationError, PreconditionError, ProvisionError};
use crate::generation::{GeneratedArtifact, GenerationGateway};
use crate::provisioning::{Outputs, ProvisioningGateway};
use crate::providers::{SystemTimeProvider, TimeProvider};
use crate::run_lock::RunLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Init,
    Generating,
    Saving,
    Planning,
    Applying,
    Fixing,
    Succeeded,
    Failed,
}

/// Which stage ended an unsuccessful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Precondition,
    Lock,
    Generation,
    Save,
    Provisioning,
    Repair,
    SelfHealingExhausted,
    Cancelled,
}

impl From<&OrchestrationError> for FailureStage {
    fn from(err: &OrchestrationError) -> Self {
        match err {
            OrchestrationError::Precondition(_) => FailureStage::Precondition,
            OrchestrationError::Lock(_) => FailureStage::Lock,
            OrchestrationError::Generation(_) => FailureStage::Generation,
            OrchestrationError::Repair(_) => FailureStage::Repair,
            OrchestrationError::Store(_) => FailureStage::Save,
            OrchestrationError::Provision(_) => FailureStage::Provisioning,
            OrchestrationError::SelfHealingExhausted { .. } => FailureStage::SelfHealingExhausted,
            OrchestrationError::Cancelled { .. } => FailureStage::Cancelled,
        }
    }
}

/// How hard a run tries. Fixed for the duration of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub self_healing: bool,
    pub keep_artifacts_on_failure: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            self_healing: false,
            keep_artifacts_on_failure: false,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), PreconditionError> {
        if self.max_attempts == 0 {
            return Err(PreconditionError::InvalidRetryPolicy);
        }
        Ok(())
    }
}

/// A failed plan/apply attempt that was followed by a repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreationAttempt {
    pub attempt: u32,
    pub error: String,
}

/// Outcome of one run. Built only by the orchestrator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreationResult {
    pub success: bool,
    pub component_name: String,
    pub terraform_code: String,
    pub tfvars_code: String,
    pub plan_output: String,
    pub plan_summary: Option<String>,
    pub apply_output: String,
    pub outputs: Outputs,
    pub self_healing_attempts: u32,
    pub fixed_errors: Vec<CreationAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<FailureStage>,
    pub final_state: RunState,
}

/// Shared flag for aborting a run between attempts.
///
/// A running terraform invocation is never interrupted; the flag is checked
/// before each attempt and before each repair.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Mutable state of a single run.
struct Run {
    state: RunState,
    component: Component,
    result: CreationResult,
    persisted: bool,
}

impl Run {
    fn new(name: &str) -> Self {
        Self {
            state: RunState::Init,
            component: Component::new(name),
            result: CreationResult {
                component_name: name.to_string(),
                ..CreationResult::default()
            },
            persisted: false,
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn adopt(&mut self, artifact: GeneratedArtifact) {
        self.component.code = artifact.code;
        self.component.variables = artifact.variables;
        self.result.terraform_code = self.component.code.clone();
        self.result.tfvars_code = self.component.variables.clone();
    }

    fn finish(mut self, outcome: Result<(), OrchestrationError>) -> CreationResult {
        match outcome {
            Ok(()) => {
                self.transition(RunState::Succeeded);
                self.result.success = true;
                info!("Component '{}' created", self.component.name);
            }
            Err(err) => {
                self.transition(RunState::Failed);
                error!("Component '{}' failed: {}", self.component.name, err);
                self.result.failure_stage = Some(FailureStage::from(&err));
                self.result.error_message = Some(err.to_string());
            }
        }
        self.result.final_state = self.state;
        self.result
    }
}

/// Drives generate -> save -> plan -> apply, repairing on failure.
pub struct Orchestrator {
    generator: GenerationGateway,
    provisioner: ProvisioningGateway,
    store: ComponentStore,
    clock: Arc<dyn TimeProvider>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(
        generator: GenerationGateway,
        provisioner: ProvisioningGateway,
        store: ComponentStore,
    ) -> Self {
        Self {
            generator,
            provisioner,
            store,
            clock: Arc::new(SystemTimeProvider),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    /// Creates the component `name` from `prompt`.
    ///
    /// Never returns an error: every expected failure is reported through
    /// the returned [`CreationResult`].
    pub async fn create_component(
        &self,
        prompt: &str,
        name: &str,
        policy: &RetryPolicy,
    ) -> CreationResult {
        let session = Uuid::new_v4();
        let span = info_span!("create_component", %session, component = name);

        async {
            let mut run = Run::new(name);
            let outcome = match self.prepare(name, policy) {
                Ok(_lock) => {
                    let outcome = self.drive(&mut run, prompt, policy).await;
                    if outcome.is_err() && run.persisted {
                        if policy.keep_artifacts_on_failure {
                            info!("Keeping files of failed component '{}'", name);
                        } else {
                            self.store.cleanup(&run.component);
                        }
                    }
                    outcome
                }
                Err(err) => Err(err),
            };
            run.finish(outcome)
        }
        .instrument(span)
        .await
    }

    /// Checks everything that must hold before generation and takes the run
    /// lock. The existence check happens under the lock.
    fn prepare(&self, name: &str, policy: &RetryPolicy) -> Result<RunLock, OrchestrationError> {
        validate_component_name(name)?;
        policy.validate()?;

        if !self.store.ensure_project_initialized() {
            return Err(PreconditionError::ProjectNotInitialized(self.store.workdir().to_path_buf()).into());
        }

        let lock = RunLock::acquire(self.store.workdir(), name, self.clock.as_ref())?;

        if self.store.exists(&Component::new(name)) {
            return Err(PreconditionError::ComponentAlreadyExists(name.to_string()).into());
        }
        Ok(lock)
    }

    async fn drive(
        &self,
        run: &mut Run,
        prompt: &str,
        policy: &RetryPolicy,
    ) -> Result<(), OrchestrationError> {
        run.transition(RunState::Generating);
        let artifact = self
            .generator
            .generate(prompt)
            .await
            .map_err(OrchestrationError::Generation)?;
        run.adopt(artifact);

        let mut attempt: u32 = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled { attempt });
            }

            run.transition(RunState::Saving);
            // A failed save may already have written the primary file.
            run.persisted = true;
            self.store.save(&run.component, true)?;

            info!("Attempt {}/{}", attempt, policy.max_attempts);
            let err = match self.provision(run).await {
                Ok(outputs) => {
                    run.result.outputs = outputs;
                    return Ok(());
                }
                Err(err) => err,
            };
            let error_text = err.diagnostic_text();
            warn!("Attempt {} failed: {}", attempt, err);

            if !policy.self_healing {
                return Err(OrchestrationError::Provision(err));
            }
            if attempt >= policy.max_attempts {
                return Err(OrchestrationError::SelfHealingExhausted {
                    attempts: attempt,
                    operation: err.operation().to_string(),
                    last_error: error_text,
                });
            }
            if self.cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled { attempt });
            }

            run.transition(RunState::Fixing);
            info!("Attempting self-healing (attempt {}/{})", attempt, policy.max_attempts);
            let repaired = self
                .generator
                .repair(prompt, &run.component.code, &run.component.variables, &error_text)
                .await
                .map_err(OrchestrationError::Repair)?;

            run.adopt(repaired);
            run.result.fixed_errors.push(CreationAttempt {
                attempt,
                error: error_text,
            });
            run.result.self_healing_attempts += 1;
            attempt += 1;
        }
    }

    /// Plan then apply the saved component; on success read its outputs.
    async fn provision(&self, run: &mut Run) -> Result<Outputs, ProvisionError> {
        run.transition(RunState::Planning);
        run.result.plan_output.clear();
        run.result.plan_summary = None;
        run.result.apply_output.clear();
        let plan = self.provisioner.plan(&run.component).await?;
        run.result.plan_output = plan.text;
        run.result.plan_summary = plan.summary;

        run.transition(RunState::Applying);
        let apply = self.provisioner.apply(&run.component).await?;
        run.result.apply_output = apply.text;

        // Resources exist at this point, so unreadable outputs are not a
        // reason to repair the code.
        match self.provisioner.get_outputs().await {
            Ok(outputs) => Ok(outputs),
            Err(e) => {
                warn!("Could not read outputs: {}", e);
                Ok(Outputs::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component_store::TERRAFORM_METADATA_DIR;
    use crate::generation::{CompletionClient, CompletionRequest};
    use crate::providers::FixedTimeProvider;
    use crate::provisioning::{CommandOutput, ProcessRunner, RunError};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    // =========================================================================
    // Mock implementations
    // =========================================================================

    /// Answers generation requests from a script and counts generate vs repair.
    #[derive(Default)]
    struct ScriptedGenerator {
        answers: Mutex<VecDeque<Result<String>>>,
        generate_calls: Mutex<u32>,
        repair_calls: Mutex<u32>,
        repair_inputs: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(answers: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                ..Self::default()
            })
        }

        fn generate_calls(&self) -> u32 {
            *self.generate_calls.lock().unwrap()
        }

        fn repair_calls(&self) -> u32 {
            *self.repair_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedGenerator {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            if request.prediction.is_some() {
                *self.repair_calls.lock().unwrap() += 1;
                self.repair_inputs.lock().unwrap().push(request.user.clone());
            } else {
                *self.generate_calls.lock().unwrap() += 1;
            }
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(code("resource \"aws_s3_bucket\" \"b\" {}")))
        }
    }

    /// Terraform stand-in: plan and apply follow their scripts, `Some(err)`
    /// failing with `err` and `None` succeeding; an empty script succeeds.
    #[derive(Default)]
    struct FakeTerraform {
        plan_failures: Mutex<VecDeque<Option<String>>>,
        apply_failures: Mutex<VecDeque<Option<String>>>,
        outputs_json: String,
        calls: Mutex<Vec<String>>,
        cancel_on_failure: Option<CancelToken>,
    }

    impl FakeTerraform {
        fn new() -> Self {
            Self {
                outputs_json: r#"{"bucket":{"value":"images","type":"string","sensitive":false}}"#
                    .to_string(),
                ..Self::default()
            }
        }

        fn failing_plan(self, errors: &[&str]) -> Self {
            *self.plan_failures.lock().unwrap() = errors.iter().map(|e| Some(e.to_string())).collect();
            self
        }

        fn failing_apply(self, errors: &[&str]) -> Self {
            *self.apply_failures.lock().unwrap() = errors.iter().map(|e| Some(e.to_string())).collect();
            self
        }

        /// Cancels `token` while reporting a failure, as a Ctrl-C during
        /// a terraform call would.
        fn cancelling(mut self, token: CancelToken) -> Self {
            self.cancel_on_failure = Some(token);
            self
        }

        fn count(&self, subcommand: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == subcommand).count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProcessRunner for FakeTerraform {
        async fn run(
            &self,
            _program: &str,
            args: &[String],
            _cwd: &Path,
            _timeout: Duration,
        ) -> Result<CommandOutput, RunError> {
            let subcommand = args[0].clone();
            self.calls.lock().unwrap().push(subcommand.clone());

            let failure = match subcommand.as_str() {
                "plan" => self.plan_failures.lock().unwrap().pop_front().flatten(),
                "apply" => self.apply_failures.lock().unwrap().pop_front().flatten(),
                _ => None,
            };
            if let Some(stderr) = failure {
                if let Some(token) = &self.cancel_on_failure {
                    token.cancel();
                }
                return Ok(CommandOutput {
                    success: false,
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr,
                });
            }

            let stdout = match subcommand.as_str() {
                "plan" => "Plan: 1 to add, 0 to change, 0 to destroy.\n".to_string(),
                "apply" => "Apply complete! Resources: 1 added, 0 changed, 0 destroyed.\n".to_string(),
                "output" => self.outputs_json.clone(),
                _ => String::new(),
            };
            Ok(CommandOutput {
                success: true,
                exit_code: Some(0),
                stdout,
                stderr: String::new(),
            })
        }

        fn program_exists(&self, _program: &str) -> bool {
            true
        }
    }

    fn code(body: &str) -> String {
        format!("```terraform\n{body}\n```\n```remarks\nok\n```")
    }

    struct Harness {
        dir: TempDir,
        generator: Arc<ScriptedGenerator>,
        terraform: Arc<FakeTerraform>,
        orchestrator: Orchestrator,
    }

    fn harness(answers: Vec<Result<String>>, terraform: FakeTerraform) -> Harness {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(TERRAFORM_METADATA_DIR)).unwrap();
        harness_in(dir, answers, terraform)
    }

    fn harness_in(dir: TempDir, answers: Vec<Result<String>>, terraform: FakeTerraform) -> Harness {
        let generator = ScriptedGenerator::new(answers);
        let terraform = Arc::new(terraform);
        let orchestrator = Orchestrator::new(
            GenerationGateway::new(generator.clone(), "gpt-4o"),
            ProvisioningGateway::new(terraform.clone(), "terraform", dir.path(), Duration::from_secs(5)),
            ComponentStore::new(dir.path()),
        )
        .with_clock(Arc::new(FixedTimeProvider(1)));
        Harness {
            dir,
            generator,
            terraform,
            orchestrator,
        }
    }

    fn healing(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            self_healing: true,
            keep_artifacts_on_failure: false,
        }
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    #[tokio::test]
    async fn test_repairs_once_then_succeeds() {
        let h = harness(
            vec![Ok(code("broken")), Ok(code("fixed"))],
            FakeTerraform::new().failing_apply(&["bucket name already exists"]),
        );

        let result = h
            .orchestrator
            .create_component("create an S3 bucket", "main", &healing(3))
            .await;

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.final_state, RunState::Succeeded);
        assert_eq!(result.self_healing_attempts, 1);
        assert_eq!(
            result.fixed_errors,
            vec![CreationAttempt {
                attempt: 1,
                error: "bucket name already exists".to_string()
            }]
        );
        assert_eq!(result.terraform_code, "fixed");
        assert_eq!(result.outputs["bucket"].value, serde_json::json!("images"));
        assert_eq!(
            std::fs::read_to_string(h.dir.path().join("main.tf")).unwrap(),
            "fixed"
        );

        let repair_input = &h.generator.repair_inputs.lock().unwrap()[0];
        assert!(repair_input.contains("broken"));
        assert!(repair_input.contains("bucket name already exists"));
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let h = harness(
            vec![],
            FakeTerraform::new().failing_plan(&["err 1", "err 2", "err 3"]),
        );

        let result = h
            .orchestrator
            .create_component("create an S3 bucket", "main", &healing(3))
            .await;

        assert!(!result.success);
        assert_eq!(result.final_state, RunState::Failed);
        assert_eq!(result.failure_stage, Some(FailureStage::SelfHealingExhausted));
        let message = result.error_message.unwrap();
        assert!(message.contains("exhausted after 3 attempts"), "{message}");
        assert!(message.contains("during terraform plan"), "{message}");
        assert!(message.contains("err 3"));
        assert_eq!(result.fixed_errors.len(), 2);
        assert_eq!(result.fixed_errors[1].attempt, 2);
        assert_eq!(result.self_healing_attempts, 2);
        assert_eq!(h.generator.repair_calls(), 2);
        assert_eq!(h.terraform.count("plan"), 3);
        assert!(!h.dir.path().join("main.tf").exists());
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_files_when_asked() {
        let h = harness(vec![], FakeTerraform::new().failing_plan(&["a", "b"]));
        let policy = RetryPolicy {
            keep_artifacts_on_failure: true,
            ..healing(2)
        };

        let result = h.orchestrator.create_component("p", "main", &policy).await;

        assert!(!result.success);
        assert!(h.dir.path().join("main.tf").exists());
    }

    #[tokio::test]
    async fn test_without_self_healing_runs_exactly_once() {
        let h = harness(vec![], FakeTerraform::new().failing_plan(&["nope"; 5]));
        let policy = RetryPolicy {
            max_attempts: 5,
            self_healing: false,
            keep_artifacts_on_failure: false,
        };

        let result = h.orchestrator.create_component("p", "main", &policy).await;

        assert!(!result.success);
        assert_eq!(result.failure_stage, Some(FailureStage::Provisioning));
        assert_eq!(result.error_message.as_deref(), Some("An error occurred during terraform plan: nope"));
        assert_eq!(h.terraform.count("plan"), 1);
        assert_eq!(h.generator.repair_calls(), 0);
        assert!(result.fixed_errors.is_empty());
        assert!(!h.dir.path().join("main.tf").exists());
    }

    #[tokio::test]
    async fn test_single_shot_apply_failure_names_apply() {
        let h = harness(vec![], FakeTerraform::new().failing_apply(&["Error: AccessDenied"]));

        let result = h.orchestrator.create_component("p", "main", &RetryPolicy::default()).await;

        assert_eq!(result.failure_stage, Some(FailureStage::Provisioning));
        assert_eq!(
            result.error_message.as_deref(),
            Some("An error occurred during terraform apply: Error: AccessDenied")
        );
    }

    #[tokio::test]
    async fn test_existing_component_is_rejected_before_any_call() {
        let h = harness(vec![], FakeTerraform::new());
        std::fs::write(h.dir.path().join("main.tf"), "existing").unwrap();

        let result = h.orchestrator.create_component("p", "main", &healing(3)).await;

        assert!(!result.success);
        assert_eq!(result.failure_stage, Some(FailureStage::Precondition));
        assert!(result.error_message.unwrap().contains("already exists"));
        assert_eq!(h.generator.generate_calls(), 0);
        assert_eq!(h.terraform.total_calls(), 0);
        assert_eq!(std::fs::read_to_string(h.dir.path().join("main.tf")).unwrap(), "existing");
    }

    #[tokio::test]
    async fn test_invalid_names_touch_nothing() {
        for name in ["my comp", "../x", ""] {
            let h = harness(vec![], FakeTerraform::new());
            let result = h.orchestrator.create_component("p", name, &healing(3)).await;

            assert!(!result.success);
            assert_eq!(result.failure_stage, Some(FailureStage::Precondition));
            assert!(result.error_message.unwrap().contains("Invalid component name"));
            assert_eq!(h.generator.generate_calls(), 0);
            assert_eq!(h.terraform.total_calls(), 0);
            assert!(!h.dir.path().join(crate::run_lock::LOCK_DIR).exists());
        }
    }

    #[tokio::test]
    async fn test_uninitialized_project_is_rejected() {
        let h = harness_in(TempDir::new().unwrap(), vec![], FakeTerraform::new());

        let result = h.orchestrator.create_component("p", "main", &healing(3)).await;

        assert_eq!(result.failure_stage, Some(FailureStage::Precondition));
        assert!(result.error_message.unwrap().contains("not initialized"));
        assert_eq!(h.generator.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_max_attempts_is_rejected() {
        let h = harness(vec![], FakeTerraform::new());
        let result = h.orchestrator.create_component("p", "main", &healing(0)).await;
        assert_eq!(result.failure_stage, Some(FailureStage::Precondition));
        assert_eq!(h.generator.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_generation_is_fatal_without_retry() {
        let h = harness(
            vec![Ok("```remarks\nI refuse\n```".to_string())],
            FakeTerraform::new(),
        );

        let result = h.orchestrator.create_component("p", "main", &healing(3)).await;

        assert!(!result.success);
        assert_eq!(result.failure_stage, Some(FailureStage::Generation));
        assert!(result.error_message.unwrap().contains("missing required 'terraform' section"));
        assert_eq!(h.generator.generate_calls(), 1);
        assert_eq!(h.terraform.total_calls(), 0);
        assert!(!h.dir.path().join("main.tf").exists());
    }

    #[tokio::test]
    async fn test_repair_failure_is_fatal_and_cleans_up() {
        let h = harness(
            vec![Ok(code("broken")), Err(anyhow!("rate limited"))],
            FakeTerraform::new().failing_plan(&["bad"]),
        );

        let result = h.orchestrator.create_component("p", "main", &healing(3)).await;

        assert!(!result.success);
        assert_eq!(result.failure_stage, Some(FailureStage::Repair));
        assert!(result.error_message.unwrap().contains("rate limited"));
        assert_eq!(h.generator.repair_calls(), 1);
        assert_eq!(h.terraform.count("plan"), 1);
        assert!(result.fixed_errors.is_empty());
        assert!(!h.dir.path().join("main.tf").exists());
    }

    #[tokio::test]
    async fn test_plan_summary_recorded_when_apply_fails() {
        let h = harness(vec![], FakeTerraform::new().failing_apply(&["denied"]));
        let policy = RetryPolicy::default();

        let result = h.orchestrator.create_component("p", "main", &policy).await;

        assert!(!result.success);
        assert_eq!(
            result.plan_summary.as_deref(),
            Some("Plan: 1 to add, 0 to change, 0 to destroy.")
        );
        assert_eq!(h.terraform.count("apply"), 1);
        assert_eq!(h.terraform.count("output"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_provisioning() {
        let Harness {
            dir,
            terraform,
            orchestrator,
            ..
        } = harness(vec![], FakeTerraform::new());
        let token = CancelToken::new();
        token.cancel();
        let orchestrator = orchestrator.with_cancel_token(token);

        let result = orchestrator.create_component("p", "main", &healing(3)).await;

        assert_eq!(result.failure_stage, Some(FailureStage::Cancelled));
        assert!(result.error_message.unwrap().contains("cancelled at attempt 1"));
        assert_eq!(terraform.total_calls(), 0);
        assert!(!dir.path().join("main.tf").exists());
    }

    async fn cancelled_after_failed_attempt(keep: bool) -> (Harness, CreationResult) {
        let token = CancelToken::new();
        let h = harness(
            vec![],
            FakeTerraform::new().failing_plan(&["bad"]).cancelling(token.clone()),
        );
        let policy = RetryPolicy {
            keep_artifacts_on_failure: keep,
            ..healing(3)
        };
        let Harness {
            dir,
            generator,
            terraform,
            orchestrator,
        } = h;
        let orchestrator = orchestrator.with_cancel_token(token);

        let result = orchestrator.create_component("p", "main", &policy).await;
        let h = Harness {
            dir,
            generator,
            terraform,
            orchestrator,
        };
        (h, result)
    }

    #[tokio::test]
    async fn test_cancel_between_attempts_cleans_up() {
        let (h, result) = cancelled_after_failed_attempt(false).await;

        assert!(!result.success);
        assert_eq!(result.failure_stage, Some(FailureStage::Cancelled));
        assert!(result.error_message.unwrap().contains("cancelled at attempt 1"));
        assert_eq!(h.generator.repair_calls(), 0);
        assert_eq!(h.terraform.count("plan"), 1);
        assert!(!h.dir.path().join("main.tf").exists());
    }

    #[tokio::test]
    async fn test_cancel_between_attempts_keeps_files_when_asked() {
        let (h, result) = cancelled_after_failed_attempt(true).await;

        assert_eq!(result.failure_stage, Some(FailureStage::Cancelled));
        assert_eq!(h.generator.repair_calls(), 0);
        assert!(h.dir.path().join("main.tf").exists());
    }

    #[tokio::test]
    async fn test_partial_save_failure_is_cleaned_up() {
        let with_vars = "```terraform\nresource \"a\" \"b\" {}\n```\n```module.tfvars\nx = 1\n```".to_string();
        let h = harness(vec![Ok(with_vars)], FakeTerraform::new());
        // The variables file cannot be written over a directory.
        std::fs::create_dir(h.dir.path().join("main.auto.tfvars")).unwrap();

        let result = h.orchestrator.create_component("p", "main", &healing(3)).await;

        assert!(!result.success);
        assert_eq!(result.failure_stage, Some(FailureStage::Save));
        assert!(result.error_message.unwrap().contains("Failed to save component"));
        assert_eq!(h.terraform.total_calls(), 0);
        assert!(!h.dir.path().join("main.tf").exists());
    }

    #[tokio::test]
    async fn test_failed_plan_clears_previous_plan_summary() {
        // Attempt 1 plans fine and fails at apply; attempt 2 fails at plan.
        let terraform = FakeTerraform::new().failing_apply(&["denied"]);
        *terraform.plan_failures.lock().unwrap() = [None, Some("bad plan".to_string())].into();
        let h = harness(vec![], terraform);

        let result = h.orchestrator.create_component("p", "main", &healing(2)).await;

        assert!(!result.success);
        assert_eq!(result.fixed_errors[0].error, "denied");
        assert_eq!(result.plan_summary, None);
        assert!(result.plan_output.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_run_on_same_component_is_refused() {
        let h = harness(vec![], FakeTerraform::new());
        let _held = RunLock::acquire(h.dir.path(), "main", &FixedTimeProvider(1)).unwrap();

        let result = h.orchestrator.create_component("p", "main", &healing(3)).await;

        assert_eq!(result.failure_stage, Some(FailureStage::Lock));
        assert_eq!(h.generator.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_attempt_bounds_hold_for_any_budget() {
        for max_attempts in 1..=4 {
            let failures = vec!["fail"; max_attempts as usize + 2];
            let h = harness(vec![], FakeTerraform::new().failing_plan(&failures));

            let result = h
                .orchestrator
                .create_component("p", "main", &healing(max_attempts))
                .await;

            assert!(!result.success);
            assert!(h.generator.repair_calls() <= max_attempts - 1);
            assert!(h.terraform.count("plan") <= max_attempts as usize);
            assert_eq!(result.fixed_errors.len() as u32, result.self_healing_attempts);
        }
    }

    #[tokio::test]
    async fn test_success_counts_are_consistent() {
        let h = harness(
            vec![],
            FakeTerraform::new().failing_plan(&["one"]).failing_apply(&["two"]),
        );

        let result = h.orchestrator.create_component("p", "main", &healing(4)).await;

        assert!(result.success);
        assert_eq!(result.self_healing_attempts, 2);
        assert_eq!(result.fixed_errors.len(), 2);
        assert!(result.self_healing_attempts < 4);
        assert_eq!(result.fixed_errors[0].error, "one");
        assert_eq!(result.fixed_errors[1].error, "two");
    }

    #[tokio::test]
    async fn test_unreadable_outputs_do_not_fail_the_run() {
        let terraform = FakeTerraform {
            outputs_json: "not json".to_string(),
            ..FakeTerraform::new()
        };
        let h = harness(vec![], terraform);

        let result = h.orchestrator.create_component("p", "main", &RetryPolicy::default()).await;

        assert!(result.success);
        assert!(result.outputs.is_empty());
    }
}
