//! Code generation: the completion collaborator and the gateway around it.
//!
//! [`CompletionClient`] is the text-in, text-out model API. [`GenerationGateway`]
//! builds the generate and repair prompts, makes exactly one round trip per
//! call and turns the free-text answer into a [`GeneratedArtifact`].

use crate::error::GenerationError;
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::sections::{strip_reasoning, Sections};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const PRIMARY_LABEL: &str = "terraform";
pub const VARIABLES_LABEL: &str = "module.tfvars";
pub const REMARKS_LABEL: &str = "remarks";

const GENERATE_TEMPERATURE: f32 = 0.7;
const REPAIR_TEMPERATURE: f32 = 0.5;

const FORMAT_RULES: &str = r#"Put all resources in one block formatted like this:
```terraform
<terraform code>

output "resource_info" {
  value       = <useful resource information>
  description = "Useful information about the created resource"
}
```
If the user names a region, set it in a variables block:
```module.tfvars
aws_region = "<region>"
```
Address the user in a remarks block:
```remarks
<remarks>
```
The project already declares this provider, never declare another one:
```provider.tf
provider "aws" {
  region = var.aws_region
}

variable "aws_region" {
  default = null
}
```
Include outputs that help the user reach the resources, such as IDs, ARNs and endpoints."#;

const GENERATE_SYSTEM_PROMPT: &str = "You write production-ready Terraform for AWS. \
Translate the user's request into infrastructure as code that creates every dependency \
the requested resources need.";

const REPAIR_SYSTEM_PROMPT: &str = "You debug Terraform. You receive the original request, \
the code that was generated for it and the error terraform reported. Find the root cause \
and return the corrected code, keeping the original intent. If nothing needs to change, \
return the code unchanged. Explain the fix in the remarks block.";

/// Parsed generator output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedArtifact {
    /// Primary declarative code, never empty.
    pub code: String,
    /// Variables file content, empty when the response had none.
    pub variables: String,
    /// Human-facing remarks; not used by the orchestrator.
    pub remarks: Option<String>,
}

/// A single chat completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    /// Text the answer is expected to resemble, sent as a predicted output.
    pub prediction: Option<String>,
}

/// Text-in, text-out model collaborator.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiClient<H: HttpClient = ReqwestHttpClient> {
    http: H,
    api_base: String,
    api_key: String,
}

impl<H: HttpClient> OpenAiClient<H> {
    pub fn new(http: H, api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            api_key: api_key.into(),
        }
    }

    fn request_body(request: &CompletionRequest) -> serde_json::Value {
        let mut body = json!({
            "model": request.model,
            "temperature": request.temperature,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
        });
        if let Some(prediction) = &request.prediction {
            body["prediction"] = json!({ "type": "content", "content": prediction });
        }
        body
    }

    fn extract_content(response_text: &str) -> Result<String> {
        let value: serde_json::Value = serde_json::from_str(response_text)
            .map_err(|e| anyhow!("completion response is not JSON: {}", e))?;

        value
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("completion response has no message content: {}", response_text))
    }
}

#[async_trait]
impl<H: HttpClient> CompletionClient for OpenAiClient<H> {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let authorization = format!("Bearer {}", self.api_key);
        let headers = [
            ("Authorization", authorization.as_str()),
            ("Content-Type", "application/json"),
        ];

        debug!("POST {} (model {})", url, request.model);
        let response = self
            .http
            .post_json(&url, &headers, &Self::request_body(request))
            .await?;

        if !response.is_success() {
            warn!("Completion API returned status {}", response.status);
            return Err(anyhow!(
                "completion API returned status {}: {}",
                response.status,
                response.body
            ));
        }

        Self::extract_content(&response.body)
    }
}

/// Offline client used when `INFRAHEAL_USE_MOCK` is set.
///
/// Answers with a provider-free `terraform_data` resource that echoes the
/// request, so a whole run can be exercised without cloud credentials.
pub struct MockCompletionClient;

impl MockCompletionClient {
    pub fn new() -> Self {
        Self
    }

    fn hcl_string(text: &str) -> String {
        let quoted = serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string());
        quoted.replace("${", "$${").replace("%{", "%%{")
    }

    pub fn canned_response(request_text: &str) -> String {
        let input = Self::hcl_string(request_text);
        format!(
            "```terraform\nresource \"terraform_data\" \"request\" {{\n  input = {input}\n}}\n\n\
output \"request\" {{\n  value       = terraform_data.request.output\n  \
description = \"The recorded request\"\n}}\n```\n\
```remarks\nGenerated offline by the mock client.\n```\n"
        )
    }
}

impl Default for MockCompletionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        info!("Using mock completion client (INFRAHEAL_USE_MOCK=1)");
        let original = request
            .user
            .strip_prefix("Original request: ")
            .and_then(|rest| rest.lines().next())
            .unwrap_or(&request.user);
        Ok(Self::canned_response(original))
    }
}

/// One round trip to the code generator per call.
pub struct GenerationGateway {
    client: Arc<dyn CompletionClient>,
    model: String,
}

impl GenerationGateway {
    pub fn new(client: Arc<dyn CompletionClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn generate(&self, prompt: &str) -> Result<GeneratedArtifact, GenerationError> {
        info!("Generating terraform for prompt using model {}", self.model);
        let request = CompletionRequest {
            model: self.model.clone(),
            system: format!("{GENERATE_SYSTEM_PROMPT}\n\n{FORMAT_RULES}"),
            user: prompt.to_string(),
            temperature: GENERATE_TEMPERATURE,
            prediction: None,
        };
        self.round_trip(&request).await
    }

    /// Asks for a corrected version of `current_code` that addresses
    /// `error_text`.
    pub async fn repair(
        &self,
        prompt: &str,
        current_code: &str,
        current_vars: &str,
        error_text: &str,
    ) -> Result<GeneratedArtifact, GenerationError> {
        info!("Requesting repair using model {}", self.model);
        let request = CompletionRequest {
            model: self.model.clone(),
            system: format!("{REPAIR_SYSTEM_PROMPT}\n\n{FORMAT_RULES}"),
            user: build_repair_prompt(prompt, current_code, current_vars, error_text),
            temperature: REPAIR_TEMPERATURE,
            prediction: Some(current_code.to_string()),
        };
        self.round_trip(&request).await
    }

    async fn round_trip(
        &self,
        request: &CompletionRequest,
    ) -> Result<GeneratedArtifact, GenerationError> {
        let response = self
            .client
            .complete(request)
            .await
            .map_err(|e| GenerationError::Request(format!("{e:#}")))?;
        parse_response(&response)
    }
}

fn build_repair_prompt(prompt: &str, code: &str, vars: &str, error_text: &str) -> String {
    let mut text = format!(
        "Original request: {prompt}\n\nCurrent terraform code:\n```{PRIMARY_LABEL}\n{code}\n```\n"
    );
    if !vars.trim().is_empty() {
        text.push_str(&format!("\nCurrent variables:\n```{VARIABLES_LABEL}\n{vars}\n```\n"));
    }
    text.push_str(&format!(
        "\nError output:\n```\n{error_text}\n```\n\nPlease fix the terraform code to resolve these errors."
    ));
    text
}

/// Turns a raw generator answer into an artifact.
pub fn parse_response(response: &str) -> Result<GeneratedArtifact, GenerationError> {
    let cleaned = strip_reasoning(response);
    let sections = Sections::parse(&cleaned);

    let code = sections.require(PRIMARY_LABEL)?;
    if code.trim().is_empty() {
        return Err(GenerationError::Malformed(format!(
            "'{PRIMARY_LABEL}' section is empty"
        )));
    }

    Ok(GeneratedArtifact {
        code: code.to_string(),
        variables: sections.get(VARIABLES_LABEL).unwrap_or_default().to_string(),
        remarks: sections.get(REMARKS_LABEL).map(str::to_string),
    })
}
