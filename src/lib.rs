//! infraheal - self-healing infrastructure provisioning.
//!
//! Turns a natural-language request into a terraform component, applies it,
//! and when plan or apply fails asks the code generator for a repair, up to a
//! bounded number of attempts.
//!
//! # Architecture
//!
//! - [`config`] - Configuration management (API key, model, terraform binary)
//! - [`error`] - Typed failures of every stage
//! - [`sections`] - Fenced-section parser for generator responses
//! - [`generation`] - Code generator collaborator and gateway
//! - [`component_store`] - Component files on disk
//! - [`provisioning`] - Gateway over the terraform CLI
//! - [`run_lock`] - One run per component at a time
//! - [`orchestrator`] - The generate/plan/apply/repair state machine
//! - [`service`] - Project and component operations for front ends
//! - [`providers`] - Shared dependency injection traits
//! - [`http_client`] - HTTP client abstraction
//!
//! # Example
//!
//! ```ignore
//! use infraheal::config::Config;
//! use infraheal::service::{CreateComponentRequest, InfraService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = InfraService::from_config(&Config::load()?)?;
//!
//!     let mut request = CreateComponentRequest::new("create an S3 bucket for images");
//!     request.name = "images".to_string();
//!     request.self_healing = true;
//!
//!     let result = service.create_component(&request).await;
//!     if !result.success {
//!         eprintln!("{}", result.error_message.unwrap_or_default());
//!     }
//!     Ok(())
//! }
//! ```

pub mod component_store;
pub mod config;
pub mod error;
pub mod generation;
pub mod http_client;
pub mod orchestrator;
pub mod providers;
pub mod provisioning;
pub mod run_lock;
pub mod sections;
pub mod service;
