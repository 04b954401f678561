//! `RunPod` pod control plane.
//!
//! A library for running on-demand `RunPod` pods with:
//! - **Lifecycle management**: Idempotent ensure/terminate with persisted state
//! - **Inactivity pruning**: Reap pods idle past a configured threshold
//! - **Usage guardrails**: Account-wide ceilings checked before creation,
//!   behind a shared TTL usage cache
//! - **Stats snapshots**: Per-instance JSON snapshots for dashboards
//!
//! ## Quick Start
//!
//! Configuration is a TOML file; the API key may come from `RUNPOD_API_KEY`
//! (a `.env` file is honored):
//!
//! ```text
//! [pod]
//! image_name = "ghcr.io/acme/pdf:latest"
//!
//! [instances.pymupdf]
//! prune_schedule = "everyFiveMinutes"
//! ```
//!
//! Then drive it through the facade:
//!
//! ```ignore
//! use std::{path::Path, sync::Arc};
//! use runpod_warden::{RunPod, RunpodClient, RunpodClientConfig, RunpodConfig, StartRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RunpodConfig::load(Path::new("runpod.toml"))?;
//!     let client = RunpodClient::new(RunpodClientConfig::from_config(&config)?)?;
//!     let runpod = RunPod::new(config, Arc::new(client));
//!
//!     if let Some(pod) = runpod.start(&StartRequest::new("pymupdf")).await? {
//!         println!("Pod ready: {} at {}", pod.pod_id, pod.url);
//!     }
//!
//!     Ok(())
//! }
//! ```

// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy for strict discipline
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![deny(clippy::unwrap_used)]         // unwrap() is forbidden
#![deny(clippy::expect_used)]         // expect() is forbidden
#![deny(clippy::panic)]               // panic!() is forbidden
#![deny(clippy::print_stdout)]        // println!() is forbidden in the library
#![deny(clippy::todo)]                // TODO is forbidden
#![deny(clippy::unimplemented)]       // unimplemented!() is forbidden
#![deny(clippy::module_inception)]    // Module with same name as crate is forbidden

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// Tests panic on purpose.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Modules
// ============================================================================

/// Entry-point facade wiring the whole control plane together.
pub mod runpod;

/// `RunPod` API gateway (REST lifecycle, GraphQL telemetry).
pub mod runpod_client;

/// Configuration loading, instance overrides and guardrail limits.
pub mod runpod_config;

/// Usage guardrails with a shared TTL cache.
pub mod runpod_guardrails;

/// Pod lifecycle manager: ensure, prune, terminate.
pub mod runpod_manager;

/// Pod state persistence.
pub mod runpod_state;

/// Per-instance stats snapshots for dashboards.
pub mod runpod_stats;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use runpod::{RunPod, RunPodError, StartRequest};
pub use runpod_client::{ComputeProvider, PodDescriptor, RunpodClient, RunpodClientConfig};
pub use runpod_config::{ConfigError, PodConfig, ReadinessMode, RunpodConfig};
pub use runpod_guardrails::{Guardrails, GuardrailsError, UsageSnapshot};
pub use runpod_manager::{EnsuredPod, ManagerError, PodManager, PruneOutcome};
pub use runpod_state::{JsonFileStateStore, PodState, StateStore};
pub use runpod_stats::{StatsSnapshot, StatsWriter};
