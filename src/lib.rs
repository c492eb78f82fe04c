//! Run an AI data-analysis agent inside a container.
//!
//! Inputs are bound read-only, the agent writes only to a per-session scratch
//! directory, and outputs are copied back into the working directory without
//! overwriting anything.
//!
//! ```no_run
//! use analystbox::{config, AppConfig, Orchestrator};
//!
//! # async fn demo() -> analystbox::Result<()> {
//! let config = AppConfig::load(&config::config_path()?)?;
//! let orchestrator = Orchestrator::from_config(&config)?;
//! let cwd = std::env::current_dir()?;
//! let outcome = orchestrator
//!     .run(&cwd, &["sales.xlsx"], "Summarize total sales per region")
//!     .await?;
//! println!("{outcome}");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod driver;
pub mod errors;
pub mod guard;
pub mod orchestrator;
pub mod prompt;
pub mod reconcile;
pub mod report;
pub mod runtime;
pub mod staging;

#[cfg(test)]
mod testing;

pub use agent::{AgentCapability, AgentContext, ContainerAgent};
pub use config::{AppConfig, ModelBackend, ModelConfig, RuntimePreference, SandboxSettings};
pub use driver::{
    EventSink, ExecutionSession, SessionDriver, SessionEvent, SessionFailure, SessionStatus,
};
pub use errors::{Result, SandboxError};
pub use guard::{WriteAttempt, WriteDecision, WriteScopeGuard};
pub use orchestrator::Orchestrator;
pub use reconcile::{CopyOutcome, ReconciledArtifact, Reconciler};
pub use report::SessionOutcome;
pub use runtime::{CliRuntime, ContainerRuntime};
pub use staging::{FileManifest, MountPlan, Stager};
