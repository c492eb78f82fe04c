//! The agent capability seam.
//!
//! The reasoning and code-generation loop lives in the sandbox image; the
//! host only sees its terminal outcome. [`ContainerAgent`] waits on the
//! container the driver started and reads the result block the in-image
//! entrypoint prints on exit.
//!
//! # Entrypoint contract
//!
//! The image's default command is the agent entrypoint. It starts in the
//! scratch mount (also `ANALYST_OUTPUT_DIR`) with the write guard already
//! installed through `PYTHONPATH`, and reads everything else from the
//! environment:
//!
//! | Variable | Content |
//! |---|---|
//! | `ANALYST_SESSION_ID` | Session token for the result markers |
//! | `ANALYST_PROMPT` | Base64 of the UTF-8 analysis prompt |
//! | `ANALYST_MANIFEST` | Base64 JSON [`FileManifest`] |
//! | `ANALYST_OUTPUT_DIR` | Writable scratch directory |
//! | `ANALYST_AUTHORIZED_IMPORTS` | Comma-separated modules generated code may import |
//! | `MODEL_TYPE`, `MODEL_ID`, `MODEL_API_KEY`, `MODEL_API_BASE` | Model backend |
//!
//! On exit it prints exactly one result block to stdout, tagged with the
//! session token, and exits non-zero when `error` is set:
//!
//! ```text
//! ANALYST_RESULT_START <ANALYST_SESSION_ID>
//! {"final_answer": "...", "error": null}
//! ANALYST_RESULT_END <ANALYST_SESSION_ID>
//! ```
//!
//! A minimal entrypoint:
//!
//! ```python
//! import base64, json, os, sys
//!
//! session = os.environ["ANALYST_SESSION_ID"]
//! prompt = base64.b64decode(os.environ["ANALYST_PROMPT"]).decode("utf-8")
//! result = {"final_answer": None, "error": None}
//! try:
//!     agent = build_agent(  # CodeAgent over the MODEL_* backend
//!         authorized_imports=os.environ["ANALYST_AUTHORIZED_IMPORTS"].split(","),
//!     )
//!     result["final_answer"] = str(agent.run(prompt))
//! except Exception as e:
//!     result["error"] = str(e) or type(e).__name__
//! print("ANALYST_RESULT_START " + session)
//! print(json.dumps(result))
//! print("ANALYST_RESULT_END " + session, flush=True)
//! sys.exit(1 if result["error"] else 0)
//! ```

use crate::config::ModelConfig;
use crate::driver::{EventSink, SessionEvent};
use crate::errors::{Result, SandboxError};
use crate::guard::{parse_denial_line, WriteScopeGuard};
use crate::runtime::{ContainerExit, ContainerHandle, ContainerRuntime};
use crate::staging::FileManifest;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub const RESULT_START: &str = "ANALYST_RESULT_START";
pub const RESULT_END: &str = "ANALYST_RESULT_END";

/// Everything the agent may use while the session is running
#[derive(Clone)]
pub struct AgentContext {
    pub session_id: Uuid,
    pub task: String,
    /// Task with guidelines and the input listing
    pub prompt: String,
    pub manifest: FileManifest,
    pub model: ModelConfig,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub container: ContainerHandle,
    /// Scoped to the session's scratch directory
    pub guard: Arc<WriteScopeGuard>,
    pub events: EventSink,
}

/// Generates and runs analysis code for `ctx.task`; resolves to the final answer
/// text, or `AgentExecution` once the agent gives up.
#[async_trait]
pub trait AgentCapability: Send + Sync {
    async fn generate_and_run(&self, ctx: AgentContext) -> Result<String>;
}

/// Agent running inside the session container
#[derive(Debug, Clone, Default)]
pub struct ContainerAgent;

#[derive(Debug, Deserialize)]
struct AgentReport {
    #[serde(default)]
    final_answer: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl AgentCapability for ContainerAgent {
    async fn generate_and_run(&self, ctx: AgentContext) -> Result<String> {
        let token = ctx.session_id.to_string();
        let guard = ctx.guard.clone();
        let events = ctx.events.clone();
        let denial_token = token.clone();
        let on_line = move |line: &str| match parse_denial_line(line, &denial_token) {
            Some(attempt) => {
                guard.record(attempt.clone());
                events.emit(SessionEvent::Denied(attempt));
            }
            None => events.emit(SessionEvent::Output(line.to_string())),
        };

        let exit = ctx.runtime.wait(&ctx.container, &on_line).await?;
        interpret_exit(&exit, &token)
    }
}

/// Map container output to the agent's terminal outcome. Only a result
/// block tagged with `session_token` counts.
pub fn interpret_exit(exit: &ContainerExit, session_token: &str) -> Result<String> {
    if let Some(report) = extract_report(&exit.stdout, session_token) {
        if let Some(error) = report.error.filter(|e| !e.trim().is_empty()) {
            return Err(SandboxError::AgentExecution(error));
        }
        if exit.success() {
            if let Some(answer) = report.final_answer {
                return Ok(answer);
            }
        }
    }

    if !exit.success() {
        return Err(SandboxError::AgentExecution(format!(
            "agent exited with status {}: {}",
            exit.status_code,
            tail(&exit.stderr, 5)
        )));
    }
    Err(SandboxError::AgentExecution(
        "agent finished without reporting a result".to_string(),
    ))
}

fn extract_report(stdout: &str, session_token: &str) -> Option<AgentReport> {
    let start_line = format!("{RESULT_START} {session_token}");
    let end_line = format!("{RESULT_END} {session_token}");

    let mut body: Option<Vec<&str>> = None;
    let mut report = None;
    for line in stdout.lines() {
        let line = line.trim_end();
        if line == start_line {
            body = Some(Vec::new());
        } else if line == end_line {
            if let Some(lines) = body.take() {
                report = serde_json::from_str(lines.join("\n").trim()).ok().or(report);
            }
        } else if let Some(lines) = body.as_mut() {
            lines.push(line);
        }
    }
    report
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
