//! Container session driver.
//!
//! Owns one sandbox for the duration of one session:
//! `Pending -> Starting -> Running -> {Succeeded, Failed}`. Teardown runs on
//! every path out of `Running`, including agent panics and cancellation,
//! before the session record is handed back.

use crate::agent::{AgentCapability, AgentContext};
use crate::config::{ModelConfig, SandboxSettings};
use crate::errors::{Result, SandboxError};
use crate::guard::{GuardBundle, WriteAttempt, WriteScopeGuard};
use crate::prompt::AnalysisPrompt;
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, Mount};
use crate::staging::MountPlan;
use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Token tagging the entrypoint's result block
pub const ENV_SESSION_ID: &str = "ANALYST_SESSION_ID";
/// Base64 of the rendered analysis prompt
pub const ENV_PROMPT: &str = "ANALYST_PROMPT";
/// Base64 JSON of the input manifest
pub const ENV_MANIFEST: &str = "ANALYST_MANIFEST";
pub const ENV_OUTPUT_DIR: &str = "ANALYST_OUTPUT_DIR";
pub const ENV_AUTHORIZED_IMPORTS: &str = "ANALYST_AUTHORIZED_IMPORTS";

/// How long a start already in flight may finish after cancellation
const START_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Starting,
    Running,
    Succeeded,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Succeeded | SessionStatus::Failed)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Succeeded => "succeeded",
            SessionStatus::Failed => "failed",
        })
    }
}

/// Why a session ended `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SessionFailure {
    EnvironmentUnavailable(String),
    AgentExecution(String),
    Cancelled,
}

impl From<SandboxError> for SessionFailure {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::EnvironmentUnavailable(msg) => SessionFailure::EnvironmentUnavailable(msg),
            SandboxError::Cancelled => SessionFailure::Cancelled,
            SandboxError::AgentExecution(msg) => SessionFailure::AgentExecution(msg),
            other => SessionFailure::AgentExecution(other.to_string()),
        }
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFailure::EnvironmentUnavailable(msg) => {
                write!(f, "execution environment unavailable: {msg}")
            }
            SessionFailure::AgentExecution(msg) => write!(f, "agent execution failed: {msg}"),
            SessionFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Record of one sandbox run. Mutated only by the driver; immutable once terminal.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSession {
    pub id: Uuid,
    pub task: String,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub final_output: Option<String>,
    pub failure: Option<SessionFailure>,
    /// Every write the guard refused during the session
    pub denials: Vec<WriteAttempt>,
}

impl ExecutionSession {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            status: SessionStatus::Pending,
            started_at: None,
            ended_at: None,
            final_output: None,
            failure: None,
            denials: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == SessionStatus::Succeeded
    }

    pub fn container_name(&self) -> String {
        format!("analyst-{}", self.id.simple())
    }

    fn advance(&mut self, next: SessionStatus, events: &EventSink) {
        if !self.status.can_transition_to(next) {
            error!(
                "[DRIVER] Ignoring illegal transition {} -> {} for session {}",
                self.status, next, self.id
            );
            return;
        }
        info!("[DRIVER] Session {}: {} -> {}", self.id, self.status, next);
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        events.emit(SessionEvent::Status(next));
    }

    fn succeed(&mut self, output: String, events: &EventSink) {
        self.final_output = Some(output);
        self.advance(SessionStatus::Succeeded, events);
    }

    fn fail(&mut self, failure: SessionFailure, events: &EventSink) {
        warn!("[DRIVER] Session {} failed: {}", self.id, failure);
        self.failure = Some(failure);
        self.advance(SessionStatus::Failed, events);
    }
}

/// Progress notifications, for a reporter running alongside the session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status(SessionStatus),
    Output(String),
    Denied(WriteAttempt),
}

/// Optional sender half for [`SessionEvent`]s; a closed or absent receiver is ignored
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<SessionEvent>>);

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

/// Drives one session at a time against a container runtime and an agent capability
pub struct SessionDriver {
    runtime: Arc<dyn ContainerRuntime>,
    agent: Arc<dyn AgentCapability>,
    settings: SandboxSettings,
    events: EventSink,
}

impl SessionDriver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        agent: Arc<dyn AgentCapability>,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            runtime,
            agent,
            settings,
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Run `task` against `plan` until the session is terminal.
    ///
    /// `cancel` resolving ends the session as `Failed(Cancelled)`; the sandbox
    /// is torn down before this returns. On a start failure the scratch
    /// directory is discarded at once; otherwise it is left for reconciliation.
    pub async fn run<C>(
        &self,
        task: &str,
        plan: &mut MountPlan,
        model: &ModelConfig,
        cancel: C,
    ) -> ExecutionSession
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let mut session = ExecutionSession::new(task);
        self.events.emit(SessionEvent::Status(SessionStatus::Pending));

        session.started_at = Some(Utc::now());
        session.advance(SessionStatus::Starting, &self.events);

        let prepared = match self.prepare(&session, plan, model) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.discard_scratch(plan);
                session.fail(SessionFailure::EnvironmentUnavailable(e.to_string()), &self.events);
                return session;
            }
        };

        let start = self.runtime.start(&prepared.spec);
        tokio::pin!(start);
        let started = tokio::select! {
            started = &mut start => started,
            _ = &mut cancel => {
                info!("[DRIVER] Cancellation requested while starting session {}", session.id);
                // Dropping the start could let the container appear after
                // teardown, so let it settle first.
                let handle = match tokio::time::timeout(START_SETTLE_TIMEOUT, &mut start).await {
                    Ok(Ok(handle)) => handle,
                    Ok(Err(_)) | Err(_) => ContainerHandle {
                        id: prepared.spec.name.clone(),
                        name: prepared.spec.name.clone(),
                    },
                };
                self.teardown(&handle).await;
                session.fail(SessionFailure::Cancelled, &self.events);
                return session;
            }
        };

        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                self.discard_scratch(plan);
                let failure = match e {
                    SandboxError::EnvironmentUnavailable(msg) => {
                        SessionFailure::EnvironmentUnavailable(msg)
                    }
                    other => SessionFailure::EnvironmentUnavailable(other.to_string()),
                };
                session.fail(failure, &self.events);
                return session;
            }
        };

        session.advance(SessionStatus::Running, &self.events);

        let context = AgentContext {
            session_id: session.id,
            task: task.to_string(),
            prompt: prepared.prompt,
            manifest: prepared.manifest,
            model: model.clone(),
            runtime: self.runtime.clone(),
            container: handle.clone(),
            guard: prepared.guard.clone(),
            events: self.events.clone(),
        };
        let agent = self.agent.clone();
        let mut job = tokio::spawn(async move { agent.generate_and_run(context).await });

        let outcome: std::result::Result<String, SessionFailure> = tokio::select! {
            joined = &mut job => match joined {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(e.into()),
                Err(e) if e.is_panic() => Err(SessionFailure::AgentExecution(
                    "agent capability panicked".to_string(),
                )),
                Err(_) => Err(SessionFailure::Cancelled),
            },
            _ = &mut cancel => {
                info!("[DRIVER] Cancellation requested for session {}", session.id);
                job.abort();
                let _ = (&mut job).await;
                Err(SessionFailure::Cancelled)
            }
        };

        self.teardown(&handle).await;
        session.denials = prepared.guard.denials();
        drop(prepared.bundle);

        match outcome {
            Ok(output) => session.succeed(output, &self.events),
            Err(failure) => session.fail(failure, &self.events),
        }
        session
    }

    fn prepare(
        &self,
        session: &ExecutionSession,
        plan: &MountPlan,
        model: &ModelConfig,
    ) -> Result<Prepared> {
        let settings = &self.settings;
        let guard = Arc::new(WriteScopeGuard::new(plan.scratch.path())?);
        let token = session.id.to_string();
        let bundle = GuardBundle::write(&settings.scratch_mount, &token)?;
        let manifest = plan.manifest(&settings.source_mount_root, &settings.scratch_mount);
        let prompt = AnalysisPrompt::new(&session.task, &manifest).render();

        let mut mounts: Vec<Mount> = plan
            .inputs
            .iter()
            .map(|input| {
                Mount::read_only(&input.source, input.sandbox_path(&settings.source_mount_root))
            })
            .collect();
        mounts.push(Mount::read_write(plan.scratch.path(), &settings.scratch_mount));
        mounts.push(Mount::read_only(bundle.host_dir(), &settings.guard_mount));

        let mut env = model.sandbox_env();
        env.push((ENV_SESSION_ID.to_string(), token));
        env.push((ENV_PROMPT.to_string(), b64.encode(prompt.as_bytes())));
        env.push((ENV_MANIFEST.to_string(), manifest.encode()?));
        env.push((ENV_OUTPUT_DIR.to_string(), settings.scratch_mount.clone()));
        env.push((
            ENV_AUTHORIZED_IMPORTS.to_string(),
            settings.authorized_imports.join(","),
        ));
        env.push(("PYTHONPATH".to_string(), settings.guard_mount.clone()));
        env.push(("MPLBACKEND".to_string(), "Agg".to_string()));

        let spec = ContainerSpec {
            image: settings.image.clone(),
            name: session.container_name(),
            mounts,
            env,
            workdir: settings.scratch_mount.clone(),
            command: Vec::new(),
        };

        Ok(Prepared {
            spec,
            guard,
            bundle,
            manifest,
            prompt,
        })
    }

    async fn teardown(&self, handle: &ContainerHandle) {
        if let Err(e) = self.runtime.stop(handle).await {
            warn!("[DRIVER] Failed to stop container {}: {}", handle.name, e);
        }
        if let Err(e) = self.runtime.remove(handle).await {
            warn!("[DRIVER] Failed to remove container {}: {}", handle.name, e);
        }
    }

    fn discard_scratch(&self, plan: &mut MountPlan) {
        if let Err(e) = plan.scratch.discard() {
            warn!("[DRIVER] Failed to discard scratch directory: {}", e);
        }
    }
}

struct Prepared {
    spec: ContainerSpec,
    guard: Arc<WriteScopeGuard>,
    bundle: GuardBundle,
    manifest: crate::staging::FileManifest,
    prompt: String,
}
