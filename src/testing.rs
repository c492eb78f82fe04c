//! In-process stand-ins for the container runtime and the agent capability.

use crate::agent::{AgentCapability, AgentContext};
use crate::errors::{Result, SandboxError};
use crate::guard::WriteScopeGuard;
use crate::runtime::{ContainerExit, ContainerHandle, ContainerRuntime, ContainerSpec};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

/// Records lifecycle calls; `wait` replays a canned exit
#[derive(Debug, Default)]
pub struct FakeRuntime {
    fail_start: Option<String>,
    start_delay: Option<Duration>,
    exit: ContainerExit,
    calls: Mutex<Vec<String>>,
    started: Mutex<Vec<ContainerSpec>>,
    removed: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_start(reason: &str) -> Self {
        Self {
            fail_start: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn with_exit(mut self, exit: ContainerExit) -> Self {
        self.exit = exit;
        self
    }

    /// Take `delay` to bring the container up
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<ContainerSpec> {
        self.started.lock().unwrap().clone()
    }

    /// Container ids passed to `remove`
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.record("start");
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.fail_start {
            return Err(SandboxError::EnvironmentUnavailable(reason.clone()));
        }
        self.started.lock().unwrap().push(spec.clone());
        Ok(ContainerHandle {
            id: format!("fake-{}", spec.name),
            name: spec.name.clone(),
        })
    }

    async fn wait(
        &self,
        _handle: &ContainerHandle,
        on_line: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> Result<ContainerExit> {
        self.record("wait");
        for line in self.exit.stdout.lines().chain(self.exit.stderr.lines()) {
            on_line(line);
        }
        Ok(self.exit.clone())
    }

    async fn stop(&self, _handle: &ContainerHandle) -> Result<()> {
        self.record("stop");
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.record("remove");
        self.removed.lock().unwrap().push(handle.id.clone());
        Ok(())
    }
}

/// Simulates generated code: runs a closure against the session's guard
pub struct ScriptedAgent<F> {
    script: F,
}

impl<F> ScriptedAgent<F>
where
    F: Fn(&WriteScopeGuard) -> Result<String> + Send + Sync + 'static,
{
    pub fn new(script: F) -> Self {
        Self { script }
    }
}

#[async_trait]
impl<F> AgentCapability for ScriptedAgent<F>
where
    F: Fn(&WriteScopeGuard) -> Result<String> + Send + Sync + 'static,
{
    async fn generate_and_run(&self, ctx: AgentContext) -> Result<String> {
        (self.script)(&ctx.guard)
    }
}

/// Never finishes
pub struct PendingAgent;

#[async_trait]
impl AgentCapability for PendingAgent {
    async fn generate_and_run(&self, _ctx: AgentContext) -> Result<String> {
        std::future::pending().await
    }
}

pub struct PanickingAgent;

#[async_trait]
impl AgentCapability for PanickingAgent {
    async fn generate_and_run(&self, _ctx: AgentContext) -> Result<String> {
        panic!("generated code crashed the agent loop")
    }
}
