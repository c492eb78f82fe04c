//! `run(working_dir, input_paths, task) -> SessionOutcome`: the single entry
//! point behind the CLI. Stage, drive, tear down, reconcile, clean up.

use crate::agent::{AgentCapability, ContainerAgent};
use crate::config::{AppConfig, ModelConfig};
use crate::driver::{EventSink, SessionDriver};
use crate::errors::Result;
use crate::reconcile::Reconciler;
use crate::report::SessionOutcome;
use crate::runtime::{CliRuntime, ContainerRuntime};
use crate::staging::Stager;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Orchestrator {
    stager: Stager,
    driver: SessionDriver,
    reconciler: Reconciler,
    model: ModelConfig,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        runtime: Arc<dyn ContainerRuntime>,
        agent: Arc<dyn AgentCapability>,
    ) -> Self {
        Self {
            stager: Stager::new(&config.sandbox.scratch_base)
                .with_shared_scratch(!runtime.maps_host_user()),
            driver: SessionDriver::new(runtime, agent, config.sandbox.clone()),
            reconciler: Reconciler::new(),
            model: config.model.clone(),
        }
    }

    /// Podman or docker as configured, with the in-image agent
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let runtime = CliRuntime::detect(&config.sandbox)?;
        Ok(Self::new(config, Arc::new(runtime), Arc::new(ContainerAgent)))
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.driver = self.driver.with_events(events);
        self
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub async fn run<P: AsRef<Path>>(
        &self,
        working_dir: &Path,
        input_paths: &[P],
        task: &str,
    ) -> Result<SessionOutcome> {
        self.run_until(working_dir, input_paths, task, std::future::pending())
            .await
    }

    /// Like [`run`](Self::run), ending the session as cancelled when `cancel` resolves.
    ///
    /// Only configuration and input-path errors are returned as `Err`; every
    /// session-level failure is reported inside the outcome, together with
    /// whatever partial artifacts were reconciled.
    pub async fn run_until<P, C>(
        &self,
        working_dir: &Path,
        input_paths: &[P],
        task: &str,
        cancel: C,
    ) -> Result<SessionOutcome>
    where
        P: AsRef<Path>,
        C: Future<Output = ()>,
    {
        self.model.validate()?;
        let mut plan = self.stager.prepare(working_dir, input_paths)?;

        let session = self.driver.run(task, &mut plan, &self.model, cancel).await;

        // Teardown has completed inside the driver; the sandbox no longer
        // holds the scratch directory.
        let reconciler = self.reconciler.clone();
        let scratch = plan.scratch.path().to_path_buf();
        let destination = plan.working_dir.clone();
        let artifacts = match tokio::task::spawn_blocking(move || {
            reconciler.reconcile(&scratch, &destination)
        })
        .await
        {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!("[ORCHESTRATOR] Reconciliation aborted: {}", e);
                plan.scratch.keep();
                Vec::new()
            }
        };

        if artifacts.iter().any(|a| !a.copied()) {
            warn!(
                "[ORCHESTRATOR] Keeping scratch directory {:?} for files that could not be copied",
                plan.scratch.path()
            );
            plan.scratch.keep();
        } else if let Err(e) = plan.scratch.discard() {
            warn!("[ORCHESTRATOR] Failed to remove scratch directory: {}", e);
        }

        info!(
            "[ORCHESTRATOR] Session {} finished: {} ({} artifact(s))",
            session.id,
            session.status,
            artifacts.len()
        );
        Ok(SessionOutcome::new(session, artifacts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentContext;
    use crate::config::{ModelBackend, SandboxSettings};
    use crate::driver::{SessionFailure, SessionStatus};
    use crate::errors::SandboxError;
    use crate::guard::WriteDecision;
    use crate::testing::{FakeRuntime, ScriptedAgent};
    use async_trait::async_trait;
    use chrono::{Local, TimeZone};
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    struct Env {
        root: TempDir,
        cwd: PathBuf,
        config: AppConfig,
    }

    impl Env {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let cwd = root.path().join("work");
            std::fs::create_dir_all(&cwd).unwrap();
            std::fs::write(cwd.join("sales.xlsx"), b"raw sales").unwrap();
            std::fs::write(root.path().join("secrets.txt"), b"hunter2").unwrap();
            let config = AppConfig {
                model: ModelConfig {
                    backend: ModelBackend::LiteLlm,
                    model_id: "gpt-4o".to_string(),
                    api_key: "sk-test".to_string(),
                    api_base: None,
                },
                sandbox: SandboxSettings {
                    scratch_base: root.path().join("sessions"),
                    ..SandboxSettings::default()
                },
            };
            Self { root, cwd, config }
        }

        fn orchestrator(
            &self,
            runtime: Arc<FakeRuntime>,
            agent: Arc<dyn AgentCapability>,
        ) -> Orchestrator {
            Orchestrator::new(&self.config, runtime, agent).with_reconciler(Reconciler::with_clock(
                || Local.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ))
        }

        fn leftover_scratch(&self) -> usize {
            std::fs::read_dir(self.root.path().join("sessions"))
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    fn summarizer() -> Arc<dyn AgentCapability> {
        Arc::new(ScriptedAgent::new(|guard| {
            guard.create_file("summary.xlsx")?.write_all(b"totals")?;
            Ok("Total sales: 42".to_string())
        }))
    }

    #[tokio::test]
    async fn test_scenario_a_summary_lands_in_cwd() {
        let env = Env::new();
        let runtime = Arc::new(FakeRuntime::new());
        let outcome = assert_ok!(
            env.orchestrator(runtime.clone(), summarizer())
                .run(&env.cwd, &["sales.xlsx"], "summarize totals")
                .await
        );

        assert_eq!(outcome.session.status, SessionStatus::Succeeded);
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.artifacts[0].destination_name, "summary.xlsx");
        assert_eq!(std::fs::read(env.cwd.join("summary.xlsx")).unwrap(), b"totals");
        assert!(outcome.is_complete_success());
        assert_eq!(env.leftover_scratch(), 0);
        assert_eq!(runtime.calls(), vec!["start", "stop", "remove"]);
    }

    #[tokio::test]
    async fn test_scenario_b_existing_name_gets_suffix() {
        let env = Env::new();
        std::fs::write(env.cwd.join("summary.xlsx"), b"previous report").unwrap();

        let outcome = env
            .orchestrator(Arc::new(FakeRuntime::new()), summarizer())
            .run(&env.cwd, &["sales.xlsx"], "summarize totals")
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(
            outcome.artifacts[0].destination_name,
            "summary_20240101T000000.xlsx"
        );
        assert_eq!(
            std::fs::read(env.cwd.join("summary.xlsx")).unwrap(),
            b"previous report"
        );
        assert_eq!(
            std::fs::read(env.cwd.join("summary_20240101T000000.xlsx")).unwrap(),
            b"totals"
        );
    }

    #[tokio::test]
    async fn test_scenario_c_outside_write_fails_session() {
        let env = Env::new();
        let target = env.root.path().join("secrets.txt");
        let agent: Arc<dyn AgentCapability> = Arc::new(ScriptedAgent::new(move |guard| {
            guard.create_file(&target)?.write_all(b"owned")?;
            Ok("unreachable".to_string())
        }));

        let outcome = env
            .orchestrator(Arc::new(FakeRuntime::new()), agent)
            .run(&env.cwd, &["sales.xlsx"], "tamper")
            .await
            .unwrap();

        assert_eq!(outcome.session.status, SessionStatus::Failed);
        assert!(matches!(
            outcome.failure(),
            Some(SessionFailure::AgentExecution(_))
        ));
        assert_eq!(
            outcome.session.denials[0].decision,
            WriteDecision::DeniedOutsideScope
        );
        assert!(outcome.artifacts.is_empty());
        assert_eq!(
            std::fs::read(env.root.path().join("secrets.txt")).unwrap(),
            b"hunter2"
        );
        let listing: Vec<_> = std::fs::read_dir(&env.cwd)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(listing, vec!["sales.xlsx"]);
    }

    #[tokio::test]
    async fn test_scenario_d_escaping_input_never_starts_container() {
        let env = Env::new();
        let runtime = Arc::new(FakeRuntime::new());

        let err = assert_err!(
            env.orchestrator(runtime.clone(), summarizer())
                .run(&env.cwd, &["../secrets.txt"], "read secrets")
                .await
        );

        assert!(matches!(err, SandboxError::InvalidInputPath { .. }));
        assert!(runtime.calls().is_empty());
        assert_eq!(env.leftover_scratch(), 0);
    }

    #[tokio::test]
    async fn test_environment_unavailable_reports_no_artifacts() {
        let env = Env::new();
        let runtime = Arc::new(FakeRuntime::failing_start("no such image"));

        let outcome = env
            .orchestrator(runtime, summarizer())
            .run(&env.cwd, &["sales.xlsx"], "summarize")
            .await
            .unwrap();

        assert!(matches!(
            outcome.failure(),
            Some(SessionFailure::EnvironmentUnavailable(_))
        ));
        assert!(outcome.artifacts.is_empty());
        assert_eq!(env.leftover_scratch(), 0);
    }

    struct WriteThenHang;

    #[async_trait]
    impl AgentCapability for WriteThenHang {
        async fn generate_and_run(&self, ctx: AgentContext) -> Result<String> {
            ctx.guard.create_file("partial.csv")?.write_all(b"a,b\n")?;
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancelled_session_still_reconciles_partials() {
        let env = Env::new();
        let runtime = Arc::new(FakeRuntime::new());

        let outcome = env
            .orchestrator(runtime.clone(), Arc::new(WriteThenHang))
            .run_until(
                &env.cwd,
                &["sales.xlsx"],
                "slow task",
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.failure(), Some(&SessionFailure::Cancelled));
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(std::fs::read(env.cwd.join("partial.csv")).unwrap(), b"a,b\n");
        assert_eq!(runtime.calls(), vec!["start", "stop", "remove"]);
        assert_eq!(env.leftover_scratch(), 0);
    }

    #[tokio::test]
    async fn test_invalid_model_config_rejected_up_front() {
        let mut env = Env::new();
        env.config.model.model_id = String::new();
        let runtime = Arc::new(FakeRuntime::new());

        let err = env
            .orchestrator(runtime.clone(), summarizer())
            .run(&env.cwd, &["sales.xlsx"], "t")
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::Config(_)));
        assert!(runtime.calls().is_empty());
    }
}
