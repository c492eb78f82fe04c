//! Container runtime lifecycle: start from image with bind mounts, wait,
//! stop, remove.

use crate::config::SandboxSettings;
use crate::errors::{Result, SandboxError};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A bind mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }
}

/// Everything needed to start one sandbox container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub mounts: Vec<Mount>,
    /// Passed through a private env file, never on the command line
    pub env: Vec<(String, String)>,
    pub workdir: String,
    /// Overrides the image entrypoint command when non-empty
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// Terminal state of a container plus everything it printed
#[derive(Debug, Clone, Default)]
pub struct ContainerExit {
    pub status_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ContainerExit {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

/// Minimal lifecycle contract the session driver needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime name for logs
    fn name(&self) -> &str;

    /// Whether the container process runs as the invoking host user, so
    /// bind mounts need no permissions beyond the owner's
    fn maps_host_user(&self) -> bool {
        false
    }

    /// Start a detached container. Fails with `EnvironmentUnavailable` when
    /// the image is missing or the runtime refuses to start it.
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Block until the container exits, handing each output line to `on_line`
    async fn wait(
        &self,
        handle: &ContainerHandle,
        on_line: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> Result<ContainerExit>;

    /// Stop the container; a container that is already gone is not an error
    async fn stop(&self, handle: &ContainerHandle) -> Result<()>;

    /// Remove the container; a container that is already gone is not an error
    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFlavor {
    Podman,
    Docker,
}

impl RuntimeFlavor {
    fn from_binary(path: &Path) -> Self {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if stem.contains("podman") {
            RuntimeFlavor::Podman
        } else {
            RuntimeFlavor::Docker
        }
    }
}

/// Drives the `podman` or `docker` command line
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: PathBuf,
    flavor: RuntimeFlavor,
    stop_timeout: Duration,
}

impl CliRuntime {
    pub fn new(binary: impl Into<PathBuf>, stop_timeout: Duration) -> Self {
        let binary = binary.into();
        Self {
            flavor: RuntimeFlavor::from_binary(&binary),
            binary,
            stop_timeout,
        }
    }

    /// Locate a runtime binary according to the configured preference
    pub fn detect(settings: &SandboxSettings) -> Result<Self> {
        let candidates = settings.runtime.candidates();
        for name in candidates {
            if let Ok(path) = which::which(name) {
                info!("[RUNTIME] Using container runtime: {:?}", path);
                return Ok(Self::new(
                    path,
                    Duration::from_secs(settings.stop_timeout_secs),
                ));
            }
        }
        Err(SandboxError::EnvironmentUnavailable(format!(
            "no container runtime found (looked for {})",
            candidates.join(", ")
        )))
    }

    pub fn flavor(&self) -> RuntimeFlavor {
        self.flavor
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    async fn output(&self, args: &[&str]) -> Result<std::process::Output> {
        self.command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                SandboxError::EnvironmentUnavailable(format!(
                    "failed to invoke {}: {e}",
                    self.binary.display()
                ))
            })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let probe = match self.flavor {
            RuntimeFlavor::Podman => "exists",
            RuntimeFlavor::Docker => "inspect",
        };
        let output = self.output(&["image", probe, image]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::EnvironmentUnavailable(format!(
                "image '{image}' is not available locally; build it before running a session"
            )))
        }
    }

    /// Arguments for `run`; the environment travels in `env_file`
    pub fn run_args(&self, spec: &ContainerSpec, env_file: &Path) -> Result<Vec<String>> {
        let mut args: Vec<String> = [
            "run",
            "-d",
            "--name",
            spec.name.as_str(),
            "--read-only",
            "--tmpfs",
            "/tmp",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if self.flavor == RuntimeFlavor::Podman {
            args.push("--userns=keep-id".to_string());
        }

        args.push("--env-file".to_string());
        args.push(env_file.display().to_string());
        args.push("-e".to_string());
        args.push("PYTHONDONTWRITEBYTECODE=1".to_string());
        args.push("-w".to_string());
        args.push(spec.workdir.clone());

        for mount in &spec.mounts {
            let host = mount.host.to_str().filter(|h| !h.contains(':')).ok_or_else(|| {
                SandboxError::invalid_input(&mount.host, "path cannot be expressed as a bind mount")
            })?;
            let mode = if mount.read_only { "ro" } else { "rw" };
            args.push("-v".to_string());
            args.push(format!("{host}:{}:{mode}", mount.container));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        Ok(args)
    }

    async fn ignore_missing(&self, action: &str, args: &[&str]) -> Result<()> {
        let output = self.output(args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("no such container") {
            debug!("[RUNTIME] {} skipped, container already gone", action);
            return Ok(());
        }
        Err(SandboxError::EnvironmentUnavailable(format!(
            "{action} failed: {}",
            stderr.trim()
        )))
    }
}

/// Write the container environment to a private file for `--env-file`.
/// The file is created 0600 and removed when the returned handle drops.
pub fn write_env_file(env: &[(String, String)]) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("analystbox-env-")
        .tempfile()?;
    for (key, value) in env {
        if key.contains('=') || key.contains('\n') || value.contains('\n') {
            return Err(SandboxError::Config(format!(
                "environment entry {key} cannot be passed to the sandbox"
            )));
        }
        writeln!(file, "{key}={value}")?;
    }
    file.flush()?;
    Ok(file)
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        match self.flavor {
            RuntimeFlavor::Podman => "podman",
            RuntimeFlavor::Docker => "docker",
        }
    }

    fn maps_host_user(&self) -> bool {
        // podman runs with --userns=keep-id
        self.flavor == RuntimeFlavor::Podman
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.ensure_image(&spec.image).await?;

        let env_file = write_env_file(&spec.env)?;
        let args = self.run_args(spec, env_file.path())?;
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self.output(&arg_refs).await?;
        drop(env_file);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // run -d can leave a created-but-not-started container behind
            let _ = self.output(&["rm", "-f", spec.name.as_str()]).await;
            return Err(SandboxError::EnvironmentUnavailable(format!(
                "container failed to start: {stderr}"
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or(spec.name.as_str())
            .to_string();

        info!(
            "[RUNTIME] Started container {} ({}) from {}",
            spec.name,
            &id[..id.len().min(12)],
            spec.image
        );

        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn wait(
        &self,
        handle: &ContainerHandle,
        on_line: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> Result<ContainerExit> {
        let mut cmd = self.command();
        cmd.args(["logs", "--follow", handle.id.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let mut follower = LogFollower::new(child.id());

        let mut exit = ContainerExit::default();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(SandboxError::EnvironmentUnavailable(
                "log stream unavailable".to_string(),
            ));
        };
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => match line? {
                    Some(line) => {
                        debug!("[CONTAINER] {}", line);
                        on_line(&line);
                        exit.stdout.push_str(&line);
                        exit.stdout.push('\n');
                    }
                    None => out_done = true,
                },
                line = err_lines.next_line(), if !err_done => match line? {
                    Some(line) => {
                        debug!("[CONTAINER] {}", line);
                        on_line(&line);
                        exit.stderr.push_str(&line);
                        exit.stderr.push('\n');
                    }
                    None => err_done = true,
                },
            }
        }
        child.wait().await?;
        follower.disarm();

        let output = self.output(&["wait", handle.id.as_str()]).await?;
        let status = String::from_utf8_lossy(&output.stdout);
        exit.status_code = status
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .and_then(|l| l.parse().ok())
            .ok_or_else(|| {
                SandboxError::AgentExecution(format!(
                    "could not read exit status of container {}: {}",
                    handle.name,
                    String::from_utf8_lossy(&output.stderr).trim()
                ))
            })?;

        info!(
            "[RUNTIME] Container {} exited with status {}",
            handle.name, exit.status_code
        );
        Ok(exit)
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        let timeout = self.stop_timeout.as_secs().to_string();
        self.ignore_missing("stop", &["stop", "-t", timeout.as_str(), handle.id.as_str()])
            .await?;
        info!("[RUNTIME] Stopped container {}", handle.name);
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.ignore_missing("remove", &["rm", "-f", handle.id.as_str()]).await?;
        info!("[RUNTIME] Removed container {}", handle.name);
        Ok(())
    }
}

/// Kills the whole `logs --follow` process group if waiting is abandoned
struct LogFollower {
    pid: Option<u32>,
}

impl LogFollower {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for LogFollower {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid.take() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    warn!("[RUNTIME] Failed to kill log follower {}: {}", pid, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "analystbox:test".to_string(),
            name: "analyst-1234".to_string(),
            mounts: vec![
                Mount::read_only("/home/u/work/sales.xlsx", "/source_files/sales.xlsx"),
                Mount::read_write("/tmp/analystbox-sessions/session-1", "/analyst/output"),
            ],
            env: vec![("MODEL_API_KEY".to_string(), "sk-secret".to_string())],
            workdir: "/analyst/output".to_string(),
            command: vec![],
        }
    }

    #[test]
    fn test_flavor_from_binary() {
        assert_eq!(
            CliRuntime::new("/usr/bin/podman", Duration::from_secs(1)).flavor(),
            RuntimeFlavor::Podman
        );
        assert_eq!(
            CliRuntime::new("/usr/local/bin/docker", Duration::from_secs(1)).flavor(),
            RuntimeFlavor::Docker
        );
    }

    #[test]
    fn test_run_args_are_hardened_and_secret_free() {
        let runtime = CliRuntime::new("/usr/bin/podman", Duration::from_secs(5));
        let args = runtime
            .run_args(&spec(), Path::new("/tmp/analystbox-env-x"))
            .unwrap();
        let joined = args.join(" ");

        for flag in [
            "--read-only",
            "--cap-drop ALL",
            "--security-opt no-new-privileges",
            "--tmpfs /tmp",
            "--userns=keep-id",
            "--env-file /tmp/analystbox-env-x",
            "-w /analyst/output",
            "-v /home/u/work/sales.xlsx:/source_files/sales.xlsx:ro",
            "-v /tmp/analystbox-sessions/session-1:/analyst/output:rw",
        ] {
            assert!(joined.contains(flag), "missing {flag} in {joined}");
        }
        assert!(!joined.contains("sk-secret"));
        assert_eq!(args.last().map(String::as_str), Some("analystbox:test"));
    }

    #[test]
    fn test_docker_has_no_userns_and_colon_paths_rejected() {
        let runtime = CliRuntime::new("/usr/bin/docker", Duration::from_secs(5));
        let args = runtime.run_args(&spec(), Path::new("/tmp/env")).unwrap();
        assert!(!args.iter().any(|a| a.starts_with("--userns")));
        assert!(!runtime.maps_host_user());
        assert!(CliRuntime::new("/usr/bin/podman", Duration::from_secs(5)).maps_host_user());

        let mut bad = spec();
        bad.mounts.push(Mount::read_only("/home/u/a:b.csv", "/source_files/a:b.csv"));
        assert!(matches!(
            runtime.run_args(&bad, Path::new("/tmp/env")),
            Err(SandboxError::InvalidInputPath { .. })
        ));
    }

    #[test]
    fn test_env_file_is_private() {
        let file = write_env_file(&[
            ("MODEL_ID".to_string(), "gpt-4o".to_string()),
            ("MODEL_API_BASE".to_string(), String::new()),
        ])
        .unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "MODEL_ID=gpt-4o\nMODEL_API_BASE=\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_env_file_rejects_multiline_values() {
        let err = write_env_file(&[("ANALYST_PROMPT".to_string(), "a\nb".to_string())]);
        assert!(matches!(err, Err(SandboxError::Config(_))));
    }
}
