//! Workspace staging: decides which host files the sandbox may see and
//! creates the one writable scratch directory for a session.

use crate::errors::{Result, SandboxError};
use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// A user-supplied file exposed read-only inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    /// Canonical host path
    pub source: PathBuf,
    /// Path relative to the working directory, `/`-separated
    pub mount_name: String,
}

impl InputFile {
    /// Where this file appears inside the sandbox
    pub fn sandbox_path(&self, source_mount_root: &str) -> String {
        join_sandbox_path(source_mount_root, &self.mount_name)
    }
}

/// The per-session writable directory on the host
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl ScratchDir {
    /// Create a fresh, uniquely named directory under `base`.
    ///
    /// `base` is created 0o700 if missing and must belong to the current
    /// user. `shared` opens the session directory to every uid, for runtimes
    /// whose container user is not the host user; the private base still
    /// keeps other local users out.
    pub fn new(base: &Path, shared: bool) -> Result<Self> {
        let base = private_base(base)?;

        // create_dir (not create_dir_all) fails on an existing name, so a
        // successful call proves the directory is ours alone.
        let path = loop {
            let candidate = base.join(format!("session-{}", uuid::Uuid::new_v4()));
            match std::fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if shared { 0o777 } else { 0o700 };
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        }

        info!("[STAGER] Created scratch directory: {:?}", path);

        Ok(Self {
            path,
            cleanup_on_drop: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Remove the directory and everything in it
    pub fn discard(&mut self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_dir_all(&self.path)?;
            info!("[STAGER] Removed scratch directory: {:?}", self.path);
        }
        self.cleanup_on_drop = false;
        Ok(())
    }

    /// Keep the directory (don't cleanup on drop)
    pub fn keep(&mut self) {
        self.cleanup_on_drop = false;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.cleanup_on_drop && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(
                    "[STAGER] Failed to cleanup scratch directory {:?}: {}",
                    self.path, e
                );
            }
        }
    }
}

/// Create `base` if needed and make sure no other local user can reach into it
#[cfg(unix)]
fn private_base(base: &Path) -> Result<PathBuf> {
    use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(base)?;
    let base = base.canonicalize()?;
    let meta = std::fs::metadata(&base)?;

    if !meta.is_dir() || meta.uid() != nix::unistd::geteuid().as_raw() {
        return Err(SandboxError::Config(format!(
            "scratch base {} must be a directory owned by the current user",
            base.display()
        )));
    }
    if meta.mode() & 0o077 != 0 {
        warn!(
            "[STAGER] Scratch base {:?} was mode {:o}; restricting to 0700",
            base,
            meta.mode() & 0o777
        );
        std::fs::set_permissions(&base, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(base)
}

#[cfg(not(unix))]
fn private_base(base: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(base)?;
    Ok(base.canonicalize()?)
}

/// Everything exposed to one sandbox: read-only inputs plus one scratch directory
#[derive(Debug)]
pub struct MountPlan {
    pub working_dir: PathBuf,
    pub inputs: Vec<InputFile>,
    pub scratch: ScratchDir,
}

impl MountPlan {
    /// Manifest of input names as the sandbox sees them
    pub fn manifest(&self, source_mount_root: &str, scratch_mount: &str) -> FileManifest {
        FileManifest {
            inputs: self
                .inputs
                .iter()
                .map(|input| ManifestEntry {
                    mount_name: input.mount_name.clone(),
                    sandbox_path: input.sandbox_path(source_mount_root),
                    size_bytes: std::fs::metadata(&input.source).ok().map(|m| m.len()),
                })
                .collect(),
            output_dir: scratch_mount.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub mount_name: String,
    pub sandbox_path: String,
    pub size_bytes: Option<u64>,
}

/// File-name manifest injected into the sandbox so the agent never has to
/// discover its inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub inputs: Vec<ManifestEntry>,
    pub output_dir: String,
}

impl FileManifest {
    /// Base64 JSON, safe to pass through an environment variable
    pub fn encode(&self) -> Result<String> {
        Ok(b64.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = b64
            .decode(encoded.trim())
            .map_err(|e| SandboxError::Config(format!("invalid manifest encoding: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Builds mount plans, creating scratch directories under `scratch_base`
#[derive(Debug, Clone)]
pub struct Stager {
    scratch_base: PathBuf,
    shared_scratch: bool,
}

impl Stager {
    pub fn new(scratch_base: impl Into<PathBuf>) -> Self {
        Self {
            scratch_base: scratch_base.into(),
            shared_scratch: true,
        }
    }

    /// Whether scratch directories must be writable by a container user
    /// other than the host user
    pub fn with_shared_scratch(mut self, shared: bool) -> Self {
        self.shared_scratch = shared;
        self
    }

    /// Validate `input_paths` against `working_dir` and build the mount plan.
    ///
    /// Relative inputs are resolved against `working_dir`. Every input must
    /// resolve (symlinks followed) to a regular file at or below the working
    /// directory. No scratch directory is created unless every input passes.
    pub fn prepare<P: AsRef<Path>>(&self, working_dir: &Path, input_paths: &[P]) -> Result<MountPlan> {
        let working_dir = working_dir.canonicalize().map_err(|e| {
            SandboxError::invalid_input(working_dir, format!("working directory unusable: {e}"))
        })?;

        let mut inputs: Vec<InputFile> = Vec::new();
        let mut by_mount_name: HashMap<String, PathBuf> = HashMap::new();

        for raw in input_paths {
            let raw = raw.as_ref();
            let input = resolve_input(&working_dir, raw)?;

            match by_mount_name.get(&input.mount_name) {
                Some(existing) if *existing == input.source => continue,
                Some(existing) => {
                    return Err(SandboxError::invalid_input(
                        raw,
                        format!(
                            "mount name '{}' is already taken by {}",
                            input.mount_name,
                            existing.display()
                        ),
                    ))
                }
                None => {}
            }

            by_mount_name.insert(input.mount_name.clone(), input.source.clone());
            inputs.push(input);
        }

        let scratch = ScratchDir::new(&self.scratch_base, self.shared_scratch)?;
        if let Some(input) = inputs
            .iter()
            .find(|i| i.source.starts_with(scratch.path()) || scratch.path().starts_with(&i.source))
        {
            // ScratchDir's Drop removes the directory we just made.
            return Err(SandboxError::invalid_input(
                &input.source,
                "aliases the scratch directory",
            ));
        }

        info!(
            "[STAGER] Mount plan ready: {} input(s), scratch {:?}",
            inputs.len(),
            scratch.path()
        );

        Ok(MountPlan {
            working_dir,
            inputs,
            scratch,
        })
    }
}

fn resolve_input(working_dir: &Path, raw: &Path) -> Result<InputFile> {
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        working_dir.join(raw)
    };

    let source = joined.canonicalize().map_err(|e| {
        let reason = if e.kind() == std::io::ErrorKind::NotFound {
            "file not found".to_string()
        } else {
            format!("cannot resolve: {e}")
        };
        SandboxError::invalid_input(raw, reason)
    })?;

    let relative = source.strip_prefix(working_dir).map_err(|_| {
        SandboxError::invalid_input(raw, "resolves outside the working directory")
    })?;

    if !source.is_file() {
        return Err(SandboxError::invalid_input(raw, "not a regular file"));
    }

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                SandboxError::invalid_input(raw, "path is not valid UTF-8")
            })?),
            // canonicalize() leaves only normal components below the prefix
            _ => return Err(SandboxError::invalid_input(raw, "unexpected path component")),
        }
    }

    let mount_name = parts.join("/");
    Ok(InputFile { source, mount_name })
}

pub(crate) fn join_sandbox_path(root: &str, name: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), name.trim_start_matches('/'))
}
