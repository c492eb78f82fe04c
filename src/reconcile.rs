//! Copies scratch outputs into the user's directory without ever
//! overwriting an existing file.

use crate::errors::SandboxError;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";
const MAX_NAME_ATTEMPTS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum CopyOutcome {
    Copied,
    Failed(String),
}

/// One file found in scratch at session end
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledArtifact {
    /// Path relative to the scratch directory, `/`-separated
    pub source_name: String,
    /// Path relative to the destination; differs from `source_name` after a collision
    pub destination_name: String,
    pub size_bytes: u64,
    pub outcome: CopyOutcome,
}

impl ReconciledArtifact {
    pub fn copied(&self) -> bool {
        self.outcome == CopyOutcome::Copied
    }

    pub fn renamed(&self) -> bool {
        self.source_name != self.destination_name
    }

    /// The copy failure as an error value
    pub fn error(&self) -> Option<SandboxError> {
        match &self.outcome {
            CopyOutcome::Copied => None,
            CopyOutcome::Failed(reason) => Some(SandboxError::ArtifactCopy {
                name: self.source_name.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// Best-effort per file: one failure never stops the rest
#[derive(Clone)]
pub struct Reconciler {
    clock: Clock,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            clock: Arc::new(Local::now),
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed clock for collision suffixes
    pub fn with_clock(clock: impl Fn() -> DateTime<Local> + Send + Sync + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
        }
    }

    /// Copy every file under `scratch` into `destination`, recreating
    /// subdirectories. A missing scratch directory yields no artifacts.
    pub fn reconcile(&self, scratch: &Path, destination: &Path) -> Vec<ReconciledArtifact> {
        let mut artifacts = Vec::new();
        if !scratch.is_dir() {
            info!("[RECONCILE] Scratch directory {:?} is gone; nothing to copy", scratch);
            return artifacts;
        }

        let stamp = (self.clock)().format(TIMESTAMP_FORMAT).to_string();
        self.walk(scratch, "", Ok(destination.to_path_buf()), "", &stamp, &mut artifacts);

        let copied = artifacts.iter().filter(|a| a.copied()).count();
        info!(
            "[RECONCILE] {} of {} artifact(s) copied to {:?}",
            copied,
            artifacts.len(),
            destination
        );
        artifacts
    }

    fn walk(
        &self,
        dir: &Path,
        rel: &str,
        dest_dir: std::result::Result<PathBuf, String>,
        dest_rel: &str,
        stamp: &str,
        out: &mut Vec<ReconciledArtifact>,
    ) {
        let mut entries = match fs::read_dir(dir).and_then(|rd| rd.collect::<io::Result<Vec<_>>>()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[RECONCILE] Cannot list {:?}: {}", dir, e);
                return;
            }
        };
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name();
            let display = name.to_string_lossy();
            let source_name = join_rel(rel, &display);
            let path = entry.path();
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    out.push(failed(source_name.clone(), source_name, 0, e.to_string()));
                    continue;
                }
            };

            if meta.is_dir() {
                let sub_dest = dest_dir
                    .clone()
                    .and_then(|d| ensure_dir(&d, &name, stamp).map_err(|e| e.to_string()));
                let sub_rel = match &sub_dest {
                    Ok(p) => join_rel(dest_rel, &p.file_name().unwrap_or(&name).to_string_lossy()),
                    Err(_) => join_rel(dest_rel, &display),
                };
                self.walk(&path, &source_name, sub_dest, &sub_rel, stamp, out);
            } else if meta.is_file() {
                let artifact = match &dest_dir {
                    Ok(d) => copy_file(&path, d, &name, source_name, dest_rel, meta.len(), stamp),
                    Err(reason) => failed(
                        source_name.clone(),
                        join_rel(dest_rel, &display),
                        meta.len(),
                        reason.clone(),
                    ),
                };
                out.push(artifact);
            } else {
                out.push(failed(
                    source_name.clone(),
                    source_name,
                    0,
                    "not a regular file".to_string(),
                ));
            }
        }
    }
}

fn copy_file(
    source: &Path,
    dest_dir: &Path,
    name: &std::ffi::OsStr,
    source_name: String,
    dest_rel: &str,
    size_bytes: u64,
    stamp: &str,
) -> ReconciledArtifact {
    let (dest_path, mut dest) = match create_unique(dest_dir, name, stamp, |p| {
        OpenOptions::new().write(true).create_new(true).open(p)
    }) {
        Ok(created) => created,
        Err(e) => {
            let intended = join_rel(dest_rel, &name.to_string_lossy());
            warn!("[RECONCILE] Failed to create {}: {}", intended, e);
            return failed(source_name, intended, size_bytes, e.to_string());
        }
    };
    let destination_name = join_rel(
        dest_rel,
        &dest_path.file_name().unwrap_or(name).to_string_lossy(),
    );

    let copied = File::open(source).and_then(|mut src| io::copy(&mut src, &mut dest));
    drop(dest);
    match copied {
        Ok(bytes) => {
            set_mode(&dest_path, 0o644);
            info!("[RECONCILE] Copied {} -> {}", source_name, destination_name);
            ReconciledArtifact {
                source_name,
                destination_name,
                size_bytes: bytes,
                outcome: CopyOutcome::Copied,
            }
        }
        Err(e) => {
            // Never leave a truncated file behind under the user's name
            let _ = fs::remove_file(&dest_path);
            warn!("[RECONCILE] Failed to copy {}: {}", source_name, e);
            failed(source_name, destination_name, size_bytes, e.to_string())
        }
    }
}

fn ensure_dir(parent: &Path, name: &std::ffi::OsStr, stamp: &str) -> io::Result<PathBuf> {
    let existing = parent.join(name);
    if fs::symlink_metadata(&existing).map(|m| m.is_dir()).unwrap_or(false) {
        return Ok(existing);
    }
    let (path, ()) = create_unique(parent, name, stamp, |p| fs::create_dir(p))?;
    set_mode(&path, 0o755);
    Ok(path)
}

/// Try `name`, then `stem_STAMP.ext`, then `stem_STAMP_N.ext`, creating
/// exclusively so an existing entry is never reused.
fn create_unique<T>(
    dir: &Path,
    name: &std::ffi::OsStr,
    stamp: &str,
    create: impl Fn(&Path) -> io::Result<T>,
) -> io::Result<(PathBuf, T)> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = dir.join(candidate_name(name, stamp, attempt));
        match create(&candidate) {
            Ok(created) => return Ok((candidate, created)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        ErrorKind::AlreadyExists,
        "no collision-free name available",
    ))
}

fn candidate_name(name: &std::ffi::OsStr, stamp: &str, attempt: usize) -> OsString {
    if attempt == 0 {
        return name.to_os_string();
    }
    let path = Path::new(name);
    let mut candidate = path.file_stem().unwrap_or(name).to_os_string();
    candidate.push("_");
    candidate.push(stamp);
    if attempt > 1 {
        candidate.push(format!("_{}", attempt - 1));
    }
    if let Some(ext) = path.extension() {
        candidate.push(".");
        candidate.push(ext);
    }
    candidate
}

fn failed(source_name: String, destination_name: String, size_bytes: u64, reason: String) -> ReconciledArtifact {
    ReconciledArtifact {
        source_name,
        destination_name,
        size_bytes,
        outcome: CopyOutcome::Failed(reason),
    }
}

fn join_rel(rel: &str, name: &str) -> String {
    if rel.is_empty() {
        name.to_string()
    } else {
        format!("{rel}/{name}")
    }
}

fn set_mode(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!("[RECONCILE] Failed to set permissions on {:?}: {}", path, e);
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed() -> Reconciler {
        Reconciler::with_clock(|| Local.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    fn dirs() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join("scratch");
        let dest = root.path().join("work");
        fs::create_dir_all(&scratch).unwrap();
        fs::create_dir_all(&dest).unwrap();
        (root, scratch, dest)
    }

    #[test]
    fn test_copies_verbatim_when_free() {
        let (_root, scratch, dest) = dirs();
        fs::write(scratch.join("summary.xlsx"), b"totals").unwrap();

        let artifacts = fixed().reconcile(&scratch, &dest);

        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].copied());
        assert!(!artifacts[0].renamed());
        assert_eq!(artifacts[0].size_bytes, 6);
        assert_eq!(fs::read(dest.join("summary.xlsx")).unwrap(), b"totals");
    }

    #[test]
    fn test_collision_gets_timestamp_suffix() {
        let (_root, scratch, dest) = dirs();
        fs::write(scratch.join("summary.xlsx"), b"new").unwrap();
        fs::write(dest.join("summary.xlsx"), b"old").unwrap();

        let artifacts = fixed().reconcile(&scratch, &dest);

        assert_eq!(artifacts[0].destination_name, "summary_20240101T000000.xlsx");
        assert_eq!(fs::read(dest.join("summary.xlsx")).unwrap(), b"old");
        assert_eq!(
            fs::read(dest.join("summary_20240101T000000.xlsx")).unwrap(),
            b"new"
        );
    }

    #[test]
    fn test_repeated_runs_never_overwrite() {
        let (_root, scratch, dest) = dirs();
        fs::write(scratch.join("chart.png"), b"png").unwrap();
        let reconciler = fixed();

        let names: Vec<String> = (0..3)
            .map(|_| reconciler.reconcile(&scratch, &dest)[0].destination_name.clone())
            .collect();

        assert_eq!(
            names,
            vec![
                "chart.png",
                "chart_20240101T000000.png",
                "chart_20240101T000000_1.png"
            ]
        );
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 3);
    }

    #[test]
    fn test_subdirectories_are_recreated() {
        let (_root, scratch, dest) = dirs();
        fs::create_dir_all(scratch.join("charts")).unwrap();
        fs::write(scratch.join("charts").join("q1.png"), b"1").unwrap();
        fs::write(scratch.join("notes"), b"n").unwrap();
        fs::write(dest.join("notes"), b"mine").unwrap();

        let artifacts = fixed().reconcile(&scratch, &dest);
        let names: Vec<_> = artifacts
            .iter()
            .map(|a| (a.source_name.as_str(), a.destination_name.as_str()))
            .collect();

        assert_eq!(
            names,
            vec![("charts/q1.png", "charts/q1.png"), ("notes", "notes_20240101T000000")]
        );
        assert!(dest.join("charts").join("q1.png").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_reported_not_followed() {
        let (root, scratch, dest) = dirs();
        fs::write(root.path().join("secret"), b"s").unwrap();
        std::os::unix::fs::symlink(root.path().join("secret"), scratch.join("leak")).unwrap();
        fs::write(scratch.join("ok.csv"), b"a").unwrap();

        let artifacts = fixed().reconcile(&scratch, &dest);

        assert_eq!(artifacts.len(), 2);
        assert_eq!(
            artifacts[0].outcome,
            CopyOutcome::Failed("not a regular file".to_string())
        );
        assert!(artifacts[1].copied());
        assert!(!dest.join("leak").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_copied_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let (_root, scratch, dest) = dirs();
        fs::write(scratch.join("out.txt"), b"x").unwrap();
        fs::set_permissions(scratch.join("out.txt"), fs::Permissions::from_mode(0o600)).unwrap();

        fixed().reconcile(&scratch, &dest);

        let mode = fs::metadata(dest.join("out.txt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_missing_scratch_yields_nothing() {
        let (root, _scratch, dest) = dirs();
        assert!(fixed().reconcile(&root.path().join("gone"), &dest).is_empty());
    }

    #[test]
    fn test_unwritable_destination_fails_per_file() {
        let (root, scratch, _dest) = dirs();
        fs::write(scratch.join("a.csv"), b"a").unwrap();
        fs::write(scratch.join("b.csv"), b"b").unwrap();

        let artifacts = fixed().reconcile(&scratch, &root.path().join("missing"));

        assert_eq!(artifacts.len(), 2);
        assert!(artifacts.iter().all(|a| !a.copied()));
    }
}
