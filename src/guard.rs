//! Write-scope guard.
//!
//! One policy, two enforcement points:
//!
//! * [`WriteScopeGuard`] evaluates write attempts against a scratch root on the
//!   filesystem view it runs in, and journals every denial.
//! * [`GuardBundle`] renders the same policy as an interpreter start-up hook
//!   (`sitecustomize.py` registering a `sys.addaudithook`), mounted read-only
//!   into the sandbox. Audit hooks cannot be removed once installed and see
//!   `open`/`os.*` events from every library, not just the ones we know about.
//!   Starting processes and loading foreign native libraries are refused
//!   outright, since neither is visible to the hook afterwards. Metadata
//!   changes (`chmod`, `utime`, ...) and removals only need to stay in scope.
//!   Each denial is printed as a [`DENIAL_MARKER`] line tagged with the
//!   session token so the host can journal it.

use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Prefix of the stderr line the in-sandbox hook emits for each denial
pub const DENIAL_MARKER: &str = "ANALYST_GUARD_DENIED";

/// Outcome of evaluating one write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDecision {
    Allowed,
    DeniedOutsideScope,
    DeniedOverwrite,
}

impl WriteDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, WriteDecision::Allowed)
    }
}

impl fmt::Display for WriteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteDecision::Allowed => "allowed",
            WriteDecision::DeniedOutsideScope => "outside the scratch directory",
            WriteDecision::DeniedOverwrite => "would overwrite an existing file",
        })
    }
}

/// An intercepted write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAttempt {
    /// Path as requested by the generated code
    pub target: PathBuf,
    /// Absolute path after resolving `..` and symlinks
    pub resolved: PathBuf,
    pub decision: WriteDecision,
    /// Interposed operation (`open`, `os.rename`, ...), when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl fmt::Display for WriteAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.target.display(), self.decision)?;
        if let Some(op) = &self.operation {
            write!(f, " via {op}")?;
        }
        Ok(())
    }
}

/// Host-side evaluator for the write-scope policy
#[derive(Debug)]
pub struct WriteScopeGuard {
    scratch_root: PathBuf,
    denials: Mutex<Vec<WriteAttempt>>,
}

impl WriteScopeGuard {
    pub fn new(scratch_root: &Path) -> Result<Self> {
        Ok(Self {
            scratch_root: scratch_root.canonicalize()?,
            denials: Mutex::new(Vec::new()),
        })
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Decide a write to `target`; relative targets are taken from the
    /// scratch root, which is the sandbox's working directory.
    pub fn evaluate(&self, target: &Path) -> WriteAttempt {
        let resolved = resolve_target(&self.scratch_root, target);
        let decision = if !resolved.starts_with(&self.scratch_root) {
            WriteDecision::DeniedOutsideScope
        } else if std::fs::symlink_metadata(&resolved).is_ok() {
            WriteDecision::DeniedOverwrite
        } else {
            WriteDecision::Allowed
        };
        WriteAttempt {
            target: target.to_path_buf(),
            resolved,
            decision,
            operation: None,
        }
    }

    /// Evaluate and fail with [`SandboxError::WriteDenied`] unless allowed.
    /// Returns the resolved path to write to.
    pub fn check(&self, target: &Path) -> Result<PathBuf> {
        let attempt = self.evaluate(target);
        if attempt.decision.is_allowed() {
            Ok(attempt.resolved)
        } else {
            Err(self.deny(attempt))
        }
    }

    /// Create a new file inside scope. Never truncates: a file appearing
    /// between the check and the open is still refused.
    pub fn create_file(&self, target: impl AsRef<Path>) -> Result<File> {
        let target = target.as_ref();
        let resolved = self.check(target)?;
        match OpenOptions::new().write(true).create_new(true).open(&resolved) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(self.deny(WriteAttempt {
                target: target.to_path_buf(),
                resolved,
                decision: WriteDecision::DeniedOverwrite,
                operation: Some("open".to_string()),
            })),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a new directory inside scope
    pub fn create_dir(&self, target: impl AsRef<Path>) -> Result<()> {
        let target = target.as_ref();
        let resolved = self.check(target)?;
        match std::fs::create_dir(&resolved) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(self.deny(WriteAttempt {
                target: target.to_path_buf(),
                resolved,
                decision: WriteDecision::DeniedOverwrite,
                operation: Some("os.mkdir".to_string()),
            })),
            Err(e) => Err(e.into()),
        }
    }

    /// Journal a denial reported from inside the sandbox
    pub fn record(&self, attempt: WriteAttempt) {
        warn!("[GUARD] Denied write: {}", attempt);
        self.journal().push(attempt);
    }

    /// Every denial seen so far, in order
    pub fn denials(&self) -> Vec<WriteAttempt> {
        self.journal().clone()
    }

    fn deny(&self, attempt: WriteAttempt) -> SandboxError {
        self.record(attempt.clone());
        SandboxError::WriteDenied(attempt)
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, Vec<WriteAttempt>> {
        self.denials.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolve `target` the way the kernel would: symlinks in the existing part
/// of the path are followed, the not-yet-existing tail is normalised lexically.
fn resolve_target(base: &Path, target: &Path) -> PathBuf {
    let absolute = if target.is_absolute() {
        target.to_path_buf()
    } else {
        base.join(target)
    };
    let components: Vec<Component> = absolute.components().collect();

    for split in (1..=components.len()).rev() {
        let head: PathBuf = components[..split].iter().collect();
        if let Ok(real) = head.canonicalize() {
            return push_lexically(real, &components[split..]);
        }
    }
    push_lexically(PathBuf::new(), &components)
}

fn push_lexically(mut path: PathBuf, rest: &[Component]) -> PathBuf {
    for component in rest {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                path.pop();
            }
            other => path.push(other.as_os_str()),
        }
    }
    path
}

/// Parse one line of sandbox output; `Some` when it is a denial record
/// carrying this session's token
pub fn parse_denial_line(line: &str, session_token: &str) -> Option<WriteAttempt> {
    let payload = line
        .trim()
        .strip_prefix(DENIAL_MARKER)?
        .trim_start()
        .strip_prefix(session_token)?;
    if !payload.starts_with(char::is_whitespace) {
        return None;
    }
    serde_json::from_str(payload.trim()).ok()
}

const BOOTSTRAP_TEMPLATE: &str = r#"# Write-scope guard, installed at interpreter start-up.
import json as _json
import os as _os
import sys as _sys

# Bound once so later monkey-patching of os.path cannot change the policy.
_realpath = _os.path.realpath
_lexists = _os.path.lexists
_isdir = _os.path.isdir
_join = _os.path.join
_getcwd = _os.getcwd
_fsdecode = _os.fsdecode
_stderr = _sys.__stderr__

_SCRATCH = _realpath(__SCRATCH__)
_MARKER = __MARKER__
_WRITE_FLAGS = _os.O_WRONLY | _os.O_RDWR | _os.O_CREAT | _os.O_TRUNC | _os.O_APPEND
_DEVNULL = _os.devnull

# event -> (indexes that must not exist yet, indexes that only need to be in scope)
_PATH_EVENTS = {
    "os.mkdir": ((0,), ()),
    "os.rename": ((1,), (0,)),
    "os.truncate": ((0,), ()),
    "os.symlink": ((1,), ()),
    "os.link": ((1,), ()),
    "os.remove": ((), (0,)),
    "os.rmdir": ((), (0,)),
    "os.chmod": ((), (0,)),
    "os.chown": ((), (0,)),
    "os.utime": ((), (0,)),
    "os.setxattr": ((), (0,)),
    "os.removexattr": ((), (0,)),
    "shutil.rmtree": ((), (0,)),
}

# A child process or foreign native code is not seen by this hook.
# event -> index of the argument naming what was launched
_PROCESS_EVENTS = {
    "os.system": 0,
    "os.exec": 0,
    "os.posix_spawn": 0,
    "os.spawn": 1,
    "os.fork": None,
    "os.forkpty": None,
    "subprocess.Popen": 1,
}


def _resolve(path):
    if path is None or isinstance(path, int):
        return None
    try:
        path = _fsdecode(path)
    except TypeError:
        return None
    return _realpath(_join(_getcwd(), path))


def _decide(resolved, must_be_new, dirs_ok):
    if resolved != _SCRATCH and not resolved.startswith(_SCRATCH + _os.sep):
        return "denied_outside_scope"
    if must_be_new and _lexists(resolved) and not (dirs_ok and _isdir(resolved)):
        return "denied_overwrite"
    return "allowed"


def _report(event, target, resolved, decision):
    if isinstance(target, bytes):
        target = target.decode("utf-8", "replace")
    record = {
        "operation": event,
        "target": str(target),
        "resolved": resolved,
        "decision": decision,
    }
    try:
        _stderr.write(_MARKER + " " + _json.dumps(record) + "\n")
        _stderr.flush()
    except Exception:
        pass


def _check(event, path, must_be_new, dirs_ok=False):
    resolved = _resolve(path)
    if resolved is None:
        return
    decision = _decide(resolved, must_be_new, dirs_ok)
    if decision == "allowed":
        return
    _report(event, path, resolved, decision)
    if decision == "denied_overwrite":
        raise FileExistsError(
            "Can't overwrite existing file ('%s'); write to a new name inside %s" % (path, _SCRATCH)
        )
    raise PermissionError(
        "Writing outside %s is not permitted ('%s')" % (_SCRATCH, path)
    )


def _refuse(event, target):
    _report(event, target, "", "denied_outside_scope")
    raise PermissionError("%s is not permitted in the sandbox (%s)" % (event, target))


def _native_allowed(event, args):
    # import ctypes opens the interpreter itself; its Py* symbols are harmless
    if event == "ctypes.dlopen":
        return args[0] is None
    name = args[1] if len(args) > 1 else None
    return isinstance(name, str) and name.startswith(("Py", "_Py"))


def _write_guard(event, args):
    if event == "open":
        if not args:
            return
        mode = args[1] if len(args) > 1 else None
        flags = args[2] if len(args) > 2 else 0
        writes = isinstance(mode, str) and any(c in mode for c in "wax+")
        if not writes and isinstance(flags, int) and flags & _WRITE_FLAGS:
            writes = True
        if not writes or args[0] == _DEVNULL:
            return
        # A directory opened for writing can only yield an unnamed O_TMPFILE inode
        _check(event, args[0], True, True)
        return
    if event in _PROCESS_EVENTS:
        index = _PROCESS_EVENTS[event]
        target = args[index] if index is not None and index < len(args) else ""
        _refuse(event, target)
    if event in ("ctypes.dlopen", "ctypes.dlsym", "ctypes.dlsym/handle"):
        if not _native_allowed(event, args):
            _refuse(event, args[-1] if args else "")
        return
    spec = _PATH_EVENTS.get(event)
    if spec is None:
        return
    must_be_new, in_scope = spec
    for index in in_scope:
        if index < len(args):
            _check(event, args[index], False)
    for index in must_be_new:
        if index < len(args):
            _check(event, args[index], True)


_sys.addaudithook(_write_guard)
"#;

/// Render the in-sandbox hook for a scratch directory at `scratch_mount`.
/// Denial lines carry `session_token` so output printed by generated code
/// cannot pass for one.
pub fn bootstrap_script(scratch_mount: &str, session_token: &str) -> String {
    let quote = |s: &str| serde_json::to_string(s).unwrap_or_else(|_| format!("'{s}'"));
    BOOTSTRAP_TEMPLATE
        .replace("__SCRATCH__", &quote(scratch_mount))
        .replace("__MARKER__", &quote(&format!("{DENIAL_MARKER} {session_token}")))
}

/// A host directory holding the rendered hook, bound read-only into the sandbox
/// and put on `PYTHONPATH` there. Removed on drop.
#[derive(Debug)]
pub struct GuardBundle {
    dir: tempfile::TempDir,
}

impl GuardBundle {
    pub const ENTRYPOINT: &'static str = "sitecustomize.py";

    pub fn write(scratch_mount: &str, session_token: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("analystbox-guard-")
            .tempdir()?;
        let entry = dir.path().join(Self::ENTRYPOINT);
        std::fs::write(&entry, bootstrap_script(scratch_mount, session_token))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755))?;
            std::fs::set_permissions(&entry, std::fs::Permissions::from_mode(0o644))?;
        }

        Ok(Self { dir })
    }

    pub fn host_dir(&self) -> &Path {
        self.dir.path()
    }
}
