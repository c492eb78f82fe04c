use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Application name, used for the config directory and image tag
pub const APP_NAME: &str = "analystbox";

/// Environment variable that overrides the config file location
pub const CONFIG_PATH_ENV: &str = "ANALYSTBOX_CONFIG";

/// Model backend the in-sandbox agent talks to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModelBackend {
    /// Hugging Face inference API
    #[serde(rename = "hfapi")]
    HfApi,
    /// Any provider reachable through LiteLLM
    #[serde(rename = "litellm")]
    LiteLlm,
}

impl ModelBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelBackend::HfApi => "hfapi",
            ModelBackend::LiteLlm => "litellm",
        }
    }
}

impl std::str::FromStr for ModelBackend {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hfapi" => Ok(ModelBackend::HfApi),
            "litellm" => Ok(ModelBackend::LiteLlm),
            other => Err(SandboxError::Config(format!(
                "unknown model type '{other}' (expected hfapi or litellm)"
            ))),
        }
    }
}

/// Model backend configuration, forwarded opaquely to the agent capability
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    #[serde(rename = "type")]
    pub backend: ModelBackend,
    pub model_id: String,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(SandboxError::Config("model_id must not be empty".to_string()));
        }
        Ok(())
    }

    /// Copy with the credential masked, for display
    pub fn redacted(&self) -> Self {
        Self {
            api_key: mask_secret(&self.api_key),
            ..self.clone()
        }
    }

    /// Environment handed to the sandbox so the agent can build its model client
    pub fn sandbox_env(&self) -> Vec<(String, String)> {
        vec![
            ("MODEL_TYPE".to_string(), self.backend.as_str().to_string()),
            ("MODEL_ID".to_string(), self.model_id.clone()),
            ("MODEL_API_KEY".to_string(), self.api_key.clone()),
            (
                "MODEL_API_BASE".to_string(),
                self.api_base.clone().unwrap_or_default(),
            ),
        ]
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("backend", &self.backend)
            .field("model_id", &self.model_id)
            .field("api_key", &mask_secret(&self.api_key))
            .field("api_base", &self.api_base)
            .finish()
    }
}

fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("{visible}****")
    }
}

/// Which container runtime binary to drive
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimePreference {
    /// Prefer podman, fall back to docker
    #[default]
    Auto,
    Podman,
    Docker,
}

impl RuntimePreference {
    /// Candidate binaries in lookup order
    pub fn candidates(&self) -> &'static [&'static str] {
        match self {
            RuntimePreference::Auto => &["podman", "docker"],
            RuntimePreference::Podman => &["podman"],
            RuntimePreference::Docker => &["docker"],
        }
    }
}

/// Settings for the isolated execution environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxSettings {
    /// Pre-built image the agent runs in
    pub image: String,
    /// Container runtime to use
    pub runtime: RuntimePreference,
    /// Host directory under which per-session scratch directories are created
    pub scratch_base: PathBuf,
    /// Directory inside the sandbox where inputs are mounted read-only
    pub source_mount_root: String,
    /// Writable scratch directory inside the sandbox
    pub scratch_mount: String,
    /// Read-only directory inside the sandbox holding the write guard bootstrap
    pub guard_mount: String,
    /// Grace period given to the container on stop
    pub stop_timeout_secs: u64,
    /// Modules the agent may import; the image ships exactly these
    pub authorized_imports: Vec<String>,
}

/// Per user: the platform cache dir, or the temp dir when there is none
fn default_scratch_base() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
        .join("sessions")
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: format!("{APP_NAME}:{}", env!("CARGO_PKG_VERSION")),
            runtime: RuntimePreference::Auto,
            scratch_base: default_scratch_base(),
            source_mount_root: "/source_files".to_string(),
            scratch_mount: "/analyst/output".to_string(),
            guard_mount: "/opt/analyst/guard".to_string(),
            stop_timeout_secs: 5,
            authorized_imports: [
                "os",
                "posixpath",
                "numpy",
                "pandas",
                "matplotlib",
                "matplotlib.pyplot",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Everything read from the config file, once per invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(flatten)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sandbox: SandboxSettings,
}

impl AppConfig {
    pub fn new(model: ModelConfig) -> Self {
        Self {
            model,
            sandbox: SandboxSettings::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SandboxError::Config(format!(
                "configuration file not found ({}); run `analyst conf set` first",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.model.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.model.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!("Wrote configuration file: {:?}", path);
        Ok(())
    }
}

/// Location of the config file: `$ANALYSTBOX_CONFIG`, else the user config dir
pub fn config_path() -> Result<PathBuf> {
    if let Ok(v) = std::env::var(CONFIG_PATH_ENV) {
        let trimmed = v.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_NAME).join("config.json"))
        .ok_or_else(|| SandboxError::Config("no user config directory on this platform".to_string()))
}

/// Delete the config file; returns false when there was nothing to delete
pub fn delete(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelConfig {
        ModelConfig {
            backend: ModelBackend::LiteLlm,
            model_id: "gpt-4o".to_string(),
            api_key: "sk-abcdefghijkl".to_string(),
            api_base: Some("https://api.example.com".to_string()),
        }
    }

    #[test]
    fn test_reads_flat_legacy_file() {
        let json = r#"{"type": "hfapi", "model_id": "Qwen/Qwen2.5-Coder", "api_key": "hf_x", "api_base": ""}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.model.backend, ModelBackend::HfApi);
        assert_eq!(config.sandbox, SandboxSettings::default());
    }

    #[test]
    fn test_save_load_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = AppConfig::new(model());
        config.save(&path).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), config);

        assert!(delete(&path).unwrap());
        assert!(!delete(&path).unwrap());
        assert!(matches!(AppConfig::load(&path), Err(SandboxError::Config(_))));
    }

    #[test]
    fn test_debug_and_redacted_hide_key() {
        let m = model();
        assert!(!format!("{:?}", m).contains("abcdefghijkl"));
        assert_eq!(m.redacted().api_key, "sk-a****");
    }

    #[test]
    fn test_empty_model_id_rejected() {
        let mut m = model();
        m.model_id = "  ".to_string();
        assert!(m.validate().is_err());
        assert!("LiteLLM".parse::<ModelBackend>().is_ok());
        assert!("openai".parse::<ModelBackend>().is_err());
    }
}
