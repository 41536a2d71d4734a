use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::{IssueCategory, Label, RelevanceLabel};

pub const DEFAULT_TEMPERATURE: f32 = 0.0;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 512;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LANGFUSE_HOST: &str = "https://cloud.langfuse.com";

/// A model the runner is allowed to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub display_name: &'static str,
    /// Used in run directory names
    pub short_name: &'static str,
}

/// The models accepted by the pre-run gate.
pub const SUPPORTED_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "gemini-2.0-flash-001",
        display_name: "Gemini 2.0 Flash (Stable)",
        short_name: "2.0-flash-001",
    },
    ModelInfo {
        id: "gemini-2.0-flash",
        display_name: "Gemini 2.0 Flash (Latest)",
        short_name: "2.0-flash",
    },
    ModelInfo {
        id: "gemini-2.0-flash-exp",
        display_name: "Gemini 2.0 Flash (Experimental)",
        short_name: "2.0-flash-exp",
    },
    ModelInfo {
        id: "gemini-2.5-flash-lite",
        display_name: "Gemini 2.5 Flash Lite",
        short_name: "2.5-lite",
    },
    ModelInfo {
        id: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        short_name: "2.5-flash",
    },
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} not found. Set it in .env file or as environment variable.{hint}")]
    MissingCredential { name: &'static str, hint: &'static str },
    #[error("Unsupported model: {model}. Supported models: {supported}")]
    UnsupportedModel { model: String, supported: String },
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Looks up a supported model, failing with the list of accepted ids.
pub fn resolve_model(model_id: &str) -> Result<&'static ModelInfo, ConfigError> {
    SUPPORTED_MODELS
        .iter()
        .find(|model| model.id == model_id)
        .ok_or_else(|| ConfigError::UnsupportedModel {
            model: model_id.to_string(),
            supported: SUPPORTED_MODELS
                .iter()
                .map(|model| model.id)
                .collect::<Vec<_>>()
                .join(", "),
        })
}

#[derive(Debug, Clone, PartialEq)]
pub struct LangfuseSettings {
    pub public_key: String,
    pub secret_key: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupabaseSettings {
    pub url: String,
    pub service_role_key: String,
}

/// Process configuration, read once at startup and passed down explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub google_api_key: Option<String>,
    pub gemini_base_url: Option<String>,
    pub langfuse: Option<LangfuseSettings>,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub project_root: PathBuf,
    pub request_timeout: Duration,
}

impl AppConfig {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let langfuse = match (get("LANGFUSE_PUBLIC_KEY"), get("LANGFUSE_SECRET_KEY")) {
            (Some(public_key), Some(secret_key)) => Some(LangfuseSettings {
                public_key,
                secret_key,
                host: get("LANGFUSE_HOST").unwrap_or_else(|| DEFAULT_LANGFUSE_HOST.to_string()),
            }),
            _ => None,
        };

        let request_timeout = match get("BIKECLF_REQUEST_TIMEOUT_SECS") {
            Some(raw) => {
                let secs = raw
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or(ConfigError::InvalidValue {
                        name: "BIKECLF_REQUEST_TIMEOUT_SECS",
                        value: raw.clone(),
                    })?;
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        };

        let project_root = get("BIKECLF_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            google_api_key: get("GOOGLE_API_KEY"),
            gemini_base_url: get("GEMINI_BASE_URL"),
            langfuse,
            supabase_url: get("SUPABASE_URL"),
            supabase_key: get("SUPABASE_SERVICE_ROLE_KEY"),
            project_root,
            request_timeout,
        })
    }

    /// The generation API key, required before any classification.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.google_api_key
            .as_deref()
            .ok_or(ConfigError::MissingCredential {
                name: "GOOGLE_API_KEY",
                hint: "\nGet your API key from: https://aistudio.google.com/apikey",
            })
    }

    pub fn require_supabase(&self) -> Result<SupabaseSettings, ConfigError> {
        let url = self.supabase_url.clone().ok_or(ConfigError::MissingCredential {
            name: "SUPABASE_URL",
            hint: "",
        })?;
        let service_role_key = self.supabase_key.clone().ok_or(ConfigError::MissingCredential {
            name: "SUPABASE_SERVICE_ROLE_KEY",
            hint: "",
        })?;
        Ok(SupabaseSettings { url, service_role_key })
    }

    pub fn prompts_dir<L: TaskPaths>(&self) -> PathBuf {
        self.project_root.join(L::PROMPTS_SUBDIR)
    }

    pub fn runs_dir<L: TaskPaths>(&self) -> PathBuf {
        self.project_root.join(L::RUNS_SUBDIR)
    }
}

/// Directory layout and defaults that differ between the two tasks.
pub trait TaskPaths: Label {
    const PROMPTS_SUBDIR: &'static str;
    const RUNS_SUBDIR: &'static str;
    const DEFAULT_MODEL: &'static str;
}

impl TaskPaths for RelevanceLabel {
    const PROMPTS_SUBDIR: &'static str = "prompts/phase1";
    const RUNS_SUBDIR: &'static str = "runs";
    const DEFAULT_MODEL: &'static str = "gemini-2.0-flash-001";
}

impl TaskPaths for IssueCategory {
    const PROMPTS_SUBDIR: &'static str = "prompts/phase2";
    const RUNS_SUBDIR: &'static str = "phase2/runs";
    const DEFAULT_MODEL: &'static str = "gemini-2.5-flash-lite";
}

/// `.env` files consulted at startup: the project-local one, then a
/// per-user one under the platform config directory.
pub fn dotenv_candidates(project_root: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![project_root.join(".env")];
    if let Some(config_dir) = dirs::config_dir() {
        candidates.push(config_dir.join("bikeclf").join(".env"));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert!(config.google_api_key.is_none());
        assert!(config.langfuse.is_none());
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.project_root, PathBuf::from("."));
        assert!(matches!(
            config.require_api_key(),
            Err(ConfigError::MissingCredential { name: "GOOGLE_API_KEY", .. })
        ));
    }

    #[test]
    fn test_blank_key_counts_as_missing() {
        let config = config_from(&[("GOOGLE_API_KEY", "  ")]).unwrap();
        assert!(config.require_api_key().is_err());
    }

    #[test]
    fn test_langfuse_needs_both_keys() {
        let config = config_from(&[("LANGFUSE_PUBLIC_KEY", "pk")]).unwrap();
        assert!(config.langfuse.is_none());

        let config = config_from(&[("LANGFUSE_PUBLIC_KEY", "pk"), ("LANGFUSE_SECRET_KEY", "sk")]).unwrap();
        let langfuse = config.langfuse.unwrap();
        assert_eq!(langfuse.host, DEFAULT_LANGFUSE_HOST);
    }

    #[test]
    fn test_invalid_timeout() {
        assert!(config_from(&[("BIKECLF_REQUEST_TIMEOUT_SECS", "soon")]).is_err());
        assert!(config_from(&[("BIKECLF_REQUEST_TIMEOUT_SECS", "0")]).is_err());
        let config = config_from(&[("BIKECLF_REQUEST_TIMEOUT_SECS", "15")]).unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_task_directories() {
        let config = config_from(&[("BIKECLF_HOME", "/srv/bikes")]).unwrap();
        assert_eq!(config.prompts_dir::<RelevanceLabel>(), PathBuf::from("/srv/bikes/prompts/phase1"));
        assert_eq!(config.runs_dir::<IssueCategory>(), PathBuf::from("/srv/bikes/phase2/runs"));
    }

    #[test]
    fn test_model_gate() {
        assert_eq!(resolve_model("gemini-2.5-flash-lite").unwrap().short_name, "2.5-lite");
        let err = resolve_model("gpt-4").unwrap_err();
        assert!(err.to_string().contains("gemini-2.0-flash-001"));
        assert!(resolve_model(RelevanceLabel::DEFAULT_MODEL).is_ok());
        assert!(resolve_model(IssueCategory::DEFAULT_MODEL).is_ok());
    }
}
