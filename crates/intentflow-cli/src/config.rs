//! Layered settings for the `intentflow` binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use intentflow_plan::LabelMatching;
use intentflow_policy::PolicyScope;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "intentflow.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_trials: {0}. Must be at least 1")]
    InvalidMaxTrials(usize),

    #[error("Invalid success_threshold: {0}. Must be between 1 and max_trials")]
    InvalidSuccessThreshold(usize),

    #[error("Invalid candidates per round: {0}. Must be at least 1")]
    InvalidCandidates(usize),

    #[error("Invalid policy {name}: {value}. Must be positive and finite")]
    InvalidPolicyParam { name: &'static str, value: f64 },

    #[error("Invalid embedding dimension: {0}. Must be at least 1")]
    InvalidEmbeddingDim(usize),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid monitor interval: {0}s. Must be positive")]
    InvalidMonitorInterval(f64),

    #[error("{0} cannot be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathsConfig,
    pub trials: TrialsConfig,
    pub policy: PolicyConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub workflow: WorkflowConfig,
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
    pub catalog: CatalogConfig,
}

/// Relative state file names resolve against `state_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub state_dir: PathBuf,
    pub policy_state: PathBuf,
    pub blacklist: PathBuf,
    pub transcript: PathBuf,
    pub corpus: PathBuf,
    pub run_metrics: PathBuf,
    pub manifests_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".intentflow"),
            policy_state: PathBuf::from("bandit_state.bin"),
            blacklist: PathBuf::from("pipeline_blacklist.json"),
            transcript: PathBuf::from("rag_feedback.txt"),
            corpus: PathBuf::from("corpus.jsonl"),
            run_metrics: PathBuf::from("run_metrics.jsonl"),
            manifests_dir: PathBuf::from("manifests"),
            output_dir: PathBuf::from("."),
        }
    }
}

impl PathsConfig {
    pub fn state_file(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.state_dir.join(file)
        }
    }

    pub fn policy_state(&self) -> PathBuf {
        self.state_file(&self.policy_state)
    }

    pub fn blacklist(&self) -> PathBuf {
        self.state_file(&self.blacklist)
    }

    pub fn transcript(&self) -> PathBuf {
        self.state_file(&self.transcript)
    }

    pub fn corpus(&self) -> PathBuf {
        self.state_file(&self.corpus)
    }

    pub fn run_metrics(&self) -> PathBuf {
        self.state_file(&self.run_metrics)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialsConfig {
    pub max_trials: usize,
    pub success_threshold: usize,
    pub candidates: usize,
    pub stop_on_success: bool,
}

impl Default for TrialsConfig {
    fn default() -> Self {
        Self {
            max_trials: 150,
            success_threshold: 2,
            candidates: 5,
            stop_on_success: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub lambda: f64,
    pub sigma: f64,
    pub seed: Option<u64>,
    pub scope: PolicyScope,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            lambda: 1.0,
            sigma: 1.0,
            seed: None,
            scope: PolicyScope::Shared,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    /// Per-text dimension; features are twice this.
    pub dim: usize,
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            dim: 1536,
            cache_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: usize,
    /// Feedback documents given to the generator as context.
    pub context_docs: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            timeout_secs: 120,
            max_retries: 2,
            context_docs: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub namespace: String,
    pub submit_namespace: String,
    pub service_account: Option<String>,
    pub wait_for_dependencies: bool,
    pub submit_command: String,
    pub submit_timeout_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            namespace: "agentic-ai".to_string(),
            submit_namespace: "default".to_string(),
            service_account: Some("argo-executor".to_string()),
            wait_for_dependencies: false,
            submit_command: "argo".to_string(),
            submit_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// CSV sink; sampling is off when unset.
    pub csv: Option<PathBuf>,
    pub interval_secs: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            csv: None,
            interval_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// YAML catalog; the builtin catalog is used when unset.
    pub path: Option<PathBuf>,
    pub label_matching: LabelMatching,
}

/// Figment-based loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Precedence (lowest to highest): programmatic defaults, the YAML file
    /// (`path` or `intentflow.yaml`), then `INTENTFLOW_*` environment
    /// variables with `__` separating nested keys.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        if let Some(explicit) = path {
            if !explicit.exists() {
                anyhow::bail!("Config file {} not found", explicit.display());
            }
        }
        let settings: Settings = Self::figment(file)
            .extract()
            .with_context(|| format!("Failed to load configuration (file: {})", file.display()))?;
        Self::validate(&settings)?;
        Ok(settings)
    }

    pub fn figment(file: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Yaml::file(file))
            .merge(Env::prefixed("INTENTFLOW_").split("__"))
    }

    pub fn validate(settings: &Settings) -> Result<(), ConfigError> {
        let trials = &settings.trials;
        if trials.max_trials == 0 {
            return Err(ConfigError::InvalidMaxTrials(trials.max_trials));
        }
        if trials.success_threshold == 0 || trials.success_threshold > trials.max_trials {
            return Err(ConfigError::InvalidSuccessThreshold(trials.success_threshold));
        }
        if trials.candidates == 0 {
            return Err(ConfigError::InvalidCandidates(trials.candidates));
        }

        for (name, value) in [("lambda", settings.policy.lambda), ("sigma", settings.policy.sigma)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidPolicyParam { name, value });
            }
        }

        if settings.embedding.dim == 0 {
            return Err(ConfigError::InvalidEmbeddingDim(settings.embedding.dim));
        }
        if settings.llm.model.trim().is_empty() {
            return Err(ConfigError::Empty("llm.model"));
        }
        if settings.workflow.submit_command.trim().is_empty() {
            return Err(ConfigError::Empty("workflow.submit_command"));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&settings.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(settings.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&settings.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(settings.logging.format.clone()));
        }

        if !(settings.monitor.interval_secs.is_finite() && settings.monitor.interval_secs > 0.0) {
            return Err(ConfigError::InvalidMonitorInterval(settings.monitor.interval_secs));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.trials.max_trials, 150);
        assert_eq!(settings.trials.success_threshold, 2);
        assert_eq!(settings.embedding.dim, 1536);
        assert_eq!(settings.workflow.namespace, "agentic-ai");
        assert_eq!(settings.workflow.submit_namespace, "default");
        assert!(!settings.workflow.wait_for_dependencies);
        ConfigLoader::validate(&settings).expect("default settings should be valid");
    }

    #[test]
    fn state_files_resolve_against_state_dir() {
        let paths = PathsConfig {
            state_dir: PathBuf::from("/var/lib/intentflow"),
            corpus: PathBuf::from("/data/corpus.jsonl"),
            ..PathsConfig::default()
        };
        assert_eq!(
            paths.policy_state(),
            PathBuf::from("/var/lib/intentflow/bandit_state.bin")
        );
        assert_eq!(paths.corpus(), PathBuf::from("/data/corpus.jsonl"));
    }

    #[test]
    fn yaml_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r"
trials:
  max_trials: 40
policy:
  seed: 7
  scope: per_intent
catalog:
  label_matching: prefix
",
            )?;
            jail.set_env("INTENTFLOW_TRIALS__SUCCESS_THRESHOLD", "3");
            jail.set_env("INTENTFLOW_LOGGING__FORMAT", "json");

            let settings = ConfigLoader::load(None).expect("load");
            assert_eq!(settings.trials.max_trials, 40);
            assert_eq!(settings.trials.success_threshold, 3);
            assert_eq!(settings.trials.candidates, 5);
            assert_eq!(settings.policy.seed, Some(7));
            assert_eq!(settings.policy.scope, PolicyScope::PerIntent);
            assert_eq!(settings.catalog.label_matching, LabelMatching::Prefix);
            assert_eq!(settings.logging.format, "json");
            Ok(())
        });
    }

    #[test]
    fn example_file_matches_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                include_str!("../../../intentflow.example.yaml"),
            )?;
            let settings = ConfigLoader::load(None).expect("load");
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = ConfigLoader::load(Some(Path::new("/nonexistent/intentflow.yaml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn threshold_above_max_trials_rejected() {
        let mut settings = Settings::default();
        settings.trials.max_trials = 3;
        settings.trials.success_threshold = 4;
        assert!(matches!(
            ConfigLoader::validate(&settings),
            Err(ConfigError::InvalidSuccessThreshold(4))
        ));
    }

    #[test]
    fn bad_log_level_rejected() {
        let mut settings = Settings::default();
        settings.logging.level = "loud".into();
        assert!(matches!(
            ConfigLoader::validate(&settings),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn non_positive_sigma_rejected() {
        let mut settings = Settings::default();
        settings.policy.sigma = 0.0;
        assert!(matches!(
            ConfigLoader::validate(&settings),
            Err(ConfigError::InvalidPolicyParam { name: "sigma", .. })
        ));
    }
}
