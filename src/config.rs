//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.psyconsult.toml` files.

use crate::capability::OllamaConfig;
use crate::pipeline::IntegrationPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = ".psyconsult.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Integration thresholds.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Directory holding case bundles, statuses and report versions.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            store_dir: default_store_dir(),
        }
    }
}

fn default_output() -> String {
    "psyconsult_report.md".to_string()
}

fn default_store_dir() -> String {
    ".psyconsult/cases".to_string()
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Default model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout() -> u64 {
    300
}

/// Thresholds applied by the integration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Reports below this confidence require manual review.
    #[serde(default = "default_review_threshold")]
    pub review_confidence_threshold: f64,

    /// Confidence ceiling when an initial analysis failed.
    #[serde(default = "default_degraded_cap")]
    pub degraded_confidence_cap: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            review_confidence_threshold: default_review_threshold(),
            degraded_confidence_cap: default_degraded_cap(),
        }
    }
}

fn default_review_threshold() -> f64 {
    0.7
}

fn default_degraded_cap() -> f64 {
    0.6
}

/// Report generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Include the per-capability initial analyses.
    #[serde(default = "default_true")]
    pub include_initial_analyses: bool,

    /// Include the clinical discussion text.
    #[serde(default = "default_true")]
    pub include_discussion: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            include_initial_analyses: true,
            include_discussion: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;
        for (name, value) in [
            (
                "review_confidence_threshold",
                pipeline.review_confidence_threshold,
            ),
            ("degraded_confidence_cap", pipeline.degraded_confidence_cap),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("pipeline.{} must be between 0.0 and 1.0, got {}", name, value);
            }
        }
        // Degraded reports must always fall under the review threshold.
        if pipeline.degraded_confidence_cap >= pipeline.review_confidence_threshold {
            bail!(
                "pipeline.degraded_confidence_cap ({}) must be below pipeline.review_confidence_threshold ({})",
                pipeline.degraded_confidence_cap,
                pipeline.review_confidence_threshold
            );
        }
        if self.model.timeout_seconds == 0 {
            bail!("model.timeout_seconds must be at least 1");
        }
        Ok(())
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(temperature) = args.temperature {
            self.model.temperature = temperature;
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }

        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }
        if let Some(ref store) = args.store {
            self.general.store_dir = store.display().to_string();
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Integration thresholds for the engine.
    pub fn policy(&self) -> IntegrationPolicy {
        IntegrationPolicy {
            review_confidence_threshold: self.pipeline.review_confidence_threshold,
            degraded_confidence_cap: self.pipeline.degraded_confidence_cap,
        }
    }

    /// Connection settings for the Ollama capabilities.
    pub fn ollama(&self) -> OllamaConfig {
        OllamaConfig {
            ollama_url: self.model.ollama_url.clone(),
            model_name: self.model.name.clone(),
            temperature: self.model.temperature,
            timeout_seconds: self.model.timeout_seconds,
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
