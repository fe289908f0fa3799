//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// psyconsult - multi-analysis psychiatric case consultation
///
/// Runs diagnosis, relapse-risk and summary analyses on a patient intake in
/// parallel using a local model, integrates them into one report, and lets a
/// clinician revise the result with an override.
///
/// Examples:
///   psyconsult --intake patient.json
///   psyconsult --intake patient.json --format json --output report.json
///   psyconsult --revise case-042 --override "Dx: Bipolar II Disorder"
///   psyconsult --intake patient.json --dry-run
///   psyconsult --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Patient intake JSON file to analyze
    #[arg(
        short,
        long,
        value_name = "FILE",
        required_unless_present_any = ["init_config", "revise"],
        conflicts_with = "revise"
    )]
    pub intake: Option<PathBuf>,

    /// Re-integrate a stored case with a clinician override
    #[arg(long, value_name = "CASE_ID", requires = "override_text")]
    pub revise: Option<String>,

    /// Clinician override text for --revise
    ///
    /// Name diagnoses explicitly with "Dx:" to make them authoritative,
    /// e.g. "Dx: Bipolar II Disorder; Generalized Anxiety Disorder".
    #[arg(long = "override", value_name = "TEXT", requires = "revise")]
    pub override_text: Option<String>,

    /// Ollama model to use for analysis
    ///
    /// Can also be set via PSYCONSULT_MODEL env var or .psyconsult.toml config.
    #[arg(short, long, env = "PSYCONSULT_MODEL")]
    pub model: Option<String>,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Case store directory
    #[arg(long, value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// Ollama API endpoint URL
    #[arg(long, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .psyconsult.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Temperature for LLM responses (0.0 - 1.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Per-request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Exit with code 2 when the report requires manual review
    #[arg(long)]
    pub fail_on_review: bool,

    /// Dry run: print the analysis requests without calling the model
    #[arg(long, conflicts_with = "revise")]
    pub dry_run: bool,

    /// Generate a default .psyconsult.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if let Some(ref intake) = self.intake {
            if !intake.is_file() {
                return Err(format!("Intake file does not exist: {}", intake.display()));
            }
        }

        if let Some(ref text) = self.override_text {
            if text.trim().is_empty() {
                return Err("Override text must not be empty".to_string());
            }
        }

        // Validate Ollama URL format (not needed for dry-run)
        if !self.dry_run {
            if let Some(ref url) = self.ollama_url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
                }
            }
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                return Err("Temperature must be between 0.0 and 1.0".to_string());
            }
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
