//! psyconsult - multi-analysis psychiatric case consultation
//!
//! A CLI tool that runs diagnosis, relapse-risk and summary analyses on a
//! patient intake in parallel, integrates them into one clinical report and
//! supports clinician-driven revisions.
//!
//! Exit codes:
//!   0 - Success (or review required without --fail-on-review)
//!   1 - Runtime error (invalid intake, model unreachable, store failure, etc.)
//!   2 - Report requires manual review and --fail-on-review is set

mod capability;
mod cli;
mod config;
mod error;
mod models;
mod pipeline;
mod report;
mod session;
mod store;

use anyhow::{anyhow, Context, Result};
use capability::Capabilities;
use cli::{Args, OutputFormat};
use config::{Config, DEFAULT_CONFIG_FILE};
use indicatif::{ProgressBar, ProgressStyle};
use models::{AnalysisStatus, DoctorOverride, InitialAnalysisBundle, PatientIntake};
use pipeline::{orchestrator, revise_case, spawn_case_analysis, CasePipeline};
use report::CaseReport;
use session::ReportVersion;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{CaseStore, FileCaseStore};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args)?;

    info!("psyconsult v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    let result = if args.revise.is_some() {
        run_revision(args).await
    } else {
        run_analysis(args).await
    };

    match result {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Consultation failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .psyconsult.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to customize the model, review thresholds and store location.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) -> Result<()> {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Analyze a new intake. Returns exit code (0 or 2).
async fn run_analysis(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let intake_path = args
        .intake
        .as_deref()
        .ok_or_else(|| anyhow!("--intake is required"))?;
    let intake = load_intake(intake_path)?;

    // Handle --dry-run: show the requests and exit
    if args.dry_run {
        return handle_dry_run(&intake);
    }

    println!("🧠 Analyzing case {}", intake.id);
    println!("   Model: {}", config.model.name);
    println!("   Ollama: {}", config.model.ollama_url);
    println!("   Timeout: {}s", config.model.timeout_seconds);

    let capabilities = Capabilities::ollama(config.ollama())?;
    let pipeline = Arc::new(CasePipeline::new(&capabilities, config.policy()));
    let store: Arc<dyn CaseStore> = Arc::new(FileCaseStore::new(&config.general.store_dir));

    let handle = spawn_case_analysis(pipeline, intake, store);
    let spinner = create_spinner(args.quiet)?;

    let mut status_rx = handle.subscribe();
    let progress = {
        let spinner = spinner.clone();
        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow();
                spinner.set_message(status_message(status));
            }
        })
    };

    let outcome = handle.wait().await;
    spinner.finish_and_clear();
    progress.abort();

    let outcome = outcome?;
    let case_id = outcome.session.case_id().to_string();

    for failure in outcome.session.bundle().failures() {
        println!("   ⚠️  {} unavailable: {}", failure.capability, failure.reason);
    }

    write_report(
        &args,
        &config,
        &case_id,
        outcome.session.bundle(),
        &outcome.version,
        start_time.elapsed().as_secs_f64(),
    )
}

/// Re-integrate a stored case with a clinician override.
async fn run_revision(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let case_id = args
        .revise
        .clone()
        .ok_or_else(|| anyhow!("--revise requires a case id"))?;
    let doctor_override = args
        .override_text
        .as_deref()
        .and_then(DoctorOverride::new)
        .context("Override text must not be empty")?;

    println!("🔁 Revising case {}", case_id);
    println!("   Override: {}", doctor_override);

    let capabilities = Capabilities::ollama(config.ollama())?;
    let pipeline = CasePipeline::new(&capabilities, config.policy());
    let store = FileCaseStore::new(&config.general.store_dir);

    let spinner = create_spinner(args.quiet)?;
    spinner.set_message("Re-integrating with override...");
    let outcome = revise_case(&pipeline, &store, &case_id, doctor_override).await;
    spinner.finish_and_clear();

    let outcome = outcome.with_context(|| format!("Failed to revise case {}", case_id))?;

    write_report(
        &args,
        &config,
        &case_id,
        outcome.session.bundle(),
        &outcome.version,
        start_time.elapsed().as_secs_f64(),
    )
}

/// Render, save and summarize a report version. Returns exit code (0 or 2).
fn write_report(
    args: &Args,
    config: &Config,
    case_id: &str,
    bundle: &InitialAnalysisBundle,
    version: &ReportVersion,
    duration: f64,
) -> Result<i32> {
    let case_report = CaseReport::new(case_id, bundle, version, &config.model.name, duration);

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&case_report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&case_report, &config.report),
    };

    let output_path = Path::new(&config.general.output);
    std::fs::write(output_path, &output)
        .with_context(|| format!("Failed to write report to {}", output_path.display()))?;

    let diagnosis = &version.report.integrated_diagnosis;
    println!("\n📊 Consultation Summary:");
    println!("   Case: {} (report v{})", case_id, version.version);
    println!(
        "   Primary diagnosis: {} ({:.0}%)",
        diagnosis.primary.diagnosis,
        diagnosis.primary.confidence * 100.0
    );
    println!(
        "   Consensus: {} {} | Confidence: {:.0}%",
        diagnosis.consensus.emoji(),
        diagnosis.consensus,
        diagnosis.confidence * 100.0
    );
    println!("   Duration: {:.1}s", duration);
    if version.report.requires_manual_review {
        println!("   ⚠️  Manual review required");
    }
    println!(
        "\n✅ Consultation complete! Report saved to: {}",
        output_path.display()
    );

    if args.fail_on_review && version.report.requires_manual_review {
        eprintln!("\n⛔ Report requires manual review. Failing (exit code 2).");
        return Ok(2);
    }

    Ok(0)
}

/// Handle --dry-run: print the capability requests, exit.
fn handle_dry_run(intake: &PatientIntake) -> Result<i32> {
    println!("\n🔍 Dry run: building analysis requests (no model calls)...\n");

    println!("── diagnosis ──");
    println!(
        "{}\n",
        serde_json::to_string_pretty(&orchestrator::build_diagnosis_request(intake))?
    );
    println!("── relapse_prediction ──");
    println!(
        "{}\n",
        serde_json::to_string_pretty(&orchestrator::build_relapse_request(intake))?
    );
    println!("── summary ──");
    println!(
        "{}\n",
        serde_json::to_string_pretty(&orchestrator::build_summary_request(intake))?
    );

    println!("✅ Dry run complete. No model calls were made.");
    Ok(0)
}

fn create_spinner(quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .context("Invalid progress template")?,
    );
    spinner.set_message(status_message(AnalysisStatus::Pending));
    spinner.enable_steady_tick(Duration::from_millis(120));
    Ok(spinner)
}

fn status_message(status: AnalysisStatus) -> String {
    match status {
        AnalysisStatus::Pending => "Queued...".to_string(),
        AnalysisStatus::Processing => "Running analyses and integration...".to_string(),
        AnalysisStatus::Completed | AnalysisStatus::Failed => format!("Analysis {}", status),
    }
}

/// Read and validate a patient intake file.
fn load_intake(path: &Path) -> Result<PatientIntake> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read intake file: {}", path.display()))?;

    let intake: PatientIntake = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse intake file: {}", path.display()))?;

    intake
        .validate()
        .map_err(|e| anyhow!("Invalid intake {}: {}", path.display(), e))?;

    Ok(intake)
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
