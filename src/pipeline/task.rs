//! Driving a case through the pipeline while tracking its status.
//!
//! [`spawn_case_analysis`] returns immediately with a handle. The spawned task
//! runs the fan-out and the first integration, persists every artifact and
//! moves the case status `Pending -> Processing -> Completed | Failed`.
//! [`revise_case`] moves a stored case through `Processing` again. Both
//! write the terminal status exactly once.

use super::CasePipeline;
use crate::error::{AnalysisTaskError, StoreError};
use crate::models::{AnalysisStatus, CapabilityFailure, DoctorOverride, PatientIntake};
use crate::session::{CaseSession, ReportVersion};
use crate::store::{CaseStore, StatusRecord};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Result of a successful background analysis.
#[derive(Debug, Clone)]
pub struct CaseOutcome {
    pub session: CaseSession,
    pub version: ReportVersion,
}

/// Handle to a running case analysis.
pub struct AnalysisHandle {
    case_id: String,
    status: watch::Receiver<AnalysisStatus>,
    task: JoinHandle<Result<CaseOutcome, AnalysisTaskError>>,
}

impl AnalysisHandle {
    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    /// Current status without waiting.
    pub fn status(&self) -> AnalysisStatus {
        *self.status.borrow()
    }

    /// A receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<AnalysisStatus> {
        self.status.clone()
    }

    /// Wait until the status is terminal and return it.
    pub async fn wait_for_terminal(&self) -> AnalysisStatus {
        let mut status = self.status.clone();
        let terminal = match status.wait_for(|s| s.is_terminal()).await {
            Ok(terminal) => *terminal,
            // Sender dropped without a terminal status: the task panicked.
            Err(_) => AnalysisStatus::Failed,
        };
        terminal
    }

    /// Wait for the task and take its outcome.
    pub async fn wait(self) -> Result<CaseOutcome, AnalysisTaskError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(AnalysisTaskError::Join(e.to_string())),
        }
    }
}

/// Start analyzing a case in the background.
pub fn spawn_case_analysis(
    pipeline: Arc<CasePipeline>,
    intake: PatientIntake,
    store: Arc<dyn CaseStore>,
) -> AnalysisHandle {
    let case_id = intake.id.clone();
    let (status_tx, status_rx) = watch::channel(AnalysisStatus::Pending);
    let task = tokio::spawn(run_case(pipeline, intake, store, status_tx));

    AnalysisHandle {
        case_id,
        status: status_rx,
        task,
    }
}

async fn run_case(
    pipeline: Arc<CasePipeline>,
    intake: PatientIntake,
    store: Arc<dyn CaseStore>,
    status_tx: watch::Sender<AnalysisStatus>,
) -> Result<CaseOutcome, AnalysisTaskError> {
    let case_id = intake.id.clone();
    let mut failures = Vec::new();

    let result = drive(
        &pipeline,
        &intake,
        store.as_ref(),
        &status_tx,
        &mut failures,
    )
    .await;

    let result = record_terminal(store.as_ref(), &case_id, result, failures).await;
    match &result {
        Ok(outcome) => {
            status_tx.send_replace(AnalysisStatus::Completed);
            info!(case_id = %case_id, version = outcome.version.version, "Case analysis completed");
        }
        Err(e) => {
            status_tx.send_replace(AnalysisStatus::Failed);
            error!(case_id = %case_id, error = %e, "Case analysis failed");
        }
    }
    result
}

/// Write the single terminal status for a run that already went `Processing`.
///
/// A run that succeeded but whose completion cannot be recorded is reported
/// as failed.
async fn record_terminal<T>(
    store: &dyn CaseStore,
    case_id: &str,
    result: Result<T, AnalysisTaskError>,
    failures: Vec<CapabilityFailure>,
) -> Result<T, AnalysisTaskError> {
    let record = match &result {
        Ok(_) => StatusRecord::new(AnalysisStatus::Completed),
        Err(e) => StatusRecord::failed(e.to_string()),
    }
    .with_failures(failures);
    let persisted = store.set_status(case_id, record).await;

    match (result, persisted) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => {
            error!(case_id = %case_id, error = %e, "Failed to record completion");
            Err(e.into())
        }
        (Err(e), persisted) => {
            if let Err(store_error) = persisted {
                warn!(case_id = %case_id, error = %store_error, "Failed to record failure status");
            }
            Err(e)
        }
    }
}

async fn drive(
    pipeline: &CasePipeline,
    intake: &PatientIntake,
    store: &dyn CaseStore,
    status_tx: &watch::Sender<AnalysisStatus>,
    failures: &mut Vec<CapabilityFailure>,
) -> Result<CaseOutcome, AnalysisTaskError> {
    let case_id = intake.id.as_str();

    if store.status(case_id).await?.is_none() {
        store
            .set_status(case_id, StatusRecord::new(AnalysisStatus::Pending))
            .await?;
    }
    store
        .set_status(case_id, StatusRecord::new(AnalysisStatus::Processing))
        .await?;
    status_tx.send_replace(AnalysisStatus::Processing);

    let bundle = pipeline.orchestrator().run_initial_analysis(intake).await;
    *failures = bundle.failures();
    store.save_bundle(case_id, &bundle).await?;

    let previous = store
        .latest_report(case_id)
        .await?
        .map(|v| v.version)
        .unwrap_or(0);
    let mut session = CaseSession::new(case_id, bundle).numbered_after(previous);
    let version = session.integrate(pipeline.engine()).await?;
    store.save_report(case_id, &version).await?;

    Ok(CaseOutcome { session, version })
}

/// Re-integrate a stored case with a clinician's override.
///
/// The case must already have an integrated report. Once the case is marked
/// `Processing`, the revision and the save of its report form one step whose
/// outcome decides the single terminal status.
pub async fn revise_case(
    pipeline: &CasePipeline,
    store: &dyn CaseStore,
    case_id: &str,
    doctor_override: DoctorOverride,
) -> Result<CaseOutcome, AnalysisTaskError> {
    let bundle = store.load_bundle(case_id).await?;
    let latest = store
        .latest_report(case_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("{} has no integrated report", case_id)))?;
    let mut session = CaseSession::resume(case_id, bundle, latest);

    store
        .set_status(case_id, StatusRecord::new(AnalysisStatus::Processing))
        .await?;

    let result = revise_and_save(pipeline, store, &mut session, doctor_override).await;
    let version = record_terminal(store, case_id, result, Vec::new())
        .await
        .map_err(|e| {
            error!(case_id = %case_id, error = %e, "Case revision failed");
            e
        })?;

    info!(case_id = %case_id, version = version.version, "Case revision completed");
    Ok(CaseOutcome { session, version })
}

async fn revise_and_save(
    pipeline: &CasePipeline,
    store: &dyn CaseStore,
    session: &mut CaseSession,
    doctor_override: DoctorOverride,
) -> Result<ReportVersion, AnalysisTaskError> {
    let version = session.revise(pipeline.engine(), doctor_override).await?;
    store.save_report(session.case_id(), &version).await?;
    Ok(version)
}
