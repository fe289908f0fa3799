//! Parallel fan-out of the initial analyses.
//!
//! The orchestrator projects one [`PatientIntake`] into three capability
//! requests, runs the capabilities concurrently and waits for all of them to
//! settle. A failing capability is recorded in its slot and never cancels its
//! siblings.

use crate::capability::{
    AnalysisCapability, Capabilities, DiagnosisCapability, DiagnosisRequest, RelapseCapability,
    RelapseRequest, SummaryCapability, SummaryRequest, Validate,
};
use crate::models::{CapabilityResult, FlagDetail, InitialAnalysisBundle, PatientIntake};
use futures::future::join3;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Runs the diagnosis, relapse-risk and summary capabilities for an intake.
#[derive(Clone)]
pub struct Orchestrator {
    diagnosis: Arc<DiagnosisCapability>,
    relapse: Arc<RelapseCapability>,
    summary: Arc<SummaryCapability>,
}

impl Orchestrator {
    pub fn new(capabilities: &Capabilities) -> Self {
        Self {
            diagnosis: capabilities.diagnosis.clone(),
            relapse: capabilities.relapse.clone(),
            summary: capabilities.summary.clone(),
        }
    }

    /// Run all three analyses concurrently and collect every outcome.
    ///
    /// Never fails: each rejection is absorbed into its slot. Whether a
    /// degraded bundle is usable is the caller's decision.
    pub async fn run_initial_analysis(&self, intake: &PatientIntake) -> InitialAnalysisBundle {
        let started = Instant::now();
        let diagnosis_request = build_diagnosis_request(intake);
        let relapse_request = build_relapse_request(intake);
        let summary_request = build_summary_request(intake);

        info!(patient_id = %intake.id, "Starting initial analysis fan-out");

        let (diagnosis, relapse_prediction, summary) = join3(
            settle(self.diagnosis.as_ref(), &diagnosis_request),
            settle(self.relapse.as_ref(), &relapse_request),
            settle(self.summary.as_ref(), &summary_request),
        )
        .await;

        let bundle = InitialAnalysisBundle {
            diagnosis,
            relapse_prediction,
            summary,
        };

        for failure in bundle.failures() {
            warn!(
                patient_id = %intake.id,
                capability = %failure.capability,
                reason = %failure.reason,
                "Capability rejected"
            );
        }

        info!(
            patient_id = %intake.id,
            fulfilled = bundle.fulfilled_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Initial analysis settled"
        );

        bundle
    }
}

/// Invoke one capability and validate its response at the stage boundary.
async fn settle<Req, Resp>(
    capability: &dyn AnalysisCapability<Req, Resp>,
    request: &Req,
) -> CapabilityResult<Resp>
where
    Req: Sync,
    Resp: Send + Validate,
{
    let started = Instant::now();
    let result = capability.invoke(request).await.and_then(Validate::validated);

    debug!(
        capability = capability.name(),
        ok = result.is_ok(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Capability settled"
    );

    result.into()
}

fn describe_flag(flag: Option<&FlagDetail>) -> String {
    match flag {
        None => "not assessed".to_string(),
        Some(FlagDetail { present: false, .. }) => "none reported".to_string(),
        Some(FlagDetail {
            present: true,
            details: Some(details),
        }) if !details.trim().is_empty() => format!("reported ({})", details.trim()),
        Some(FlagDetail { present: true, .. }) => "reported".to_string(),
    }
}

fn describe_medications(intake: &PatientIntake) -> String {
    let medications = intake.medication_list();
    if medications.is_empty() {
        "none reported".to_string()
    } else {
        medications.join(", ")
    }
}

/// Fold the intake into one narrative paragraph.
pub fn compose_narrative(intake: &PatientIntake) -> String {
    format!(
        "Patient {}, {}-year-old {}. Presenting symptoms: {}. Current medications: {}. \
         Substance use: {}. Family psychiatric history: {}.",
        intake.name,
        intake.age,
        intake.gender,
        intake.symptoms.join("; "),
        describe_medications(intake),
        describe_flag(intake.addiction.as_ref()),
        describe_flag(intake.family_history.as_ref()),
    )
}

/// Risk-factor text for relapse prediction.
fn compose_risk_factors(intake: &PatientIntake) -> String {
    format!(
        "Substance use: {}. Family psychiatric history: {}. Current medications: {}.",
        describe_flag(intake.addiction.as_ref()),
        describe_flag(intake.family_history.as_ref()),
        describe_medications(intake),
    )
}

pub fn build_diagnosis_request(intake: &PatientIntake) -> DiagnosisRequest {
    DiagnosisRequest {
        session_notes: vec![compose_narrative(intake)],
        history: intake.history.clone(),
    }
}

pub fn build_relapse_request(intake: &PatientIntake) -> RelapseRequest {
    RelapseRequest {
        behavioral_description: format!("Observed symptoms: {}.", intake.symptoms.join("; ")),
        history: intake.history.clone(),
        risk_factors: compose_risk_factors(intake),
    }
}

pub fn build_summary_request(intake: &PatientIntake) -> SummaryRequest {
    SummaryRequest {
        session_notes: compose_narrative(intake),
        history: intake.history.clone(),
    }
}
