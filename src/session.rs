//! Re-analysis loop for a single case.

use crate::error::{PipelineError, PipelineResult};
use crate::models::{DoctorOverride, InitialAnalysisBundle, IntegratedAnalysisReport};
use crate::pipeline::IntegrationEngine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Where a case is in the integrate/revise cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseState {
    Initial,
    Integrated,
    Revising,
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseState::Initial => write!(f, "initial"),
            CaseState::Integrated => write!(f, "integrated"),
            CaseState::Revising => write!(f, "revising"),
        }
    }
}

/// One persisted integration result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportVersion {
    /// Starts at 1 and increases by one per successful integration.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor_override: Option<DoctorOverride>,
    pub report: IntegratedAnalysisReport,
}

/// A case's fixed initial bundle and its most recent integrated report.
///
/// The bundle never changes after creation. Every revision integrates the
/// original bundle with the newest override only; earlier overrides are
/// not accumulated.
#[derive(Debug, Clone)]
pub struct CaseSession {
    case_id: String,
    bundle: InitialAnalysisBundle,
    state: CaseState,
    latest: Option<ReportVersion>,
    next_version: u32,
}

impl CaseSession {
    pub fn new(case_id: impl Into<String>, bundle: InitialAnalysisBundle) -> Self {
        Self {
            case_id: case_id.into(),
            bundle,
            state: CaseState::Initial,
            latest: None,
            next_version: 1,
        }
    }

    /// Continue numbering after versions already stored for this case.
    pub fn numbered_after(mut self, version: u32) -> Self {
        self.next_version = version + 1;
        self
    }

    /// Rebuild an integrated session from stored data.
    pub fn resume(
        case_id: impl Into<String>,
        bundle: InitialAnalysisBundle,
        latest: ReportVersion,
    ) -> Self {
        Self {
            case_id: case_id.into(),
            bundle,
            state: CaseState::Integrated,
            next_version: latest.version + 1,
            latest: Some(latest),
        }
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    pub fn bundle(&self) -> &InitialAnalysisBundle {
        &self.bundle
    }

    pub fn state(&self) -> CaseState {
        self.state
    }

    pub fn latest(&self) -> Option<&ReportVersion> {
        self.latest.as_ref()
    }

    pub fn report(&self) -> Option<&IntegratedAnalysisReport> {
        self.latest.as_ref().map(|v| &v.report)
    }

    pub fn doctor_override(&self) -> Option<&DoctorOverride> {
        self.latest.as_ref().and_then(|v| v.doctor_override.as_ref())
    }

    /// First integration, without an override.
    pub async fn integrate(&mut self, engine: &IntegrationEngine) -> PipelineResult<ReportVersion> {
        if self.state != CaseState::Initial {
            return Err(PipelineError::InvalidTransition {
                action: "integrate",
                state: self.state,
            });
        }

        let report = engine.integrate(&self.bundle, None).await?;
        Ok(self.commit(report, None))
    }

    /// Re-integrate the original bundle with a clinician's override.
    ///
    /// On failure the session keeps its previous report and state.
    pub async fn revise(
        &mut self,
        engine: &IntegrationEngine,
        doctor_override: DoctorOverride,
    ) -> PipelineResult<ReportVersion> {
        if self.state != CaseState::Integrated {
            return Err(PipelineError::InvalidTransition {
                action: "revise",
                state: self.state,
            });
        }

        self.state = CaseState::Revising;
        match engine.integrate(&self.bundle, Some(&doctor_override)).await {
            Ok(report) => Ok(self.commit(report, Some(doctor_override))),
            Err(e) => {
                warn!(case_id = %self.case_id, error = %e, "Revision failed; keeping previous report");
                self.state = CaseState::Integrated;
                Err(e)
            }
        }
    }

    fn commit(
        &mut self,
        report: IntegratedAnalysisReport,
        doctor_override: Option<DoctorOverride>,
    ) -> ReportVersion {
        let version = ReportVersion {
            version: self.next_version,
            created_at: Utc::now(),
            doctor_override,
            report,
        };

        info!(
            case_id = %self.case_id,
            version = version.version,
            consensus = %version.report.integrated_diagnosis.consensus,
            requires_manual_review = version.report.requires_manual_review,
            "Integrated report ready"
        );

        self.state = CaseState::Integrated;
        self.next_version += 1;
        self.latest = Some(version.clone());
        version
    }
}
