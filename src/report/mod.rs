//! Report rendering.

pub mod generator;

pub use generator::{generate_json_report, generate_markdown_report};

use crate::models::{InitialAnalysisBundle, IntegratedAnalysisReport};
use crate::session::ReportVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Information about how a report version was produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub case_id: String,
    pub version: u32,
    pub analysis_date: DateTime<Utc>,
    pub model_used: String,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor_override: Option<String>,
}

/// Everything rendered for one report version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseReport {
    pub metadata: ReportMetadata,
    pub initial_analysis: InitialAnalysisBundle,
    pub integrated: IntegratedAnalysisReport,
}

impl CaseReport {
    pub fn new(
        case_id: &str,
        bundle: &InitialAnalysisBundle,
        version: &ReportVersion,
        model_used: &str,
        duration_seconds: f64,
    ) -> Self {
        Self {
            metadata: ReportMetadata {
                case_id: case_id.to_string(),
                version: version.version,
                analysis_date: version.created_at,
                model_used: model_used.to_string(),
                duration_seconds,
                doctor_override: version
                    .doctor_override
                    .as_ref()
                    .map(|o| o.text().to_string()),
            },
            initial_analysis: bundle.clone(),
            integrated: version.report.clone(),
        }
    }
}
