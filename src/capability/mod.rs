//! Analysis capabilities.
//!
//! Every model-backed step of the pipeline is an [`AnalysisCapability`]: a
//! typed unary operation that either returns a structured response or fails.
//! The pipeline only ever talks to this trait, so orchestration can be
//! exercised against stub capabilities.

pub mod ollama;

use crate::error::CapabilityError;
use crate::models::{
    CaseSummary, ConsensusLevel, DiagnosisAssessment, DiagnosisHypothesis, InitialAnalysisBundle,
    RelapsePrediction, TreatmentPlan,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use ollama::{OllamaCapability, OllamaClient, OllamaConfig};

/// A typed, possibly failing analysis operation.
#[async_trait]
pub trait AnalysisCapability<Req, Resp>: Send + Sync
where
    Req: Sync,
    Resp: Send,
{
    /// Capability identifier used in logs.
    fn name(&self) -> &'static str;

    /// Run the analysis for one request.
    async fn invoke(&self, request: &Req) -> Result<Resp, CapabilityError>;
}

/// Input for diagnosis hypothesis generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisRequest {
    pub session_notes: Vec<String>,
    pub history: String,
}

/// Input for relapse-risk prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelapseRequest {
    pub behavioral_description: String,
    pub history: String,
    pub risk_factors: String,
}

/// Input for case summarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub session_notes: String,
    pub history: String,
}

/// Input for the integration generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRequest {
    pub bundle: InitialAnalysisBundle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doctor_override: Option<String>,
}

/// Raw output of the integration generation call, before the engine's
/// deterministic post-processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationDraft {
    #[serde(default)]
    pub primary: Option<DiagnosisHypothesis>,
    #[serde(default)]
    pub secondary: Vec<DiagnosisHypothesis>,
    pub confidence: f64,
    /// Consensus as judged by the model. Advisory only.
    #[serde(default)]
    pub consensus: Option<ConsensusLevel>,
    #[serde(default)]
    pub treatment_plan: TreatmentPlan,
    #[serde(default)]
    pub clinical_discussion: String,
    #[serde(default)]
    pub references: Vec<String>,
}

pub type DiagnosisCapability = dyn AnalysisCapability<DiagnosisRequest, DiagnosisAssessment>;
pub type RelapseCapability = dyn AnalysisCapability<RelapseRequest, RelapsePrediction>;
pub type SummaryCapability = dyn AnalysisCapability<SummaryRequest, CaseSummary>;
pub type IntegrationCapability = dyn AnalysisCapability<IntegrationRequest, IntegrationDraft>;

/// The full set of capabilities the pipeline needs.
#[derive(Clone)]
pub struct Capabilities {
    pub diagnosis: Arc<DiagnosisCapability>,
    pub relapse: Arc<RelapseCapability>,
    pub summary: Arc<SummaryCapability>,
    pub integration: Arc<IntegrationCapability>,
}

impl Capabilities {
    /// Build Ollama-backed capabilities sharing one HTTP client.
    pub fn ollama(config: OllamaConfig) -> anyhow::Result<Self> {
        let client = Arc::new(OllamaClient::new(config)?);

        Ok(Self {
            diagnosis: Arc::new(OllamaCapability::<DiagnosisRequest, DiagnosisAssessment>::new(
                "diagnosis",
                client.clone(),
            )),
            relapse: Arc::new(OllamaCapability::<RelapseRequest, RelapsePrediction>::new(
                "relapse_prediction",
                client.clone(),
            )),
            summary: Arc::new(OllamaCapability::<SummaryRequest, CaseSummary>::new(
                "summary",
                client.clone(),
            )),
            integration: Arc::new(OllamaCapability::<IntegrationRequest, IntegrationDraft>::new(
                "integration",
                client,
            )),
        })
    }
}

/// Schema checks applied to every capability response at the stage boundary.
pub trait Validate: Sized {
    /// Check the response and normalize it, or explain why it is malformed.
    fn validated(self) -> Result<Self, CapabilityError>;
}

fn check_unit_interval(field: &str, value: f64) -> Result<(), CapabilityError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CapabilityError::Schema(format!(
            "{} must be within [0, 1], got {}",
            field, value
        )))
    }
}

fn check_hypothesis(hypothesis: &DiagnosisHypothesis) -> Result<(), CapabilityError> {
    if hypothesis.diagnosis.trim().is_empty() {
        return Err(CapabilityError::Schema(
            "diagnosis hypothesis has an empty label".to_string(),
        ));
    }
    check_unit_interval("hypothesis confidence", hypothesis.confidence)
}

impl Validate for DiagnosisAssessment {
    fn validated(mut self) -> Result<Self, CapabilityError> {
        if self.hypotheses.is_empty() {
            return Err(CapabilityError::Schema(
                "diagnosis response contains no hypotheses".to_string(),
            ));
        }
        for hypothesis in &self.hypotheses {
            check_hypothesis(hypothesis)?;
        }

        // Stable sort keeps the model's order among equal confidences.
        self.hypotheses.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(self)
    }
}

impl Validate for RelapsePrediction {
    fn validated(self) -> Result<Self, CapabilityError> {
        if !self.risk_percentage.is_finite() || !(0.0..=100.0).contains(&self.risk_percentage) {
            return Err(CapabilityError::Schema(format!(
                "risk_percentage must be within [0, 100], got {}",
                self.risk_percentage
            )));
        }
        Ok(self)
    }
}

impl Validate for CaseSummary {
    fn validated(mut self) -> Result<Self, CapabilityError> {
        if self.summary.trim().is_empty() {
            return Err(CapabilityError::Schema("summary text is empty".to_string()));
        }
        self.suspected_conditions.retain(|c| !c.trim().is_empty());
        Ok(self)
    }
}

impl Validate for IntegrationDraft {
    fn validated(mut self) -> Result<Self, CapabilityError> {
        if !self.confidence.is_finite() {
            return Err(CapabilityError::Schema(
                "integration confidence is not a number".to_string(),
            ));
        }
        if let Some(primary) = &self.primary {
            if primary.diagnosis.trim().is_empty() {
                self.primary = None;
            } else {
                check_unit_interval("primary confidence", primary.confidence)?;
            }
        }
        self.secondary.retain(|h| !h.diagnosis.trim().is_empty());
        for hypothesis in &self.secondary {
            check_hypothesis(hypothesis)?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnosis_validation_sorts_by_confidence() {
        let assessment = DiagnosisAssessment {
            hypotheses: vec![
                DiagnosisHypothesis::named("Generalized Anxiety Disorder", 0.4),
                DiagnosisHypothesis::named("Major Depressive Disorder", 0.8),
            ],
        };

        let validated = assessment.validated().unwrap();
        assert_eq!(
            validated.primary().map(|h| h.diagnosis.as_str()),
            Some("Major Depressive Disorder")
        );
    }

    #[test]
    fn test_diagnosis_validation_rejects_bad_confidence() {
        let assessment = DiagnosisAssessment {
            hypotheses: vec![DiagnosisHypothesis::named("Major Depressive Disorder", 90.0)],
        };
        assert!(matches!(
            assessment.validated(),
            Err(CapabilityError::Schema(_))
        ));

        let empty = DiagnosisAssessment { hypotheses: vec![] };
        assert!(empty.validated().is_err());
    }

    #[test]
    fn test_relapse_validation_range() {
        let mut prediction = RelapsePrediction {
            risk_percentage: 72.0,
            risk_level: crate::models::RiskLevel::High,
            risk_factors: vec![],
            protective_factors: vec![],
            recommendations: vec![],
        };
        assert!(prediction.clone().validated().is_ok());

        prediction.risk_percentage = 120.0;
        assert!(prediction.clone().validated().is_err());

        prediction.risk_percentage = f64::NAN;
        assert!(prediction.validated().is_err());
    }

    #[test]
    fn test_summary_validation_drops_blank_conditions() {
        let summary = CaseSummary {
            summary: "Patient reports persistent low mood.".to_string(),
            key_points: vec![],
            suspected_conditions: vec!["".to_string(), "Dysthymia".to_string()],
        };
        let validated = summary.validated().unwrap();
        assert_eq!(validated.suspected_conditions, vec!["Dysthymia".to_string()]);

        let blank = CaseSummary {
            summary: "  ".to_string(),
            key_points: vec![],
            suspected_conditions: vec![],
        };
        assert!(blank.validated().is_err());
    }

    #[test]
    fn test_draft_validation_clears_blank_primary() {
        let draft = IntegrationDraft {
            primary: Some(DiagnosisHypothesis::named("", 0.5)),
            secondary: vec![DiagnosisHypothesis::named(" ", 0.2)],
            confidence: 0.8,
            consensus: None,
            treatment_plan: TreatmentPlan::default(),
            clinical_discussion: String::new(),
            references: vec![],
        };

        let validated = draft.validated().unwrap();
        assert!(validated.primary.is_none());
        assert!(validated.secondary.is_empty());
    }

    #[test]
    fn test_draft_deserializes_with_defaults() {
        let json = r#"{"confidence": 0.75}"#;
        let draft: IntegrationDraft = serde_json::from_str(json).unwrap();
        assert!(draft.primary.is_none());
        assert!(draft.treatment_plan.pharmacological.contraindicated.is_empty());
    }
}
