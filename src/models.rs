//! Data models for the clinical analysis pipeline.
//!
//! This module contains the core data structures that flow between the
//! pipeline stages: the patient intake, the per-capability outcomes, the
//! fan-out bundle, and the integrated report.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of symptoms accepted on an intake.
pub const MAX_SYMPTOMS: usize = 10;

/// A yes/no intake flag with optional free-text details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagDetail {
    /// Whether the flag is set.
    pub present: bool,
    /// Free-text details entered by the registering clinician.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Immutable patient record created at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientIntake {
    /// Patient (and case) identifier.
    pub id: String,
    pub name: String,
    pub age: u32,
    pub gender: String,
    /// Free-text clinical history.
    pub history: String,
    /// Ordered symptom list (1..=10 entries).
    pub symptoms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medications: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addiction: Option<FlagDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_history: Option<FlagDetail>,
}

impl PatientIntake {
    /// Validate the intake before handing it to the pipeline.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Patient id must not be empty".to_string());
        }
        if self.symptoms.is_empty() {
            return Err("At least one symptom is required".to_string());
        }
        if self.symptoms.len() > MAX_SYMPTOMS {
            return Err(format!(
                "At most {} symptoms are accepted, got {}",
                MAX_SYMPTOMS,
                self.symptoms.len()
            ));
        }
        if self.symptoms.iter().any(|s| s.trim().is_empty()) {
            return Err("Symptoms must not be blank".to_string());
        }
        Ok(())
    }

    /// Medications currently taken, or an empty slice.
    pub fn medication_list(&self) -> &[String] {
        self.medications.as_deref().unwrap_or(&[])
    }
}

/// Tagged outcome of one capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CapabilityResult<T> {
    Fulfilled { value: T },
    Rejected { reason: String },
}

impl<T> CapabilityResult<T> {
    pub fn fulfilled(value: T) -> Self {
        Self::Fulfilled { value }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled { .. })
    }

    /// The fulfilled value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Fulfilled { value } => Some(value),
            Self::Rejected { .. } => None,
        }
    }

    /// The rejection reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Fulfilled { .. } => None,
            Self::Rejected { reason } => Some(reason),
        }
    }
}

impl<T, E: fmt::Display> From<Result<T, E>> for CapabilityResult<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::fulfilled(value),
            Err(e) => Self::rejected(e.to_string()),
        }
    }
}

/// Names of the three fan-out capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Diagnosis,
    RelapsePrediction,
    Summary,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [
        CapabilityKind::Diagnosis,
        CapabilityKind::RelapsePrediction,
        CapabilityKind::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diagnosis => "diagnosis",
            Self::RelapsePrediction => "relapse_prediction",
            Self::Summary => "summary",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single diagnosis hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisHypothesis {
    pub diagnosis: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl DiagnosisHypothesis {
    /// A hypothesis with only a label and confidence.
    pub fn named(diagnosis: impl Into<String>, confidence: f64) -> Self {
        Self {
            diagnosis: diagnosis.into(),
            confidence,
            reasoning: String::new(),
            evidence: Vec::new(),
        }
    }
}

/// Output of the diagnosis capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisAssessment {
    /// Hypotheses ordered by confidence, highest first.
    pub hypotheses: Vec<DiagnosisHypothesis>,
}

impl DiagnosisAssessment {
    /// The top-ranked hypothesis.
    pub fn primary(&self) -> Option<&DiagnosisHypothesis> {
        self.hypotheses.first()
    }
}

/// Relapse risk band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "Low"),
            RiskLevel::Moderate => write!(f, "Moderate"),
            RiskLevel::High => write!(f, "High"),
        }
    }
}

/// Output of the relapse-risk capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelapsePrediction {
    /// Relapse probability as a percentage (0..=100).
    pub risk_percentage: f64,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub protective_factors: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Output of the summarization capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSummary {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    /// Conditions the summary considers likely, most likely first.
    #[serde(default)]
    pub suspected_conditions: Vec<String>,
}

/// Aggregate of the three fan-out outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialAnalysisBundle {
    pub diagnosis: CapabilityResult<DiagnosisAssessment>,
    pub relapse_prediction: CapabilityResult<RelapsePrediction>,
    pub summary: CapabilityResult<CaseSummary>,
}

impl InitialAnalysisBundle {
    /// Number of fulfilled slots.
    pub fn fulfilled_count(&self) -> usize {
        [
            self.diagnosis.is_fulfilled(),
            self.relapse_prediction.is_fulfilled(),
            self.summary.is_fulfilled(),
        ]
        .into_iter()
        .filter(|ok| *ok)
        .count()
    }

    /// True when every slot was rejected.
    pub fn is_empty(&self) -> bool {
        self.fulfilled_count() == 0
    }

    /// True when at least one slot was rejected.
    pub fn is_degraded(&self) -> bool {
        self.fulfilled_count() < CapabilityKind::ALL.len()
    }

    /// Per-capability rejection reasons, in fan-out order.
    pub fn failures(&self) -> Vec<CapabilityFailure> {
        let slots = [
            (CapabilityKind::Diagnosis, self.diagnosis.reason()),
            (
                CapabilityKind::RelapsePrediction,
                self.relapse_prediction.reason(),
            ),
            (CapabilityKind::Summary, self.summary.reason()),
        ];

        slots
            .into_iter()
            .filter_map(|(capability, reason)| {
                reason.map(|r| CapabilityFailure {
                    capability,
                    reason: r.to_string(),
                })
            })
            .collect()
    }
}

/// One rejected capability, as recorded for a degraded bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFailure {
    pub capability: CapabilityKind,
    pub reason: String,
}

/// Agreement across the analysis sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusLevel {
    /// No material disagreement.
    Full,
    /// Non-conflicting but incomplete overlap.
    Partial,
    /// Contradictory hypotheses or safety-relevant disagreement.
    Conflicting,
}

impl fmt::Display for ConsensusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusLevel::Full => write!(f, "Full"),
            ConsensusLevel::Partial => write!(f, "Partial"),
            ConsensusLevel::Conflicting => write!(f, "Conflicting"),
        }
    }
}

impl ConsensusLevel {
    pub fn emoji(&self) -> &'static str {
        match self {
            ConsensusLevel::Full => "🟢",
            ConsensusLevel::Partial => "🟡",
            ConsensusLevel::Conflicting => "🔴",
        }
    }
}

/// Unified diagnosis produced by the integration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratedDiagnosis {
    pub primary: DiagnosisHypothesis,
    #[serde(default)]
    pub secondary: Vec<DiagnosisHypothesis>,
    /// Overall confidence in [0, 1].
    pub confidence: f64,
    pub consensus: ConsensusLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PharmacologicalPlan {
    #[serde(default)]
    pub first_line: Vec<String>,
    #[serde(default)]
    pub second_line: Vec<String>,
    /// Medications judged unsafe for this patient. Always present.
    #[serde(default)]
    pub contraindicated: Vec<String>,
}

impl PharmacologicalPlan {
    /// Medications appearing both as a recommendation and as contraindicated.
    pub fn unsafe_recommendations(&self) -> Vec<String> {
        let contraindicated: Vec<String> = self
            .contraindicated
            .iter()
            .map(|m| m.trim().to_lowercase())
            .collect();

        self.first_line
            .iter()
            .chain(&self.second_line)
            .filter(|m| contraindicated.contains(&m.trim().to_lowercase()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsychotherapeuticPlan {
    #[serde(default)]
    pub recommended: Vec<String>,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub frequency: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentPlan {
    #[serde(default)]
    pub pharmacological: PharmacologicalPlan,
    #[serde(default)]
    pub psychotherapeutic: PsychotherapeuticPlan,
}

impl TreatmentPlan {
    /// True when the plan has neither a first-line medication nor a
    /// psychotherapeutic recommendation.
    pub fn is_empty(&self) -> bool {
        self.pharmacological.first_line.is_empty() && self.psychotherapeutic.recommended.is_empty()
    }
}

/// The final integrated clinical report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratedAnalysisReport {
    pub integrated_diagnosis: IntegratedDiagnosis,
    pub treatment_plan: TreatmentPlan,
    pub clinical_discussion: String,
    #[serde(default)]
    pub references: Vec<String>,
    pub requires_manual_review: bool,
}

/// Clinician feedback that dominates a re-integration pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DoctorOverride(String);

impl DoctorOverride {
    /// Wrap override text, rejecting blank input.
    pub fn new(text: impl Into<String>) -> Option<Self> {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn text(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DoctorOverride {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DoctorOverride::new(value).ok_or_else(|| "Doctor override must not be empty".to_string())
    }
}

impl From<DoctorOverride> for String {
    fn from(value: DoctorOverride) -> Self {
        value.0
    }
}

impl fmt::Display for DoctorOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable processing status of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisStatus::Pending => write!(f, "pending"),
            AnalysisStatus::Processing => write!(f, "processing"),
            AnalysisStatus::Completed => write!(f, "completed"),
            AnalysisStatus::Failed => write!(f, "failed"),
        }
    }
}
