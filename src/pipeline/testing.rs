//! Stub capabilities and fixtures shared by the pipeline tests.

use crate::capability::{
    AnalysisCapability, Capabilities, DiagnosisRequest, IntegrationDraft, IntegrationRequest,
    RelapseRequest, SummaryRequest,
};
use crate::error::CapabilityError;
use crate::models::{
    CapabilityResult, CaseSummary, DiagnosisAssessment, DiagnosisHypothesis, FlagDetail,
    InitialAnalysisBundle, PatientIntake, PharmacologicalPlan, PsychotherapeuticPlan,
    RelapsePrediction, RiskLevel, TreatmentPlan,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Capability that answers with a canned result after an optional delay.
pub struct StubCapability<Req, Resp> {
    pub name: &'static str,
    pub delay: Duration,
    pub outcome: Result<Resp, CapabilityError>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<Req>>,
}

impl<Req, Resp> StubCapability<Req, Resp> {
    pub fn ok(name: &'static str, value: Resp) -> Self {
        Self {
            name,
            delay: Duration::ZERO,
            outcome: Ok(value),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &'static str, error: CapabilityError) -> Self {
        Self {
            name,
            delay: Duration::ZERO,
            outcome: Err(error),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<Req: Clone, Resp> StubCapability<Req, Resp> {
    pub fn last_request(&self) -> Option<Req> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl<Req, Resp> AnalysisCapability<Req, Resp> for StubCapability<Req, Resp>
where
    Req: Clone + Send + Sync,
    Resp: Clone + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn invoke(&self, request: &Req) -> Result<Resp, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }
}

pub type StubDiagnosis = StubCapability<DiagnosisRequest, DiagnosisAssessment>;
pub type StubRelapse = StubCapability<RelapseRequest, RelapsePrediction>;
pub type StubSummary = StubCapability<SummaryRequest, CaseSummary>;
pub type StubIntegration = StubCapability<IntegrationRequest, IntegrationDraft>;

pub fn intake() -> PatientIntake {
    PatientIntake {
        id: "case-042".to_string(),
        name: "Jordan Doe".to_string(),
        age: 41,
        gender: "non-binary".to_string(),
        history: "Two prior depressive episodes, last one in 2021.".to_string(),
        symptoms: vec![
            "persistent low mood".to_string(),
            "early waking".to_string(),
            "loss of interest".to_string(),
        ],
        medications: Some(vec!["Sertraline 50mg".to_string()]),
        addiction: Some(FlagDetail {
            present: true,
            details: Some("alcohol, in remission since 2022".to_string()),
        }),
        family_history: Some(FlagDetail {
            present: false,
            details: None,
        }),
    }
}

pub fn assessment(hypotheses: &[(&str, f64)]) -> DiagnosisAssessment {
    DiagnosisAssessment {
        hypotheses: hypotheses
            .iter()
            .map(|(label, confidence)| DiagnosisHypothesis {
                diagnosis: label.to_string(),
                confidence: *confidence,
                reasoning: format!("Pattern consistent with {}", label),
                evidence: vec!["session notes".to_string()],
            })
            .collect(),
    }
}

pub fn summary(conditions: &[&str]) -> CaseSummary {
    CaseSummary {
        summary: "Adult with recurrent low mood and sleep disturbance.".to_string(),
        key_points: vec!["recurrent course".to_string()],
        suspected_conditions: conditions.iter().map(|c| c.to_string()).collect(),
    }
}

pub fn relapse(percentage: f64) -> RelapsePrediction {
    RelapsePrediction {
        risk_percentage: percentage,
        risk_level: if percentage >= 60.0 {
            RiskLevel::High
        } else if percentage >= 30.0 {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        },
        risk_factors: vec!["prior episodes".to_string()],
        protective_factors: vec!["stable housing".to_string()],
        recommendations: vec!["monthly follow-up".to_string()],
    }
}

pub fn complete_bundle(diagnosis: DiagnosisAssessment, summary: CaseSummary) -> InitialAnalysisBundle {
    InitialAnalysisBundle {
        diagnosis: CapabilityResult::fulfilled(diagnosis),
        relapse_prediction: CapabilityResult::fulfilled(relapse(72.0)),
        summary: CapabilityResult::fulfilled(summary),
    }
}

pub fn rejected_bundle() -> InitialAnalysisBundle {
    InitialAnalysisBundle {
        diagnosis: CapabilityResult::rejected("capability unavailable: offline"),
        relapse_prediction: CapabilityResult::rejected("request timed out after 30s"),
        summary: CapabilityResult::rejected("response did not match the expected schema"),
    }
}

pub fn actionable_plan() -> TreatmentPlan {
    TreatmentPlan {
        pharmacological: PharmacologicalPlan {
            first_line: vec!["Sertraline".to_string()],
            second_line: vec!["Mirtazapine".to_string()],
            contraindicated: vec![],
        },
        psychotherapeutic: PsychotherapeuticPlan {
            recommended: vec!["Cognitive Behavioral Therapy".to_string()],
            duration: "16 weeks".to_string(),
            frequency: "weekly".to_string(),
        },
    }
}

pub fn draft(primary: &str, confidence: f64) -> IntegrationDraft {
    IntegrationDraft {
        primary: Some(DiagnosisHypothesis::named(primary, confidence)),
        secondary: vec![],
        confidence,
        consensus: None,
        treatment_plan: actionable_plan(),
        clinical_discussion: "Findings converge on a recurrent mood disorder.".to_string(),
        references: vec!["APA Practice Guideline, 2019".to_string()],
    }
}

/// Capabilities whose fan-out stubs all succeed.
pub fn capabilities_with(integration: Arc<StubIntegration>) -> Capabilities {
    Capabilities {
        diagnosis: Arc::new(StubDiagnosis::ok(
            "diagnosis",
            assessment(&[("Major Depressive Disorder", 0.9)]),
        )),
        relapse: Arc::new(StubRelapse::ok("relapse_prediction", relapse(72.0))),
        summary: Arc::new(StubSummary::ok(
            "summary",
            summary(&["Major Depressive Disorder"]),
        )),
        integration,
    }
}
