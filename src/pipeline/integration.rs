//! Integration of the fan-out results into one clinical report.
//!
//! The engine makes a single generation call and then applies deterministic
//! post-processing, so the primary diagnosis, override dominance, consensus
//! and review flag never depend on how the draft was produced.

use super::consensus::{classify_consensus, labels_match, normalize_label, Vote};
use crate::capability::{IntegrationCapability, IntegrationDraft, IntegrationRequest, Validate};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    ConsensusLevel, DiagnosisHypothesis, DoctorOverride, InitialAnalysisBundle,
    IntegratedAnalysisReport, IntegratedDiagnosis, TreatmentPlan,
};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Label used when no source names a diagnosis.
pub const UNDETERMINED_DIAGNOSIS: &str = "Undetermined";

/// Markers that introduce a diagnosis the clinician asserts.
const DIAGNOSIS_MARKERS: [&str; 2] = ["diagnosis:", "dx:"];

/// Markers that introduce differentials. These are never promoted.
const DIFFERENTIAL_MARKERS: [&str; 3] = ["differential diagnosis:", "differential:", "ddx:"];

/// Thresholds applied after generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegrationPolicy {
    /// Reports below this overall confidence require manual review.
    pub review_confidence_threshold: f64,
    /// Upper bound on overall confidence when any fan-out slot failed.
    pub degraded_confidence_cap: f64,
}

impl Default for IntegrationPolicy {
    fn default() -> Self {
        Self {
            review_confidence_threshold: 0.7,
            degraded_confidence_cap: 0.6,
        }
    }
}

/// The review rule: conflicting consensus, low confidence, or a plan with no
/// actionable recommendation.
pub fn requires_manual_review(
    consensus: ConsensusLevel,
    confidence: f64,
    plan: &TreatmentPlan,
    threshold: f64,
) -> bool {
    consensus == ConsensusLevel::Conflicting || confidence < threshold || plan.is_empty()
}

/// Reconciles an [`InitialAnalysisBundle`] and an optional override.
#[derive(Clone)]
pub struct IntegrationEngine {
    capability: Arc<IntegrationCapability>,
    policy: IntegrationPolicy,
}

impl IntegrationEngine {
    pub fn new(capability: Arc<IntegrationCapability>, policy: IntegrationPolicy) -> Self {
        Self { capability, policy }
    }

    /// Produce an integrated report.
    ///
    /// Fails with [`PipelineError::InsufficientEvidence`] when every slot of
    /// the bundle was rejected, and with [`PipelineError::Integration`] when
    /// the generation call fails. No fallback report is ever fabricated.
    pub async fn integrate(
        &self,
        bundle: &InitialAnalysisBundle,
        doctor_override: Option<&DoctorOverride>,
    ) -> PipelineResult<IntegratedAnalysisReport> {
        if bundle.is_empty() {
            warn!("Refusing to integrate: all initial analyses failed");
            return Err(PipelineError::InsufficientEvidence);
        }

        let request = IntegrationRequest {
            bundle: bundle.clone(),
            doctor_override: doctor_override.map(|o| o.text().to_string()),
        };

        info!(
            fulfilled = bundle.fulfilled_count(),
            with_override = doctor_override.is_some(),
            "Running integration"
        );

        let draft = self
            .capability
            .invoke(&request)
            .await
            .and_then(Validate::validated)
            .map_err(|e| {
                error!(capability = self.capability.name(), error = %e, "Integration call failed");
                PipelineError::Integration(e)
            })?;

        Ok(self.finalize(bundle, doctor_override, draft))
    }

    /// Apply the deterministic rules to a validated draft.
    pub fn finalize(
        &self,
        bundle: &InitialAnalysisBundle,
        doctor_override: Option<&DoctorOverride>,
        draft: IntegrationDraft,
    ) -> IntegratedAnalysisReport {
        let known = known_hypotheses(bundle, &draft);
        let stated = doctor_override
            .map(|o| stated_diagnoses(o.text(), &known))
            .unwrap_or_default();

        let mut primary = draft
            .primary
            .clone()
            .unwrap_or_else(|| fallback_primary(bundle));
        let mut secondary = draft.secondary.clone();

        if let Some(first) = stated.confirmed.first() {
            if !labels_match(&primary.diagnosis, first) {
                let promoted = take_matching(&mut secondary, first)
                    .or_else(|| known.iter().find(|h| labels_match(&h.diagnosis, first)).cloned())
                    .unwrap_or_else(|| stated_hypothesis(first, primary.confidence));
                debug!(
                    previous = %primary.diagnosis,
                    promoted = %promoted.diagnosis,
                    "Override promoted a new primary diagnosis"
                );
                let demoted = std::mem::replace(&mut primary, promoted);
                if normalize_label(&demoted.diagnosis) != normalize_label(UNDETERMINED_DIAGNOSIS) {
                    secondary.insert(0, demoted);
                }
            }
        }
        for label in stated.confirmed.iter().skip(1) {
            add_secondary(&primary, &mut secondary, stated_hypothesis(label, 0.0));
        }
        for label in &stated.differential {
            let hypothesis = known
                .iter()
                .find(|h| labels_match(&h.diagnosis, label))
                .cloned()
                .unwrap_or_else(|| differential_hypothesis(label));
            add_secondary(&primary, &mut secondary, hypothesis);
        }

        dedupe_secondary(&primary, &mut secondary);

        let mut treatment_plan = draft.treatment_plan;
        dedupe_case_insensitive(&mut treatment_plan.pharmacological.contraindicated);

        let votes = report_votes(&stated, &primary, &secondary);
        let consensus = classify_consensus(bundle, &votes, &treatment_plan.pharmacological);
        if let Some(advisory) = draft.consensus {
            if advisory != consensus {
                debug!(%advisory, %consensus, "Model consensus differs from computed consensus");
            }
        }

        let mut confidence = draft.confidence.clamp(0.0, 1.0);
        if bundle.is_degraded() {
            confidence = confidence.min(self.policy.degraded_confidence_cap);
        }

        let requires_manual_review = requires_manual_review(
            consensus,
            confidence,
            &treatment_plan,
            self.policy.review_confidence_threshold,
        );

        if treatment_plan.is_empty() {
            warn!("Integrated plan has no actionable recommendation; flagging for review");
        }

        IntegratedAnalysisReport {
            integrated_diagnosis: IntegratedDiagnosis {
                primary,
                secondary,
                confidence,
                consensus,
            },
            treatment_plan,
            clinical_discussion: draft.clinical_discussion,
            references: draft.references,
            requires_manual_review,
        }
    }
}

/// Every hypothesis the bundle or draft already names.
fn known_hypotheses(
    bundle: &InitialAnalysisBundle,
    draft: &IntegrationDraft,
) -> Vec<DiagnosisHypothesis> {
    let mut known: Vec<DiagnosisHypothesis> = Vec::new();

    if let Some(assessment) = bundle.diagnosis.value() {
        known.extend(assessment.hypotheses.iter().cloned());
    }
    known.extend(draft.primary.iter().cloned());
    known.extend(draft.secondary.iter().cloned());
    if let Some(summary) = bundle.summary.value() {
        known.extend(
            summary
                .suspected_conditions
                .iter()
                .map(|c| suggested_by_summary(c)),
        );
    }

    known
}

fn suggested_by_summary(label: &str) -> DiagnosisHypothesis {
    DiagnosisHypothesis {
        diagnosis: label.to_string(),
        confidence: 0.0,
        reasoning: "Suggested by the case summary.".to_string(),
        evidence: Vec::new(),
    }
}

fn stated_hypothesis(label: &str, confidence: f64) -> DiagnosisHypothesis {
    DiagnosisHypothesis {
        diagnosis: label.to_string(),
        confidence,
        reasoning: "Stated by the reviewing clinician.".to_string(),
        evidence: Vec::new(),
    }
}

fn differential_hypothesis(label: &str) -> DiagnosisHypothesis {
    DiagnosisHypothesis {
        diagnosis: label.to_string(),
        confidence: 0.0,
        reasoning: "Listed as a differential by the reviewing clinician.".to_string(),
        evidence: Vec::new(),
    }
}

fn add_secondary(
    primary: &DiagnosisHypothesis,
    secondary: &mut Vec<DiagnosisHypothesis>,
    hypothesis: DiagnosisHypothesis,
) {
    let present = labels_match(&primary.diagnosis, &hypothesis.diagnosis)
        || secondary
            .iter()
            .any(|h| labels_match(&h.diagnosis, &hypothesis.diagnosis));
    if !present {
        secondary.push(hypothesis);
    }
}

/// Votes cast by the report itself and by the clinician's override.
///
/// An override that asserts a diagnosis speaks for the report, since its
/// first diagnosis is the primary. Otherwise the finalized primary votes
/// with its secondaries as mentions.
fn report_votes(
    stated: &StatedDiagnoses,
    primary: &DiagnosisHypothesis,
    secondary: &[DiagnosisHypothesis],
) -> Vec<Vote> {
    if !stated.confirmed.is_empty() {
        let labels: Vec<String> = stated
            .confirmed
            .iter()
            .chain(&stated.differential)
            .cloned()
            .collect();
        return Vote::from_labels("doctor_override", &labels)
            .into_iter()
            .collect();
    }

    if normalize_label(&primary.diagnosis) == normalize_label(UNDETERMINED_DIAGNOSIS) {
        return Vec::new();
    }
    let labels: Vec<String> = std::iter::once(primary)
        .chain(secondary)
        .map(|h| h.diagnosis.clone())
        .collect();
    Vote::from_labels("integration", &labels)
        .into_iter()
        .collect()
}

/// Primary used when the draft names none.
fn fallback_primary(bundle: &InitialAnalysisBundle) -> DiagnosisHypothesis {
    if let Some(top) = bundle.diagnosis.value().and_then(|d| d.primary()) {
        return top.clone();
    }
    if let Some(first) = bundle
        .summary
        .value()
        .and_then(|s| s.suspected_conditions.first())
    {
        return suggested_by_summary(first);
    }
    DiagnosisHypothesis::named(UNDETERMINED_DIAGNOSIS, 0.0)
}

/// Diagnoses named in an override, in order of appearance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatedDiagnoses {
    /// Asserted diagnoses; the first one becomes the primary.
    pub confirmed: Vec<String>,
    /// Differentials. Added as secondaries only.
    pub differential: Vec<String>,
}

/// A marker occurrence and the labels that follow it.
struct MarkedSection {
    start: usize,
    body: Range<usize>,
    differential: bool,
}

/// Marker occurrences in `text`, each running to the end of its sentence
/// or the next marker.
///
/// A marker only counts at the start of a word, so `ddx:` never reads as
/// `dx:`. Where markers overlap, the earlier and longer one wins, which keeps
/// `differential diagnosis:` from reading as `diagnosis:`.
fn marked_sections(text: &str) -> Vec<MarkedSection> {
    let lowered = text.to_ascii_lowercase();

    let mut found: Vec<(usize, usize, bool)> = Vec::new();
    for (markers, differential) in [
        (&DIAGNOSIS_MARKERS[..], false),
        (&DIFFERENTIAL_MARKERS[..], true),
    ] {
        for marker in markers {
            for (pos, _) in lowered.match_indices(marker) {
                let at_word_start = lowered[..pos]
                    .chars()
                    .next_back()
                    .map_or(true, |c| !c.is_alphanumeric());
                if at_word_start {
                    found.push((pos, marker.len(), differential));
                }
            }
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let mut accepted: Vec<(usize, usize, bool)> = Vec::new();
    for (pos, len, differential) in found {
        let overlaps = accepted
            .last()
            .is_some_and(|&(start, marker_len, _)| pos < start + marker_len);
        if !overlaps {
            accepted.push((pos, len, differential));
        }
    }

    accepted
        .iter()
        .enumerate()
        .map(|(i, &(pos, len, differential))| {
            let body_start = pos + len;
            let next_marker = accepted.get(i + 1).map_or(text.len(), |next| next.0);
            let sentence_end = text[body_start..]
                .find(['.', '\n'])
                .map_or(text.len(), |offset| body_start + offset);
            MarkedSection {
                start: pos,
                body: body_start..sentence_end.min(next_marker),
                differential,
            }
        })
        .collect()
}

/// Diagnoses the clinician states in an override.
///
/// Text following `diagnosis:` or `dx:` up to the end of the sentence is
/// split on `,` and `;`, as is text following `ddx:`, `differential:` or
/// `differential diagnosis:`, which only lists differentials. Without an
/// asserting marker, any already known hypothesis named outside the
/// differential sections counts as asserted.
pub fn stated_diagnoses(text: &str, known: &[DiagnosisHypothesis]) -> StatedDiagnoses {
    let mut stated = StatedDiagnoses::default();
    let sections = marked_sections(text);

    for section in &sections {
        let target = if section.differential {
            &mut stated.differential
        } else {
            &mut stated.confirmed
        };
        for label in text[section.body.clone()].split([',', ';']) {
            let label = label.trim();
            if !label.is_empty() {
                push_unique(target, label);
            }
        }
    }

    if stated.confirmed.is_empty() {
        let mut unmarked = String::with_capacity(text.len());
        let mut cursor = 0;
        for section in &sections {
            unmarked.push_str(&text[cursor..section.start]);
            unmarked.push_str(". ");
            cursor = section.body.end;
        }
        unmarked.push_str(&text[cursor..]);

        let haystack = format!(" {} ", normalize_label(&unmarked));
        let mut mentioned: Vec<(usize, &str)> = known
            .iter()
            .filter_map(|h| {
                let needle = normalize_label(&h.diagnosis);
                if needle.is_empty() {
                    return None;
                }
                haystack
                    .find(&format!(" {} ", needle))
                    .map(|pos| (pos, h.diagnosis.as_str()))
            })
            .collect();
        mentioned.sort_by_key(|(pos, _)| *pos);

        for (_, label) in mentioned {
            push_unique(&mut stated.confirmed, label);
        }
    }

    let confirmed = &stated.confirmed;
    stated
        .differential
        .retain(|d| !confirmed.iter().any(|c| labels_match(c, d)));
    stated
}

fn push_unique(labels: &mut Vec<String>, label: &str) {
    if !labels.iter().any(|l| labels_match(l, label)) {
        labels.push(label.to_string());
    }
}

fn take_matching(hypotheses: &mut Vec<DiagnosisHypothesis>, label: &str) -> Option<DiagnosisHypothesis> {
    let index = hypotheses
        .iter()
        .position(|h| labels_match(&h.diagnosis, label))?;
    Some(hypotheses.remove(index))
}

/// Drop secondaries equal to the primary and repeated secondaries.
fn dedupe_secondary(primary: &DiagnosisHypothesis, secondary: &mut Vec<DiagnosisHypothesis>) {
    let mut seen = vec![normalize_label(&primary.diagnosis)];
    secondary.retain(|h| {
        let label = normalize_label(&h.diagnosis);
        if seen.contains(&label) {
            false
        } else {
            seen.push(label);
            true
        }
    });
}

fn dedupe_case_insensitive(items: &mut Vec<String>) {
    let mut seen: Vec<String> = Vec::new();
    items.retain(|item| {
        let key = item.trim().to_lowercase();
        if key.is_empty() || seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use crate::models::CapabilityResult;
    use crate::pipeline::testing::{
        assessment, complete_bundle, draft, rejected_bundle, summary, StubIntegration,
    };
    use tokio_test::{assert_err, assert_ok};

    fn engine(stub: Arc<StubIntegration>) -> IntegrationEngine {
        IntegrationEngine::new(stub, IntegrationPolicy::default())
    }

    fn mdd_bundle() -> InitialAnalysisBundle {
        complete_bundle(
            assessment(&[("Major Depressive Disorder", 0.9), ("Bipolar II Disorder", 0.3)]),
            summary(&["Major Depressive Disorder"]),
        )
    }

    #[tokio::test]
    async fn test_all_rejected_bundle_is_insufficient_evidence() {
        let stub = Arc::new(StubIntegration::ok(
            "integration",
            draft("Major Depressive Disorder", 0.9),
        ));
        let result = engine(stub.clone()).integrate(&rejected_bundle(), None).await;

        assert_eq!(result, Err(PipelineError::InsufficientEvidence));
        assert_eq!(stub.call_count(), 0);
    }

    #[tokio::test]
    async fn test_integration_failure_is_surfaced_unmodified() {
        let stub = Arc::new(StubIntegration::failing(
            "integration",
            CapabilityError::Timeout(120),
        ));
        let result = engine(stub).integrate(&mdd_bundle(), None).await;

        assert_eq!(
            result,
            Err(PipelineError::Integration(CapabilityError::Timeout(120)))
        );
    }

    #[tokio::test]
    async fn test_full_consensus_scenario_is_not_flagged() {
        let stub = Arc::new(StubIntegration::ok(
            "integration",
            draft("Major Depressive Disorder", 0.9),
        ));
        let report = assert_ok!(engine(stub).integrate(&mdd_bundle(), None).await);

        let diagnosis = &report.integrated_diagnosis;
        assert_eq!(diagnosis.primary.diagnosis, "Major Depressive Disorder");
        assert_eq!(diagnosis.consensus, ConsensusLevel::Full);
        assert_eq!(diagnosis.confidence, 0.9);
        assert!(!report.requires_manual_review);
    }

    #[tokio::test]
    async fn test_summary_only_bundle_is_integrated_but_flagged() {
        let bundle = InitialAnalysisBundle {
            diagnosis: CapabilityResult::rejected("capability unavailable: offline"),
            relapse_prediction: CapabilityResult::rejected("request timed out after 30s"),
            summary: CapabilityResult::fulfilled(summary(&["Major Depressive Disorder"])),
        };
        let stub = Arc::new(StubIntegration::ok(
            "integration",
            draft("Major Depressive Disorder", 0.95),
        ));

        let report = assert_ok!(engine(stub).integrate(&bundle, None).await);
        assert_eq!(report.integrated_diagnosis.consensus, ConsensusLevel::Partial);
        assert!(report.integrated_diagnosis.confidence <= 0.6);
        assert!(report.requires_manual_review);
    }

    #[tokio::test]
    async fn test_idempotent_integration_without_override() {
        let stub = Arc::new(StubIntegration::ok(
            "integration",
            draft("Major Depressive Disorder", 0.85),
        ));
        let engine = engine(stub);
        let bundle = mdd_bundle();

        let first = assert_ok!(engine.integrate(&bundle, None).await);
        let second = assert_ok!(engine.integrate(&bundle, None).await);

        assert_eq!(
            first.integrated_diagnosis.primary.diagnosis,
            second.integrated_diagnosis.primary.diagnosis
        );
        assert_eq!(
            first.integrated_diagnosis.consensus,
            second.integrated_diagnosis.consensus
        );
    }

    #[tokio::test]
    async fn test_override_is_forwarded_to_generation() {
        let stub = Arc::new(StubIntegration::ok(
            "integration",
            draft("Major Depressive Disorder", 0.9),
        ));
        let doctor_override = DoctorOverride::new("Consider Bipolar II Disorder").unwrap();
        assert_ok!(
            engine(stub.clone())
                .integrate(&mdd_bundle(), Some(&doctor_override))
                .await
        );

        let request = stub.last_request().unwrap();
        assert_eq!(
            request.doctor_override.as_deref(),
            Some("Consider Bipolar II Disorder")
        );
        assert_eq!(request.bundle, mdd_bundle());
    }

    #[tokio::test]
    async fn test_override_dominates_primary() {
        // The draft ignores the override; the engine must still honor it.
        let stub = Arc::new(StubIntegration::ok(
            "integration",
            draft("Major Depressive Disorder", 0.9),
        ));
        let engine = engine(stub);
        let bundle = complete_bundle(
            assessment(&[("Major Depressive Disorder", 0.9), ("Bipolar II Disorder", 0.3)]),
            summary(&["Major Depressive Disorder", "Bipolar II Disorder"]),
        );

        let baseline = assert_ok!(engine.integrate(&bundle, None).await);
        let doctor_override =
            DoctorOverride::new("History of hypomania was missed. Dx: Bipolar II Disorder.")
                .unwrap();
        let revised = assert_ok!(engine.integrate(&bundle, Some(&doctor_override)).await);

        assert_eq!(
            baseline.integrated_diagnosis.primary.diagnosis,
            "Major Depressive Disorder"
        );
        let primary = &revised.integrated_diagnosis.primary;
        assert_eq!(primary.diagnosis, "Bipolar II Disorder");
        // The bundle's own hypothesis is promoted with its evidence.
        assert_eq!(primary.confidence, 0.3);
        assert!(revised
            .integrated_diagnosis
            .secondary
            .iter()
            .any(|h| h.diagnosis == "Major Depressive Disorder"));
        // Both sources listed bipolar II as a differential.
        assert_eq!(
            revised.integrated_diagnosis.consensus,
            ConsensusLevel::Partial
        );
    }

    #[tokio::test]
    async fn test_override_with_unknown_diagnosis_is_conflicting() {
        let stub = Arc::new(StubIntegration::ok(
            "integration",
            draft("Major Depressive Disorder", 0.9),
        ));
        let doctor_override =
            DoctorOverride::new("diagnosis: Borderline Personality Disorder; PTSD").unwrap();
        let report = assert_ok!(
            engine(stub)
                .integrate(&mdd_bundle(), Some(&doctor_override))
                .await
        );

        let diagnosis = &report.integrated_diagnosis;
        assert_eq!(diagnosis.primary.diagnosis, "Borderline Personality Disorder");
        assert_eq!(diagnosis.primary.reasoning, "Stated by the reviewing clinician.");
        assert!(diagnosis.secondary.iter().any(|h| h.diagnosis == "PTSD"));
        assert_eq!(diagnosis.consensus, ConsensusLevel::Conflicting);
        assert!(report.requires_manual_review);
    }

    #[tokio::test]
    async fn test_empty_plan_is_flagged_not_rejected() {
        let mut empty_plan_draft = draft("Major Depressive Disorder", 0.95);
        empty_plan_draft.treatment_plan = TreatmentPlan::default();
        let stub = Arc::new(StubIntegration::ok("integration", empty_plan_draft));

        let report = assert_ok!(engine(stub).integrate(&mdd_bundle(), None).await);
        assert_eq!(report.integrated_diagnosis.consensus, ConsensusLevel::Full);
        assert!(report.requires_manual_review);
        assert!(report
            .treatment_plan
            .pharmacological
            .contraindicated
            .is_empty());
    }

    #[tokio::test]
    async fn test_malformed_draft_is_an_integration_error() {
        let mut bad = draft("Major Depressive Disorder", 0.9);
        bad.confidence = f64::NAN;
        let stub = Arc::new(StubIntegration::ok("integration", bad));

        let result = engine(stub).integrate(&mdd_bundle(), None).await;
        assert!(matches!(
            assert_err!(result),
            PipelineError::Integration(CapabilityError::Schema(_))
        ));
    }

    #[test]
    fn test_review_flag_truth_table() {
        let threshold = 0.7;
        let full_plan = crate::pipeline::testing::actionable_plan();
        let empty_plan = TreatmentPlan::default();
        let mut therapy_only = TreatmentPlan::default();
        therapy_only
            .psychotherapeutic
            .recommended
            .push("Interpersonal Therapy".to_string());

        for consensus in [
            ConsensusLevel::Full,
            ConsensusLevel::Partial,
            ConsensusLevel::Conflicting,
        ] {
            for confidence in [0.0, 0.69, 0.7, 0.95] {
                for plan in [&full_plan, &empty_plan, &therapy_only] {
                    let expected = consensus == ConsensusLevel::Conflicting
                        || confidence < threshold
                        || (plan.pharmacological.first_line.is_empty()
                            && plan.psychotherapeutic.recommended.is_empty());
                    assert_eq!(
                        requires_manual_review(consensus, confidence, plan, threshold),
                        expected,
                        "consensus={:?} confidence={} plan_empty={}",
                        consensus,
                        confidence,
                        plan.is_empty()
                    );
                }
            }
        }
    }

    #[test]
    fn test_review_flag_ignores_discussion_text() {
        let engine = IntegrationEngine::new(
            Arc::new(StubIntegration::ok("integration", draft("x", 0.5))),
            IntegrationPolicy::default(),
        );
        let bundle = mdd_bundle();

        let flags: Vec<bool> = ["", "Long discussion. ".repeat(50).as_str(), "⚠️ urgent"]
            .iter()
            .map(|text| {
                let mut d = draft("Major Depressive Disorder", 0.9);
                d.clinical_discussion = text.to_string();
                engine.finalize(&bundle, None, d).requires_manual_review
            })
            .collect();

        assert_eq!(flags, vec![false, false, false]);
    }

    #[test]
    fn test_missing_primary_falls_back_to_diagnosis_slot() {
        let engine = IntegrationEngine::new(
            Arc::new(StubIntegration::ok("integration", draft("x", 0.5))),
            IntegrationPolicy::default(),
        );
        let mut d = draft("ignored", 0.8);
        d.primary = None;
        d.secondary = vec![
            DiagnosisHypothesis::named("major depressive disorder", 0.5),
            DiagnosisHypothesis::named("Insomnia Disorder", 0.4),
            DiagnosisHypothesis::named("insomnia disorder", 0.2),
        ];

        let report = engine.finalize(&mdd_bundle(), None, d);
        let diagnosis = report.integrated_diagnosis;
        assert_eq!(diagnosis.primary.diagnosis, "Major Depressive Disorder");
        assert_eq!(diagnosis.secondary.len(), 1);
        assert_eq!(diagnosis.secondary[0].diagnosis, "Insomnia Disorder");
    }

    #[test]
    fn test_contraindications_deduplicated() {
        let engine = IntegrationEngine::new(
            Arc::new(StubIntegration::ok("integration", draft("x", 0.5))),
            IntegrationPolicy::default(),
        );
        let mut d = draft("Major Depressive Disorder", 0.9);
        d.treatment_plan.pharmacological.contraindicated = vec![
            "Bupropion".to_string(),
            "bupropion".to_string(),
            " ".to_string(),
            "Tramadol".to_string(),
        ];

        let report = engine.finalize(&mdd_bundle(), None, d);
        assert_eq!(
            report.treatment_plan.pharmacological.contraindicated,
            vec!["Bupropion".to_string(), "Tramadol".to_string()]
        );
    }

    #[test]
    fn test_stated_diagnoses_from_markers_and_mentions() {
        let known = vec![
            DiagnosisHypothesis::named("Generalized Anxiety Disorder", 0.4),
            DiagnosisHypothesis::named("Major Depressive Disorder", 0.8),
        ];

        let stated = stated_diagnoses(
            "Reviewed. DX: Cyclothymia, Insomnia Disorder. Reduce dose.",
            &known,
        );
        assert_eq!(
            stated.confirmed,
            vec!["Cyclothymia".to_string(), "Insomnia Disorder".to_string()]
        );
        assert!(stated.differential.is_empty());

        let stated = stated_diagnoses(
            "I think major depressive disorder is secondary to generalized anxiety disorder",
            &known,
        );
        assert_eq!(
            stated.confirmed,
            vec![
                "Major Depressive Disorder".to_string(),
                "Generalized Anxiety Disorder".to_string()
            ]
        );

        assert_eq!(
            stated_diagnoses("Patient improved, continue plan", &known),
            StatedDiagnoses::default()
        );
    }

    #[test]
    fn test_differential_markers_are_not_asserted() {
        let known = vec![
            DiagnosisHypothesis::named("Major Depressive Disorder", 0.8),
            DiagnosisHypothesis::named("Bipolar II Disorder", 0.3),
        ];

        for text in [
            "Agree with Major Depressive Disorder. DDx: Bipolar II Disorder.",
            "Primary remains Major Depressive Disorder. Differential diagnosis: Bipolar II Disorder.",
            "Major Depressive Disorder; differential: Bipolar II Disorder",
        ] {
            let stated = stated_diagnoses(text, &known);
            assert_eq!(
                stated.confirmed,
                vec!["Major Depressive Disorder".to_string()],
                "text: {}",
                text
            );
            assert_eq!(
                stated.differential,
                vec!["Bipolar II Disorder".to_string()],
                "text: {}",
                text
            );
        }
    }

    #[test]
    fn test_markers_need_a_word_boundary() {
        let stated = stated_diagnoses("Prodx: none. Dx: Cyclothymia; ddx: Dysthymia", &[]);
        assert_eq!(stated.confirmed, vec!["Cyclothymia".to_string()]);
        assert_eq!(stated.differential, vec!["Dysthymia".to_string()]);
    }

    #[test]
    fn test_differential_override_keeps_confirmed_primary() {
        let engine = engine(Arc::new(StubIntegration::ok("integration", draft("x", 0.5))));

        for text in [
            "Agree with Major Depressive Disorder. DDx: Bipolar II Disorder.",
            "Primary remains Major Depressive Disorder. Differential diagnosis: Bipolar II Disorder.",
        ] {
            let doctor_override = DoctorOverride::new(text).unwrap();
            let report = engine.finalize(
                &mdd_bundle(),
                Some(&doctor_override),
                draft("Major Depressive Disorder", 0.9),
            );

            let diagnosis = &report.integrated_diagnosis;
            assert_eq!(diagnosis.primary.diagnosis, "Major Depressive Disorder", "text: {}", text);
            // The differential keeps the bundle's own evidence.
            let differential = diagnosis
                .secondary
                .iter()
                .find(|h| h.diagnosis == "Bipolar II Disorder")
                .unwrap();
            assert_eq!(differential.confidence, 0.3);
            assert_eq!(diagnosis.consensus, ConsensusLevel::Full, "text: {}", text);
            assert!(!report.requires_manual_review);
        }
    }

    #[test]
    fn test_unlisted_differential_is_added_as_secondary() {
        let engine = engine(Arc::new(StubIntegration::ok("integration", draft("x", 0.5))));
        let doctor_override = DoctorOverride::new("DDx: Cyclothymia").unwrap();

        let report = engine.finalize(
            &mdd_bundle(),
            Some(&doctor_override),
            draft("Major Depressive Disorder", 0.9),
        );

        let diagnosis = &report.integrated_diagnosis;
        assert_eq!(diagnosis.primary.diagnosis, "Major Depressive Disorder");
        let added = diagnosis
            .secondary
            .iter()
            .find(|h| h.diagnosis == "Cyclothymia")
            .unwrap();
        assert_eq!(
            added.reasoning,
            "Listed as a differential by the reviewing clinician."
        );
    }

    #[test]
    fn test_primary_contradicting_every_source_is_conflicting() {
        let engine = engine(Arc::new(StubIntegration::ok("integration", draft("x", 0.5))));
        let bundle = complete_bundle(
            assessment(&[("Major Depressive Disorder", 0.9)]),
            summary(&["Major Depressive Disorder"]),
        );

        let report = engine.finalize(&bundle, None, draft("Schizophrenia", 0.9));

        assert_eq!(report.integrated_diagnosis.primary.diagnosis, "Schizophrenia");
        assert_eq!(
            report.integrated_diagnosis.consensus,
            ConsensusLevel::Conflicting
        );
        assert!(report.requires_manual_review);
    }

    #[test]
    fn test_silent_summary_keeps_consensus_partial() {
        let engine = engine(Arc::new(StubIntegration::ok("integration", draft("x", 0.5))));
        let bundle = complete_bundle(
            assessment(&[("Major Depressive Disorder", 0.9)]),
            summary(&[]),
        );

        let report = engine.finalize(&bundle, None, draft("Major Depressive Disorder", 0.9));
        assert_eq!(report.integrated_diagnosis.consensus, ConsensusLevel::Partial);
    }
}
