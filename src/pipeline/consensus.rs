//! Agreement classification across analysis sources.
//!
//! Each source that names a diagnosis casts a vote made of its primary label
//! and every label it mentions. Two votes disagree when their primaries
//! differ and neither source mentions the other's primary at all. Besides the
//! fan-out slots, the integrated report itself votes, as does the clinician
//! when an override states a diagnosis.

use crate::models::{ConsensusLevel, InitialAnalysisBundle, PharmacologicalPlan};

/// Normalize a diagnosis label for comparison.
///
/// Lowercases, maps punctuation to spaces and collapses whitespace, so
/// `"Major Depressive Disorder (recurrent)"` becomes
/// `"major depressive disorder recurrent"`.
pub fn normalize_label(label: &str) -> String {
    label
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether two diagnosis labels refer to the same condition.
///
/// Labels match when equal after normalization or when one is a whole-word
/// run inside the other ("bipolar ii disorder" matches "bipolar ii
/// disorder current episode depressed").
pub fn labels_match(a: &str, b: &str) -> bool {
    let a = normalize_label(a);
    let b = normalize_label(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }

    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    format!(" {} ", long).contains(&format!(" {} ", short))
}

/// One diagnosis-bearing source.
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub source: &'static str,
    pub primary: String,
    pub labels: Vec<String>,
}

impl Vote {
    /// A vote whose primary is the first label. `None` when no label is given.
    pub fn from_labels(source: &'static str, labels: &[String]) -> Option<Self> {
        labels.first().map(|primary| Self {
            source,
            primary: primary.clone(),
            labels: labels.to_vec(),
        })
    }

    fn mentions(&self, label: &str) -> bool {
        self.labels.iter().any(|l| labels_match(l, label))
    }

    fn contradicts(&self, other: &Vote) -> bool {
        !labels_match(&self.primary, &other.primary)
            && !self.mentions(&other.primary)
            && !other.mentions(&self.primary)
    }
}

/// Collect the votes of the diagnosis and summary slots.
pub fn collect_votes(bundle: &InitialAnalysisBundle) -> Vec<Vote> {
    let mut votes = Vec::new();

    if let Some(assessment) = bundle.diagnosis.value() {
        let labels: Vec<String> = assessment
            .hypotheses
            .iter()
            .map(|h| h.diagnosis.clone())
            .collect();
        votes.extend(Vote::from_labels("diagnosis", &labels));
    }

    if let Some(summary) = bundle.summary.value() {
        votes.extend(Vote::from_labels("summary", &summary.suspected_conditions));
    }

    votes
}

/// Whether a fulfilled slot names no diagnosis at all.
fn has_silent_slot(bundle: &InitialAnalysisBundle) -> bool {
    let silent_diagnosis = bundle
        .diagnosis
        .value()
        .is_some_and(|d| d.hypotheses.is_empty());
    let silent_summary = bundle
        .summary
        .value()
        .is_some_and(|s| s.suspected_conditions.is_empty());
    silent_diagnosis || silent_summary
}

/// Classify agreement for an integrated report.
///
/// - `Conflicting`: a recommended medication is also contraindicated, or two
///   votes contradict each other.
/// - `Full`: every fan-out slot settled successfully, each names a diagnosis
///   and all primaries match.
/// - `Partial`: anything else (missing or silent slots, overlap only among
///   secondary hypotheses).
///
/// `extra` holds the votes cast outside the bundle: the integrated report and
/// the clinician's override.
pub fn classify_consensus(
    bundle: &InitialAnalysisBundle,
    extra: &[Vote],
    plan: &PharmacologicalPlan,
) -> ConsensusLevel {
    if !plan.unsafe_recommendations().is_empty() {
        return ConsensusLevel::Conflicting;
    }

    let mut votes = collect_votes(bundle);
    votes.extend(extra.iter().cloned());
    let mut all_primaries_match = true;

    for (i, a) in votes.iter().enumerate() {
        for b in &votes[i + 1..] {
            if a.contradicts(b) {
                return ConsensusLevel::Conflicting;
            }
            if !labels_match(&a.primary, &b.primary) {
                all_primaries_match = false;
            }
        }
    }

    if !bundle.is_degraded() && !has_silent_slot(bundle) && all_primaries_match {
        ConsensusLevel::Full
    } else {
        ConsensusLevel::Partial
    }
}
