//! Markdown and JSON report generation.
//!
//! This module renders a [`CaseReport`] for the reviewing clinician.

use super::{CaseReport, ReportMetadata};
use crate::config::ReportConfig;
use crate::models::{
    CapabilityResult, CaseSummary, DiagnosisAssessment, IntegratedDiagnosis, RelapsePrediction,
    TreatmentPlan,
};
use anyhow::Result;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &CaseReport, options: &ReportConfig) -> String {
    let mut output = String::new();

    // Title
    output.push_str("# Case Consultation Report\n\n");

    output.push_str(&generate_metadata_section(&report.metadata));

    if report.integrated.requires_manual_review {
        output.push_str(
            "> ⚠️ **Manual review required.** Consensus, confidence or the treatment plan \
             did not meet the automatic acceptance criteria.\n\n",
        );
    }

    output.push_str(&generate_diagnosis_section(
        &report.integrated.integrated_diagnosis,
    ));
    output.push_str(&generate_treatment_section(&report.integrated.treatment_plan));

    if options.include_discussion && !report.integrated.clinical_discussion.trim().is_empty() {
        output.push_str("## Clinical Discussion\n\n");
        output.push_str(report.integrated.clinical_discussion.trim());
        output.push_str("\n\n");
    }

    if options.include_initial_analyses {
        output.push_str("## Initial Analyses\n\n");
        output.push_str(&render_slot(
            "Diagnosis",
            &report.initial_analysis.diagnosis,
            generate_hypotheses_block,
        ));
        output.push_str(&render_slot(
            "Relapse Risk",
            &report.initial_analysis.relapse_prediction,
            generate_relapse_block,
        ));
        output.push_str(&render_slot(
            "Case Summary",
            &report.initial_analysis.summary,
            generate_summary_block,
        ));
    }

    output.push_str(&generate_references_section(&report.integrated.references));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Case:** {}\n", metadata.case_id));
    section.push_str(&format!("- **Report Version:** {}\n", metadata.version));
    section.push_str(&format!(
        "- **Analysis Date:** {}\n",
        metadata.analysis_date.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Model Used:** `{}`\n", metadata.model_used));
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    if let Some(ref text) = metadata.doctor_override {
        section.push_str(&format!("- **Clinician Override:** {}\n", text));
    }
    section.push('\n');

    section
}

/// Generate the integrated diagnosis section.
fn generate_diagnosis_section(diagnosis: &IntegratedDiagnosis) -> String {
    let mut section = String::new();

    section.push_str("## Integrated Diagnosis\n\n");
    section.push_str(&format!(
        "**Primary:** {} ({:.0}%)\n\n",
        diagnosis.primary.diagnosis,
        diagnosis.primary.confidence * 100.0
    ));
    if !diagnosis.primary.reasoning.is_empty() {
        section.push_str(&format!("{}\n\n", diagnosis.primary.reasoning));
    }
    section.push_str(&format!(
        "**Overall Confidence:** {:.0}% | **Consensus:** {} {}\n\n",
        diagnosis.confidence * 100.0,
        diagnosis.consensus.emoji(),
        diagnosis.consensus
    ));

    if !diagnosis.secondary.is_empty() {
        section.push_str("### Secondary Diagnoses\n\n");
        section.push_str("| Diagnosis | Confidence |\n");
        section.push_str("|:---|:---:|\n");
        for hypothesis in &diagnosis.secondary {
            section.push_str(&format!(
                "| {} | {:.0}% |\n",
                hypothesis.diagnosis,
                hypothesis.confidence * 100.0
            ));
        }
        section.push('\n');
    }

    section
}

fn push_list(section: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    section.push_str(&format!("**{}:**\n", title));
    for item in items {
        section.push_str(&format!("- {}\n", item));
    }
    section.push('\n');
}

/// Generate the treatment plan section.
fn generate_treatment_section(plan: &TreatmentPlan) -> String {
    let mut section = String::new();

    section.push_str("## Treatment Plan\n\n");

    if plan.is_empty() {
        section.push_str("No actionable treatment recommendation was produced.\n\n");
    }

    let pharmacological = &plan.pharmacological;
    if !pharmacological.first_line.is_empty() || !pharmacological.second_line.is_empty() {
        section.push_str("### Pharmacological\n\n");
        push_list(&mut section, "First line", &pharmacological.first_line);
        push_list(&mut section, "Second line", &pharmacological.second_line);
    }
    if !pharmacological.contraindicated.is_empty() {
        push_list(
            &mut section,
            "⛔ Contraindicated",
            &pharmacological.contraindicated,
        );
    }

    let therapy = &plan.psychotherapeutic;
    if !therapy.recommended.is_empty() {
        section.push_str("### Psychotherapeutic\n\n");
        push_list(&mut section, "Recommended", &therapy.recommended);
        if !therapy.duration.is_empty() || !therapy.frequency.is_empty() {
            section.push_str(&format!(
                "*Duration: {} | Frequency: {}*\n\n",
                or_unspecified(&therapy.duration),
                or_unspecified(&therapy.frequency)
            ));
        }
    }

    section
}

fn or_unspecified(value: &str) -> &str {
    if value.is_empty() {
        "unspecified"
    } else {
        value
    }
}

/// Render one fan-out slot, or the reason it is missing.
fn render_slot<T>(title: &str, slot: &CapabilityResult<T>, render: fn(&T) -> String) -> String {
    let mut block = format!("### {}\n\n", title);
    match slot {
        CapabilityResult::Fulfilled { value } => block.push_str(&render(value)),
        CapabilityResult::Rejected { reason } => {
            block.push_str(&format!("❌ *Unavailable: {}*\n\n", reason));
        }
    }
    block
}

fn generate_hypotheses_block(assessment: &DiagnosisAssessment) -> String {
    let mut block = String::new();

    block.push_str("| Hypothesis | Confidence | Evidence |\n");
    block.push_str("|:---|:---:|:---|\n");
    for hypothesis in &assessment.hypotheses {
        block.push_str(&format!(
            "| {} | {:.0}% | {} |\n",
            hypothesis.diagnosis,
            hypothesis.confidence * 100.0,
            hypothesis.evidence.join("; ")
        ));
    }
    block.push('\n');

    block
}

fn generate_relapse_block(prediction: &RelapsePrediction) -> String {
    let mut block = format!(
        "**Risk:** {:.0}% ({})\n\n",
        prediction.risk_percentage, prediction.risk_level
    );
    push_list(&mut block, "Risk factors", &prediction.risk_factors);
    push_list(&mut block, "Protective factors", &prediction.protective_factors);
    push_list(&mut block, "Recommendations", &prediction.recommendations);
    block
}

fn generate_summary_block(summary: &CaseSummary) -> String {
    let mut block = format!("{}\n\n", summary.summary.trim());
    push_list(&mut block, "Key points", &summary.key_points);
    push_list(&mut block, "Suspected conditions", &summary.suspected_conditions);
    block
}

/// Generate the references section.
fn generate_references_section(references: &[String]) -> String {
    if references.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## References\n\n");
    for (i, reference) in references.iter().enumerate() {
        section.push_str(&format!("{}. {}\n", i + 1, reference));
    }
    section.push('\n');

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(
        "*Generated by psyconsult. Decision support only; \
         every finding must be confirmed by a licensed clinician.*\n",
    );

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &CaseReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}
