//! Case analysis pipeline.
//!
//! Fan-out of the initial analyses, deterministic integration and the
//! background task that drives a case through both stages.

pub mod consensus;
pub mod integration;
pub mod orchestrator;
pub mod task;

#[cfg(test)]
pub mod testing;

pub use integration::{IntegrationEngine, IntegrationPolicy};
pub use orchestrator::Orchestrator;
pub use task::{revise_case, spawn_case_analysis};

use crate::capability::Capabilities;

/// The two pipeline stages wired to one set of capabilities.
#[derive(Clone)]
pub struct CasePipeline {
    orchestrator: Orchestrator,
    engine: IntegrationEngine,
}

impl CasePipeline {
    pub fn new(capabilities: &Capabilities, policy: IntegrationPolicy) -> Self {
        Self {
            orchestrator: Orchestrator::new(capabilities),
            engine: IntegrationEngine::new(capabilities.integration.clone(), policy),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn engine(&self) -> &IntegrationEngine {
        &self.engine
    }
}
