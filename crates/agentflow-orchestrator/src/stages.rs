//! Stage function registry

use agentflow_core::stage::{
    AnswerCritic, Clarifier, ContextGatherer, DocumentCritic, Followup, Generator, QueryExpander,
    Refiner, Retriever, Router, Solver,
};
use agentflow_core::{FlowError, Result};
use std::sync::Arc;

use crate::workflow::{Step, WorkflowDefinition};

/// The stage functions an orchestrator delegates to
///
/// Only the slots a workflow's steps use need to be filled;
/// [`check`](Self::check) verifies that at construction time.
#[derive(Clone, Default)]
pub struct StageSet {
    pub gatherer: Option<Arc<dyn ContextGatherer>>,
    pub expander: Option<Arc<dyn QueryExpander>>,
    pub retriever: Option<Arc<dyn Retriever>>,
    /// Merged in this order
    pub critics: Vec<Arc<dyn DocumentCritic>>,
    pub answer_critic: Option<Arc<dyn AnswerCritic>>,
    pub generator: Option<Arc<dyn Generator>>,
    pub refiner: Option<Arc<dyn Refiner>>,
    pub router: Option<Arc<dyn Router>>,
    pub clarifier: Option<Arc<dyn Clarifier>>,
    pub solver: Option<Arc<dyn Solver>>,
    pub followup: Option<Arc<dyn Followup>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gatherer(mut self, stage: impl ContextGatherer + 'static) -> Self {
        self.gatherer = Some(Arc::new(stage));
        self
    }

    pub fn with_expander(mut self, stage: impl QueryExpander + 'static) -> Self {
        self.expander = Some(Arc::new(stage));
        self
    }

    pub fn with_retriever(mut self, stage: impl Retriever + 'static) -> Self {
        self.retriever = Some(Arc::new(stage));
        self
    }

    /// Register a document critic; critics run in registration order
    pub fn with_critic(mut self, stage: impl DocumentCritic + 'static) -> Self {
        self.critics.push(Arc::new(stage));
        self
    }

    pub fn with_answer_critic(mut self, stage: impl AnswerCritic + 'static) -> Self {
        self.answer_critic = Some(Arc::new(stage));
        self
    }

    pub fn with_generator(mut self, stage: impl Generator + 'static) -> Self {
        self.generator = Some(Arc::new(stage));
        self
    }

    pub fn with_refiner(mut self, stage: impl Refiner + 'static) -> Self {
        self.refiner = Some(Arc::new(stage));
        self
    }

    pub fn with_router(mut self, stage: impl Router + 'static) -> Self {
        self.router = Some(Arc::new(stage));
        self
    }

    pub fn with_clarifier(mut self, stage: impl Clarifier + 'static) -> Self {
        self.clarifier = Some(Arc::new(stage));
        self
    }

    pub fn with_solver(mut self, stage: impl Solver + 'static) -> Self {
        self.solver = Some(Arc::new(stage));
        self
    }

    pub fn with_followup(mut self, stage: impl Followup + 'static) -> Self {
        self.followup = Some(Arc::new(stage));
        self
    }

    /// Fail with [`FlowError::MissingStage`] for the first step lacking a function
    pub fn check(&self, definition: &WorkflowDefinition) -> Result<()> {
        for step in definition.steps() {
            let missing = match step {
                Step::GatherContext => self.gatherer.is_none().then_some("context gatherer"),
                Step::ExpandQuery => self.expander.is_none().then_some("query expander"),
                Step::Retrieve => self.retriever.is_none().then_some("retriever"),
                Step::CritiqueDocuments => self.critics.is_empty().then_some("document critic"),
                Step::CritiqueAnswer => self.answer_critic.is_none().then_some("answer critic"),
                Step::Analyze => None,
                Step::Generate => self.generator.is_none().then_some("generator"),
                Step::Refine => self.refiner.is_none().then_some("refiner"),
                Step::Route => self.router.is_none().then_some("router"),
                Step::Clarify => self.clarifier.is_none().then_some("clarifier"),
                Step::Solve => {
                    if self.solver.is_none() {
                        Some("solver")
                    } else {
                        self.followup.is_none().then_some("follow-up")
                    }
                }
            };
            if let Some(stage) = missing {
                return Err(FlowError::MissingStage(format!(
                    "{} (step '{}' of workflow '{}')",
                    stage, step, definition.name
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSet")
            .field("gatherer", &self.gatherer.is_some())
            .field("expander", &self.expander.is_some())
            .field("retriever", &self.retriever.is_some())
            .field("critics", &self.critics.len())
            .field("answer_critic", &self.answer_critic.is_some())
            .field("generator", &self.generator.is_some())
            .field("refiner", &self.refiner.is_some())
            .field("router", &self.router.is_some())
            .field("clarifier", &self.clarifier.is_some())
            .field("solver", &self.solver.is_some())
            .field("followup", &self.followup.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{agentic_rag, corrective_rag};
    use agentflow_core::{ContextItem, Document};
    use async_trait::async_trait;

    struct NoDocs;

    #[async_trait]
    impl Retriever for NoDocs {
        async fn retrieve(&self, _query: &str, _contexts: &[ContextItem]) -> Result<Vec<Document>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_missing_stage_reported() {
        let stages = StageSet::new().with_retriever(NoDocs);
        let err = stages.check(&agentic_rag()).unwrap_err();
        match err {
            FlowError::MissingStage(msg) => {
                assert!(msg.contains("document critic"));
                assert!(msg.contains("critique_documents"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_first_missing_in_declaration_order() {
        let err = StageSet::new().check(&corrective_rag()).unwrap_err();
        assert!(err.to_string().contains("context gatherer"));
    }
}
