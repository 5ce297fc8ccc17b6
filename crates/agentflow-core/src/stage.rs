//! Stage function contracts
//!
//! Each trait is one kind of work the orchestrator can delegate. Inputs are the
//! narrow slice of run state the stage needs, never the run state itself.
//! Implementations report failure through [`FlowError`](crate::FlowError); the
//! orchestrator does not retry, so an implementation that wants retries must do
//! them internally and stay safe to re-invoke.

use async_trait::async_trait;

use crate::{
    Answer, ContextItem, Critique, Document, DocumentReview, FollowupResult, Message, Reply,
    Result, RoutingDecision, Solution,
};

/// Everything a generator may look at
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// The current (possibly expanded or refined) query
    pub query: &'a str,
    pub documents: &'a [Document],
    pub critiques: &'a [Critique],
    pub contexts: &'a [ContextItem],
}

impl<'a> GenerationRequest<'a> {
    pub fn new(query: &'a str, documents: &'a [Document]) -> Self {
        Self {
            query,
            documents,
            critiques: &[],
            contexts: &[],
        }
    }

    pub fn with_critiques(mut self, critiques: &'a [Critique]) -> Self {
        self.critiques = critiques;
        self
    }

    pub fn with_contexts(mut self, contexts: &'a [ContextItem]) -> Self {
        self.contexts = contexts;
        self
    }
}

/// Collects context items (user history, preferences) for a query
#[async_trait]
pub trait ContextGatherer: Send + Sync {
    async fn gather(&self, query: &str) -> Result<Vec<ContextItem>>;
}

/// Rewrites a query using high-relevance context
#[async_trait]
pub trait QueryExpander: Send + Sync {
    /// `contexts` holds only items above the workflow's expansion threshold
    async fn expand(&self, query: &str, contexts: &[ContextItem]) -> Result<String>;
}

/// Fetches documents for a query
#[async_trait]
pub trait Retriever: Send + Sync {
    /// `contexts` is empty for workflows that do not gather context
    async fn retrieve(&self, query: &str, contexts: &[ContextItem]) -> Result<Vec<Document>>;
}

/// Reviews retrieved documents
#[async_trait]
pub trait DocumentCritic: Send + Sync {
    /// Annotation key this critic writes under
    fn name(&self) -> &str {
        "critique"
    }

    async fn review(&self, query: &str, documents: &[Document]) -> Result<Vec<DocumentReview>>;
}

/// Judges a generated answer against its evidence
#[async_trait]
pub trait AnswerCritic: Send + Sync {
    async fn critique(&self, query: &str, answer: &Answer, documents: &[Document])
        -> Result<Critique>;
}

/// Produces an answer
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Answer>;
}

/// Rewrites the original query in response to a critique
#[async_trait]
pub trait Refiner: Send + Sync {
    async fn refine(&self, original_query: &str, critique: &str) -> Result<String>;
}

/// Classifies a support message
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, message: &str, history: &[Message]) -> Result<RoutingDecision>;
}

/// Asks the user for missing details
#[async_trait]
pub trait Clarifier: Send + Sync {
    async fn clarify(
        &self,
        message: &str,
        history: &[Message],
        required_info: &[String],
    ) -> Result<Reply>;
}

/// Answers a fully specified support request
#[async_trait]
pub trait Solver: Send + Sync {
    async fn solve(&self, message: &str, history: &[Message], category: &str) -> Result<Solution>;
}

/// Proposes next actions after a solution
#[async_trait]
pub trait Followup: Send + Sync {
    async fn follow_up(&self, solution: &str, history: &[Message]) -> Result<FollowupResult>;
}
