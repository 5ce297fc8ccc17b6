//! # agentflow-stages
//!
//! Stage functions the orchestrator can plug into a workflow.
//!
//! Two families live here:
//! - `memory`: deterministic, in-process stages (keyword retrieval, template
//!   replies). No network; used by the CLI by default and throughout tests.
//! - `llm`: stages backed by the Anthropic Messages API through [`LlmClient`],
//!   which handles auth, retries with backoff, and a circuit breaker.
//!
//! Every call is stateless. Anything a stage needs to know comes in through
//! its arguments: the query, retrieved documents, critiques, or the
//! conversation snapshot.

mod auth;
mod circuit_breaker;
mod client;
pub mod llm;
pub mod memory;
mod types;

pub use auth::{resolve_credential, Credential, OAUTH_TOKEN_ENV};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{LlmClient, RetryPolicy};
pub use llm::{LlmAnswerCritic, LlmGenerator, LlmRefiner, LlmRouter, LlmSolver};
pub use memory::{
    ExtractiveGenerator, KeywordRouter, KnowledgeBase, RelevanceCritic, StaticContexts,
    SuffixRefiner, TemplateClarifier, TemplateFollowup, TemplateSolver, TermExpander,
    ThresholdCritic,
};
pub use types::*;
