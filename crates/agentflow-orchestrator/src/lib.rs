//! # agentflow-orchestrator
//!
//! Workflow engine for agentflow.
//!
//! This crate provides:
//! - Declarative workflow definitions with a single bounded refinement loop
//! - A pure state machine deciding the next step from stage output
//! - The engine that runs stages under timeouts and publishes status
//! - Conversation history for support workflows
//! - Markdown activity logging

mod activity_logger;
mod conversation;
mod orchestrator;
mod run_state;
mod stages;
mod state_machine;
mod workflow;

pub use activity_logger::ActivityLogger;
pub use conversation::ConversationHistory;
pub use orchestrator::{
    CancelFlag, EngineConfig, Orchestrator, RunHandle, StatusObserver, TracingObserver, Transition,
};
pub use run_state::{RunState, StageOutput, DEFAULT_REFINEMENT_CRITIQUE};
pub use stages::StageSet;
pub use state_machine::{advance, holds, start, Next, Signals};
pub use workflow::{
    agentic_rag, corrective_rag, customer_support, self_rag, Edge, LoopBound, Node, Predicate,
    Step, Target, WorkflowDefinition, WorkflowKind,
};
