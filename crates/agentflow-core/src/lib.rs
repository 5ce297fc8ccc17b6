//! # agentflow-core
//!
//! Core types for the agentflow question-answering orchestrator.
//!
//! A query moves through a workflow of pluggable stages (context gathering,
//! query expansion, retrieval, critique, generation, routing). This crate holds
//! everything the stages and the engine agree on:
//!
//! - The artifacts a run accumulates (documents, critiques, answers, messages)
//! - The run [`Status`] lifecycle
//! - The stage contracts in [`stage`], one narrow trait per kind of work
//! - Repository-level configuration and the unified error type

pub mod config;
mod error;
pub mod fail_open;
pub mod stage;
mod types;

pub use config::FlowConfig;
pub use error::{ErrorKind, FlowError, Result};
pub use types::*;
