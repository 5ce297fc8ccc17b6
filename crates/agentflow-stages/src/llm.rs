//! Stage functions backed by the Anthropic API
//!
//! Each adapter renders a prompt from its stage inputs, asks for a JSON reply
//! and parses it. Prompt rendering and reply parsing are plain functions so they
//! can be tested without a network.

use agentflow_core::stage::{AnswerCritic, GenerationRequest, Generator, Refiner, Router, Solver};
use agentflow_core::{
    Answer, Critique, Document, FlowError, Message, Priority, Result, RoutingDecision, Severity,
    Solution,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::client::LlmClient;

const GENERATOR_SYSTEM: &str = "You answer questions using only the numbered documents provided. \
Reply with a single JSON object: {\"answer\": string, \"confidence\": number between 0 and 1, \
\"citations\": [document ids you relied on], \"reasoning\": string}.";

const CRITIC_SYSTEM: &str = "You review an answer against its source documents. \
Reply with a single JSON object: {\"critique\": string, \"needs_refinement\": boolean, \
\"severity\": \"low\" | \"medium\" | \"high\", \"suggestion\": string or null}. \
Set needs_refinement only if a better query would produce a better answer.";

const REFINER_SYSTEM: &str = "You rewrite search queries. Reply with only the rewritten query, \
no quotes and no explanation.";

const ROUTER_SYSTEM: &str = "You triage customer support messages. Reply with a single JSON object: \
{\"category\": string, \"confidence\": number between 0 and 1, \
\"required_info\": [details still needed from the customer, empty if none], \
\"priority\": \"low\" | \"medium\" | \"high\"}.";

const SOLVER_SYSTEM: &str = "You resolve customer support requests. Reply with a single JSON object: \
{\"content\": string, \"confidence\": number between 0 and 1, \"next_steps\": [string]}.";

/// Largest prefix of a document included in prompts
const DOCUMENT_PROMPT_CHARS: usize = 2000;

/// Slice the outermost JSON object out of a model reply
///
/// Models often wrap JSON in prose or code fences.
pub fn extract_json(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

/// Parse the JSON object in a model reply
pub fn parse_reply<T: DeserializeOwned>(reply: &str) -> Result<T> {
    let json = extract_json(reply)
        .ok_or_else(|| FlowError::Stage("model reply contained no JSON object".to_string()))?;
    serde_json::from_str(json)
        .map_err(|e| FlowError::Stage(format!("model reply was not the expected JSON: {}", e)))
}

fn unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn push_documents(prompt: &mut String, documents: &[Document]) {
    if documents.is_empty() {
        prompt.push_str("No documents were retrieved.\n");
        return;
    }
    for doc in documents {
        let content: String = doc.content.chars().take(DOCUMENT_PROMPT_CHARS).collect();
        let _ = writeln!(prompt, "[{}] ({}) {}", doc.id, doc.source, content);
    }
}

fn push_history(prompt: &mut String, history: &[Message]) {
    for message in history {
        let _ = writeln!(prompt, "{}: {}", message.role, message.content);
    }
}

// ---- Generator ----

#[derive(Debug, Deserialize)]
struct GeneratedAnswer {
    answer: String,
    confidence: f32,
    #[serde(default)]
    citations: Vec<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

pub fn generation_prompt(request: &GenerationRequest<'_>) -> String {
    let mut prompt = format!("Question: {}\n\nDocuments:\n", request.query);
    push_documents(&mut prompt, request.documents);

    if !request.contexts.is_empty() {
        prompt.push_str("\nContext:\n");
        for ctx in request.contexts {
            let _ = writeln!(prompt, "- {}", ctx.content);
        }
    }
    if !request.critiques.is_empty() {
        prompt.push_str("\nReviewer notes on the documents:\n");
        for critique in request.critiques {
            let _ = writeln!(prompt, "- [{}] {} ({})", critique.id, critique.content, critique.severity);
        }
    }
    prompt
}

pub fn parse_answer(reply: &str) -> Result<Answer> {
    let parsed: GeneratedAnswer = parse_reply(reply)?;
    let mut answer = Answer::new(parsed.answer, unit(parsed.confidence)).with_citations(parsed.citations);
    answer.reasoning = parsed.reasoning.filter(|r| !r.is_empty());
    Ok(answer)
}

/// Answer generation through the model
#[derive(Debug, Clone)]
pub struct LlmGenerator {
    client: Arc<LlmClient>,
}

impl LlmGenerator {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Answer> {
        let reply = self
            .client
            .complete(Some(GENERATOR_SYSTEM), &generation_prompt(&request))
            .await?;
        parse_answer(&reply.text)
    }
}

// ---- Answer critic ----

#[derive(Debug, Deserialize)]
struct CritiqueReply {
    critique: String,
    needs_refinement: bool,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    suggestion: Option<String>,
}

pub fn critique_prompt(query: &str, answer: &Answer, documents: &[Document]) -> String {
    let mut prompt = format!(
        "Question: {}\n\nAnswer (confidence {:.2}):\n{}\n\nDocuments:\n",
        query, answer.confidence, answer.text
    );
    push_documents(&mut prompt, documents);
    prompt
}

pub fn parse_critique(reply: &str) -> Result<Critique> {
    let parsed: CritiqueReply = parse_reply(reply)?;
    let severity = parsed
        .severity
        .and_then(|s| s.parse::<Severity>().ok())
        .unwrap_or(if parsed.needs_refinement {
            Severity::High
        } else {
            Severity::Low
        });

    let mut critique = Critique::new("answer", parsed.critique, severity)
        .with_refinement(parsed.needs_refinement);
    critique.suggestion = parsed.suggestion.filter(|s| !s.is_empty());
    Ok(critique)
}

/// Answer critique through the model
#[derive(Debug, Clone)]
pub struct LlmAnswerCritic {
    client: Arc<LlmClient>,
}

impl LlmAnswerCritic {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnswerCritic for LlmAnswerCritic {
    async fn critique(&self, query: &str, answer: &Answer, documents: &[Document]) -> Result<Critique> {
        let reply = self
            .client
            .complete(Some(CRITIC_SYSTEM), &critique_prompt(query, answer, documents))
            .await?;
        parse_critique(&reply.text)
    }
}

// ---- Refiner ----

/// Query rewriting through the model
#[derive(Debug, Clone)]
pub struct LlmRefiner {
    client: Arc<LlmClient>,
}

impl LlmRefiner {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }
}

pub fn clean_refined_query(reply: &str) -> Result<String> {
    let line = reply
        .lines()
        .map(|l| l.trim().trim_matches('"').trim())
        .find(|l| !l.is_empty())
        .ok_or_else(|| FlowError::Stage("refiner returned an empty query".to_string()))?;
    Ok(line.to_string())
}

#[async_trait]
impl Refiner for LlmRefiner {
    async fn refine(&self, original_query: &str, critique: &str) -> Result<String> {
        let prompt = format!(
            "Original query: {}\nReviewer critique of the answer it produced: {}\n\
             Rewrite the query so retrieval finds better evidence.",
            original_query, critique
        );
        let reply = self.client.complete(Some(REFINER_SYSTEM), &prompt).await?;
        clean_refined_query(&reply.text)
    }
}

// ---- Router ----

#[derive(Debug, Deserialize)]
struct RouteReply {
    category: String,
    confidence: f32,
    #[serde(default)]
    required_info: Vec<String>,
    #[serde(default)]
    priority: Option<String>,
}

pub fn parse_routing(reply: &str) -> Result<RoutingDecision> {
    let parsed: RouteReply = parse_reply(reply)?;
    let priority = parsed
        .priority
        .and_then(|p| p.parse::<Priority>().ok())
        .unwrap_or_default();
    Ok(RoutingDecision::new(parsed.category, unit(parsed.confidence))
        .requiring(parsed.required_info.into_iter().filter(|i| !i.trim().is_empty()))
        .with_priority(priority))
}

/// Support triage through the model
#[derive(Debug, Clone)]
pub struct LlmRouter {
    client: Arc<LlmClient>,
}

impl LlmRouter {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Router for LlmRouter {
    async fn route(&self, message: &str, history: &[Message]) -> Result<RoutingDecision> {
        let mut prompt = String::from("Conversation so far:\n");
        push_history(&mut prompt, history);
        let _ = write!(prompt, "\nLatest message: {}", message);

        let reply = self.client.complete(Some(ROUTER_SYSTEM), &prompt).await?;
        parse_routing(&reply.text)
    }
}

// ---- Solver ----

#[derive(Debug, Deserialize)]
struct SolutionReply {
    content: String,
    confidence: f32,
    #[serde(default)]
    next_steps: Vec<String>,
}

pub fn parse_solution(reply: &str) -> Result<Solution> {
    let parsed: SolutionReply = parse_reply(reply)?;
    Ok(Solution {
        content: parsed.content,
        confidence: unit(parsed.confidence),
        next_steps: parsed.next_steps,
    })
}

/// Support resolution through the model
#[derive(Debug, Clone)]
pub struct LlmSolver {
    client: Arc<LlmClient>,
}

impl LlmSolver {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Solver for LlmSolver {
    async fn solve(&self, message: &str, history: &[Message], category: &str) -> Result<Solution> {
        let mut prompt = format!("Category: {}\n\nConversation so far:\n", category);
        push_history(&mut prompt, history);
        let _ = write!(prompt, "\nRequest to resolve: {}", message);

        let reply = self.client.complete(Some(SOLVER_SYSTEM), &prompt).await?;
        parse_solution(&reply.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::{ContextItem, ContextKind};

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"a\": {\"b\": 1}}\n```";
        assert_eq!(extract_json(reply), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[test]
    fn test_parse_answer_clamps_confidence() {
        let answer = parse_answer(
            r#"{"answer": "Paris", "confidence": 1.4, "citations": ["doc1"], "reasoning": ""}"#,
        )
        .unwrap();
        assert_eq!(answer.text, "Paris");
        assert_eq!(answer.confidence, 1.0);
        assert!(answer.citations.contains("doc1"));
        assert!(answer.reasoning.is_none());
    }

    #[test]
    fn test_parse_answer_rejects_prose() {
        let err = parse_answer("Paris is the capital of France.").unwrap_err();
        assert!(err.to_string().contains("no JSON object"));
    }

    #[test]
    fn test_parse_critique_defaults_severity() {
        let critique =
            parse_critique(r#"{"critique": "Too vague", "needs_refinement": true}"#).unwrap();
        assert!(critique.needs_refinement);
        assert_eq!(critique.severity, Severity::High);

        let critique = parse_critique(
            r#"{"critique": "", "needs_refinement": false, "severity": "medium", "suggestion": "cite"}"#,
        )
        .unwrap();
        assert_eq!(critique.severity, Severity::Medium);
        assert_eq!(critique.suggestion.as_deref(), Some("cite"));
    }

    #[test]
    fn test_parse_routing() {
        let decision = parse_routing(
            r#"{"category": "billing", "confidence": 0.7, "required_info": ["invoice_id", " "], "priority": "high"}"#,
        )
        .unwrap();
        assert_eq!(decision.category, "billing");
        assert_eq!(decision.required_info, vec!["invoice_id".to_string()]);
        assert_eq!(decision.priority, Priority::High);

        let decision =
            parse_routing(r#"{"category": "general", "confidence": 0.5, "priority": "urgent"}"#).unwrap();
        assert!(!decision.needs_clarification());
        assert_eq!(decision.priority, Priority::Medium);
    }

    #[test]
    fn test_parse_solution() {
        let solution =
            parse_solution(r#"{"content": "Reset it", "confidence": 0.9, "next_steps": ["Hold power"]}"#)
                .unwrap();
        assert_eq!(solution.next_steps.len(), 1);
    }

    #[test]
    fn test_clean_refined_query() {
        assert_eq!(
            clean_refined_query("\n  \"capital city of France\"  \n").unwrap(),
            "capital city of France"
        );
        assert!(clean_refined_query("   \n").is_err());
    }

    #[test]
    fn test_generation_prompt_lists_inputs() {
        let docs = vec![Document::new("doc1", "Paris is the capital of France.", "atlas")];
        let critiques = vec![Critique::new("doc1", "relevant", Severity::Low)];
        let contexts = vec![ContextItem::new("ctx1", ContextKind::User, "prefers short answers")];
        let request = GenerationRequest::new("capital of France?", &docs)
            .with_critiques(&critiques)
            .with_contexts(&contexts);

        let prompt = generation_prompt(&request);
        assert!(prompt.starts_with("Question: capital of France?"));
        assert!(prompt.contains("[doc1] (atlas) Paris is the capital of France."));
        assert!(prompt.contains("- prefers short answers"));
        assert!(prompt.contains("- [doc1] relevant (low)"));
    }

    #[test]
    fn test_prompt_without_documents() {
        let answer = Answer::new("unsure", 0.2);
        let prompt = critique_prompt("q", &answer, &[]);
        assert!(prompt.contains("No documents were retrieved."));
        assert!(prompt.contains("confidence 0.20"));
    }
}
