//! Core type definitions for agentflow runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Run status
///
/// `Complete` and `Error` are terminal. Every other status is transient and is
/// entered right before the stage that declares it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    #[default]
    Idle,
    GatheringContext,
    ExpandingQuery,
    Retrieving,
    Critiquing,
    Analyzing,
    Generating,
    Refining,
    Routing,
    Clarifying,
    Solving,
    Complete,
    Error,
}

impl Status {
    /// Whether no further stage can run after this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Whether a stage is in flight (the original UI's "is processing")
    pub fn is_processing(&self) -> bool {
        !matches!(self, Self::Idle | Self::Complete | Self::Error)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::GatheringContext => write!(f, "gathering-context"),
            Self::ExpandingQuery => write!(f, "expanding-query"),
            Self::Retrieving => write!(f, "retrieving"),
            Self::Critiquing => write!(f, "critiquing"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Generating => write!(f, "generating"),
            Self::Refining => write!(f, "refining"),
            Self::Routing => write!(f, "routing"),
            Self::Clarifying => write!(f, "clarifying"),
            Self::Solving => write!(f, "solving"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "idle" => Ok(Self::Idle),
            "gathering-context" => Ok(Self::GatheringContext),
            "expanding-query" | "expanding" => Ok(Self::ExpandingQuery),
            "retrieving" => Ok(Self::Retrieving),
            "critiquing" => Ok(Self::Critiquing),
            "analyzing" => Ok(Self::Analyzing),
            "generating" => Ok(Self::Generating),
            "refining" => Ok(Self::Refining),
            "routing" => Ok(Self::Routing),
            "clarifying" => Ok(Self::Clarifying),
            "solving" => Ok(Self::Solving),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// Critique severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// Support ticket priority assigned by routing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Where a context item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    User,
    System,
    Historical,
}

/// Query bookkeeping for a single run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    /// The query as submitted; never changes during a run
    pub original: String,
    /// The query handed to retrieval and generation
    pub current: String,
    /// Expanded form produced by context-augmented workflows
    pub expanded: Option<String>,
    /// Last refined query produced by the refinement loop
    pub critiqued: Option<String>,
    pub refinement_count: u32,
    pub max_refinements: u32,
}

impl QueryContext {
    pub fn new(query: impl Into<String>, max_refinements: u32) -> Self {
        let query = query.into();
        Self {
            current: query.clone(),
            original: query,
            expanded: None,
            critiqued: None,
            refinement_count: 0,
            max_refinements,
        }
    }

    /// Whether another refinement pass fits under the bound
    pub fn can_refine(&self) -> bool {
        self.refinement_count < self.max_refinements
    }

    /// Record an expanded query; it becomes the current query
    pub fn apply_expansion(&mut self, expanded: impl Into<String>) {
        let expanded = expanded.into();
        self.current = expanded.clone();
        self.expanded = Some(expanded);
    }

    /// Record a refined query and count the pass
    ///
    /// Returns `false` without touching anything if the bound is already reached.
    pub fn apply_refinement(&mut self, refined: impl Into<String>) -> bool {
        if !self.can_refine() {
            return false;
        }
        let refined = refined.into();
        self.current = refined.clone();
        self.critiqued = Some(refined);
        self.refinement_count += 1;
        true
    }
}

/// A retrieved document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique within a run
    pub id: String,
    pub content: String,
    pub source: String,
    /// Relevance in [0, 1]; `None` when the retriever does not score
    pub relevance_score: Option<f32>,
    /// Free-form notes added by critique stages
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            source: source.into(),
            relevance_score: None,
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_relevance(mut self, score: f32) -> Self {
        self.relevance_score = Some(score);
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Add an annotation unless the key is already present
    ///
    /// Returns `true` if the annotation was added.
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        use std::collections::btree_map::Entry;
        match self.annotations.entry(key.into()) {
            Entry::Vacant(slot) => {
                slot.insert(value.into());
                true
            }
            Entry::Occupied(_) => false,
        }
    }
}

/// A piece of context gathered before retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub kind: ContextKind,
    pub content: String,
    pub relevance: Option<f32>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ContextItem {
    pub fn new(id: impl Into<String>, kind: ContextKind, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            content: content.into(),
            relevance: None,
            timestamp: None,
        }
    }

    pub fn with_relevance(mut self, relevance: f32) -> Self {
        self.relevance = Some(relevance);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A critique of a document or an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub id: String,
    pub content: String,
    pub severity: Severity,
    pub suggestion: Option<String>,
    pub needs_refinement: bool,
}

impl Critique {
    pub fn new(id: impl Into<String>, content: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            severity,
            suggestion: None,
            needs_refinement: false,
        }
    }

    /// A critique that accepts the answer as-is
    pub fn accept(id: impl Into<String>) -> Self {
        Self::new(id, "", Severity::Low)
    }

    /// A critique that asks for another refinement pass
    pub fn refine(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, content, Severity::High).with_refinement(true)
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_refinement(mut self, needs_refinement: bool) -> Self {
        self.needs_refinement = needs_refinement;
        self
    }
}

/// Per-document verdict returned by a document critic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReview {
    pub document_id: String,
    pub critique: String,
    pub suggestion: Option<String>,
}

impl DocumentReview {
    pub fn new(document_id: impl Into<String>, critique: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            critique: critique.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Terminal artifact of a successful run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// Ids of the documents the answer relies on
    pub citations: BTreeSet<String>,
    pub reasoning: Option<String>,
    pub needs_refinement: bool,
    pub critique: Option<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
}

impl Answer {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            citations: BTreeSet::new(),
            reasoning: None,
            needs_refinement: false,
            critique: None,
            improvements: Vec::new(),
        }
    }

    pub fn with_citations<I, S>(mut self, citations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.citations = citations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_improvements(mut self, improvements: Vec<String>) -> Self {
        self.improvements = improvements;
        self
    }
}

/// Routing verdict for a support message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub category: String,
    pub confidence: f32,
    /// Details still missing from the user; non-empty means clarify first
    #[serde(default)]
    pub required_info: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
}

impl RoutingDecision {
    pub fn new(category: impl Into<String>, confidence: f32) -> Self {
        Self {
            category: category.into(),
            confidence,
            required_info: Vec::new(),
            priority: Priority::default(),
        }
    }

    pub fn requiring<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_info = items.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn needs_clarification(&self) -> bool {
        !self.required_info.is_empty()
    }
}

/// Clarifying question sent back to the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub content: String,
    #[serde(default)]
    pub missing_info: Vec<String>,
}

/// Proposed solution for a support request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub content: String,
    pub confidence: f32,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

/// Follow-up message proposed after a solution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowupResult {
    pub content: String,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
}

/// Author of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// What a conversation message is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Greeting,
    Clarification,
    Solution,
    Followup,
    Error,
}

/// Optional metadata attached to a conversation message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub kind: Option<MessageKind>,
    pub confidence: Option<f32>,
    pub category: Option<String>,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub required_info: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

impl MessageMetadata {
    pub fn of_kind(kind: MessageKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }
}

/// One entry of a support conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: MessageMetadata,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", &Uuid::new_v4().simple().to_string()[..12]),
            role,
            content: content.into(),
            metadata: MessageMetadata::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self::new(Role::Assistant, content).with_metadata(metadata)
    }

    pub fn system(content: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self::new(Role::System, content).with_metadata(metadata)
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_display() {
        for status in [
            Status::Idle,
            Status::GatheringContext,
            Status::ExpandingQuery,
            Status::Critiquing,
            Status::Solving,
            Status::Error,
        ] {
            let parsed: Status = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("thinking".parse::<Status>().is_err());
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&Status::GatheringContext).unwrap();
        assert_eq!(json, "\"gathering-context\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(Status::Complete.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(!Status::Refining.is_terminal());
        assert!(Status::Refining.is_processing());
        assert!(!Status::Idle.is_processing());
    }

    #[test]
    fn test_query_context_refinement_is_bounded() {
        let mut ctx = QueryContext::new("why is the sky blue", 2);
        assert!(ctx.apply_refinement("why is the sky blue (scattering)"));
        assert!(ctx.apply_refinement("why is the sky blue (rayleigh)"));
        assert!(!ctx.apply_refinement("never applied"));

        assert_eq!(ctx.refinement_count, 2);
        assert_eq!(ctx.original, "why is the sky blue");
        assert_eq!(ctx.current, "why is the sky blue (rayleigh)");
        assert_eq!(ctx.critiqued.as_deref(), Some("why is the sky blue (rayleigh)"));
    }

    #[test]
    fn test_query_context_expansion_sets_current() {
        let mut ctx = QueryContext::new("planets", 0);
        ctx.apply_expansion("planets (considering: solar system)");
        assert_eq!(ctx.current, "planets (considering: solar system)");
        assert_eq!(ctx.original, "planets");
        assert!(!ctx.can_refine());
    }

    #[test]
    fn test_document_annotate_never_overwrites() {
        let mut doc = Document::new("doc1", "content", "kb").with_annotation("critique", "first");
        assert!(!doc.annotate("critique", "second"));
        assert!(doc.annotate("quality", "good"));
        assert_eq!(doc.annotations["critique"], "first");
        assert_eq!(doc.annotations.len(), 2);
    }

    #[test]
    fn test_routing_decision_needs_clarification() {
        let decision = RoutingDecision::new("technical_support", 0.85);
        assert!(!decision.needs_clarification());

        let decision = decision.requiring(["device_type", "os_version"]);
        assert!(decision.needs_clarification());
        assert_eq!(decision.required_info.len(), 2);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Message::user("hello");
        let b = Message::user("hello");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("msg_"));
        assert_eq!(a.role, Role::User);
    }

    #[test]
    fn test_answer_citations_dedupe() {
        let answer = Answer::new("text", 0.9).with_citations(["doc1", "doc2", "doc1"]);
        assert_eq!(answer.citations.len(), 2);
    }
}
