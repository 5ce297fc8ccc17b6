//! Deterministic in-memory stage functions
//!
//! These need no network and always give the same output for the same input,
//! which makes them the default for `agentflow run` and for tests.

use agentflow_core::stage::{
    AnswerCritic, Clarifier, ContextGatherer, DocumentCritic, Followup, GenerationRequest,
    Generator, QueryExpander, Refiner, Retriever, Router, Solver,
};
use agentflow_core::{
    Answer, ContextItem, ContextKind, Critique, Document, DocumentReview, FlowError,
    FollowupResult, Message, Priority, Reply, Result, RoutingDecision, Solution,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "about", "can", "do", "does", "for", "how", "i", "in", "is", "it",
    "me", "my", "of", "on", "or", "the", "to", "what", "when", "where", "which", "who", "why",
    "with",
];

/// Lowercased content words of a text
fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.len() > 1 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Share of the query's terms found in `content`, rounded to two places
fn overlap(query: &BTreeSet<String>, content: &str) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    let content = terms(content);
    let hits = query.iter().filter(|t| content.contains(*t)).count();
    ((hits as f32 / query.len() as f32) * 100.0).round() / 100.0
}

// ---- Retrieval ----

#[derive(Debug, Deserialize)]
struct KnowledgeEntry {
    id: String,
    content: String,
    #[serde(default = "default_source")]
    source: String,
}

fn default_source() -> String {
    "knowledge_base".to_string()
}

/// Keyword-overlap retriever over a fixed document set
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    documents: Vec<Document>,
    limit: usize,
}

impl KnowledgeBase {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents,
            limit: 3,
        }
    }

    /// Small general-knowledge corpus
    pub fn sample() -> Self {
        Self::new(vec![
            Document::new("doc1", "Paris is the capital of France.", "World Atlas"),
            Document::new(
                "doc2",
                "The Earth orbits around the Sun in an elliptical path.",
                "Astronomy Basics",
            ),
            Document::new(
                "doc3",
                "Photosynthesis is the process by which plants convert sunlight into energy.",
                "Biology 101",
            ),
            Document::new(
                "doc4",
                "The solar system consists of the Sun and its planetary system.",
                "Astronomy Database",
            ),
            Document::new(
                "doc5",
                "Planets orbit the Sun in elliptical paths.",
                "Physics Encyclopedia",
            ),
        ])
    }

    /// Load `[{"id", "content", "source"?}, ...]` from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let entries: Vec<KnowledgeEntry> = serde_json::from_str(&content)?;
        let mut seen = BTreeSet::new();
        for entry in &entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(FlowError::Config(format!(
                    "duplicate document id '{}' in {}",
                    entry.id,
                    path.display()
                )));
            }
        }
        Ok(Self::new(
            entries
                .into_iter()
                .map(|e| Document::new(e.id, e.content, e.source))
                .collect(),
        ))
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl Retriever for KnowledgeBase {
    async fn retrieve(&self, query: &str, _contexts: &[ContextItem]) -> Result<Vec<Document>> {
        let query_terms = terms(query);
        let mut scored: Vec<Document> = self
            .documents
            .iter()
            .filter_map(|doc| {
                let score = overlap(&query_terms, &doc.content);
                (score > 0.0).then(|| doc.clone().with_relevance(score))
            })
            .collect();

        // Stable sort keeps corpus order among equal scores
        scored.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(self.limit);
        tracing::debug!("Knowledge base matched {} document(s)", scored.len());
        Ok(scored)
    }
}

// ---- Context ----

/// Returns the same context items for every query
#[derive(Debug, Clone, Default)]
pub struct StaticContexts {
    items: Vec<ContextItem>,
}

impl StaticContexts {
    pub fn new(items: Vec<ContextItem>) -> Self {
        Self { items }
    }

    /// A search-history item and a stated user preference
    pub fn sample() -> Self {
        let at = |hour, minute| Utc.with_ymd_and_hms(2024, 12, 8, hour, minute, 0).single();
        let mut history = ContextItem::new(
            "ctx1",
            ContextKind::User,
            "Previous search about solar system",
        )
        .with_relevance(0.8);
        history.timestamp = at(18, 30);
        let mut preference = ContextItem::new(
            "ctx2",
            ContextKind::System,
            "User preference for detailed scientific explanations",
        )
        .with_relevance(0.9);
        preference.timestamp = at(18, 45);
        Self::new(vec![history, preference])
    }
}

#[async_trait]
impl ContextGatherer for StaticContexts {
    async fn gather(&self, _query: &str) -> Result<Vec<ContextItem>> {
        Ok(self.items.clone())
    }
}

/// Appends the leading words of each context item to the query
#[derive(Debug, Clone, Copy, Default)]
pub struct TermExpander;

#[async_trait]
impl QueryExpander for TermExpander {
    async fn expand(&self, query: &str, contexts: &[ContextItem]) -> Result<String> {
        if contexts.is_empty() {
            return Ok(query.to_string());
        }
        let lead_terms: Vec<String> = contexts
            .iter()
            .map(|ctx| ctx.content.split_whitespace().take(2).collect::<Vec<_>>().join(" "))
            .collect();
        Ok(format!("{} (considering: {})", query, lead_terms.join(", ")))
    }
}

// ---- Critique ----

/// Reviews each document by its relevance score
#[derive(Debug, Clone, Copy, Default)]
pub struct RelevanceCritic;

#[async_trait]
impl DocumentCritic for RelevanceCritic {
    async fn review(&self, _query: &str, documents: &[Document]) -> Result<Vec<DocumentReview>> {
        Ok(documents
            .iter()
            .map(|doc| match doc.relevance_score {
                Some(score) if score > 0.8 => {
                    DocumentReview::new(doc.id.clone(), format!("Directly relevant ({:.2})", score))
                }
                Some(score) => DocumentReview::new(
                    doc.id.clone(),
                    format!("Partially relevant ({:.2})", score),
                )
                .with_suggestion("Consider refining the search terms for better relevance"),
                None => DocumentReview::new(doc.id.clone(), "Relevance unknown")
                    .with_suggestion("Score documents before critiquing them"),
            })
            .collect())
    }
}

/// Asks for refinement while the answer's confidence is below a threshold
#[derive(Debug, Clone, Copy)]
pub struct ThresholdCritic {
    min_confidence: f32,
}

impl ThresholdCritic {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }
}

impl Default for ThresholdCritic {
    fn default() -> Self {
        Self::new(0.5)
    }
}

#[async_trait]
impl AnswerCritic for ThresholdCritic {
    async fn critique(&self, _query: &str, answer: &Answer, documents: &[Document]) -> Result<Critique> {
        if documents.is_empty() {
            return Ok(Critique::refine("answer", "No supporting documents were found"));
        }
        if answer.confidence < self.min_confidence {
            return Ok(Critique::refine(
                "answer",
                format!(
                    "Confidence {:.2} is below {:.2}; the answer needs more context",
                    answer.confidence, self.min_confidence
                ),
            ));
        }
        Ok(Critique::accept("answer"))
    }
}

// ---- Generation ----

/// Builds an answer from the best retrieved document
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveGenerator;

#[async_trait]
impl Generator for ExtractiveGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Answer> {
        let Some(best) = request.documents.first() else {
            return Ok(Answer::new(
                format!("No documents matched \"{}\".", request.query),
                0.0,
            )
            .with_reasoning("Nothing was retrieved"));
        };

        let cited: Vec<&Document> = request
            .documents
            .iter()
            .filter(|d| d.relevance_score.unwrap_or(0.0) > 0.0)
            .collect();
        let confidence = best.relevance_score.unwrap_or(0.5);
        let improvements: Vec<String> = request
            .critiques
            .iter()
            .filter_map(|c| c.suggestion.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut reasoning = format!("Best match {} from {}", best.id, best.source);
        if !request.contexts.is_empty() {
            reasoning.push_str(&format!(", with {} context item(s)", request.contexts.len()));
        }

        Ok(Answer::new(best.content.clone(), confidence)
            .with_citations(cited.iter().map(|d| d.id.clone()))
            .with_reasoning(reasoning)
            .with_improvements(improvements))
    }
}

// ---- Refinement ----

/// Annotates the original query with the critique
#[derive(Debug, Clone, Copy, Default)]
pub struct SuffixRefiner;

#[async_trait]
impl Refiner for SuffixRefiner {
    async fn refine(&self, original_query: &str, critique: &str) -> Result<String> {
        Ok(format!("{} (refined based on: {})", original_query, critique))
    }
}

// ---- Customer support ----

struct Category {
    name: &'static str,
    keywords: &'static [&'static str],
    required: &'static [&'static str],
    priority: Priority,
}

const CATEGORIES: &[Category] = &[
    Category {
        name: "technical_support",
        keywords: &["crash", "error", "boot", "slow", "install", "laptop", "device", "broken"],
        required: &["device_type", "os_version"],
        priority: Priority::Medium,
    },
    Category {
        name: "billing",
        keywords: &["bill", "charge", "charged", "invoice", "refund", "payment"],
        required: &["account_email", "invoice_id"],
        priority: Priority::High,
    },
    Category {
        name: "account",
        keywords: &["password", "login", "account", "locked", "username"],
        required: &["account_email"],
        priority: Priority::Medium,
    },
];

/// Detail names a message already supplies, keyed by the words that reveal them
const DETAIL_HINTS: &[(&str, &[&str])] = &[
    ("device_type", &["laptop", "desktop", "phone", "tablet", "iphone", "android", "mac", "pc"]),
    ("os_version", &["windows", "macos", "ios", "linux", "ubuntu", "android"]),
    ("account_email", &["@"]),
    ("invoice_id", &["inv", "invoice #", "invoice number"]),
];

fn supplied(detail: &str, text: &str) -> bool {
    DETAIL_HINTS
        .iter()
        .find(|(name, _)| *name == detail)
        .is_some_and(|(_, hints)| hints.iter().any(|h| text.contains(h)))
}

/// Keyword router that asks for details the conversation has not supplied
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordRouter;

#[async_trait]
impl Router for KeywordRouter {
    async fn route(&self, message: &str, history: &[Message]) -> Result<RoutingDecision> {
        let words = terms(message);
        let best = CATEGORIES
            .iter()
            .map(|c| (c, c.keywords.iter().filter(|k| words.contains(**k)).count()))
            .filter(|(_, hits)| *hits > 0)
            .max_by_key(|(_, hits)| *hits);

        let Some((category, hits)) = best else {
            return Ok(RoutingDecision::new("general", 0.5).with_priority(Priority::Low));
        };

        // Details can come from any earlier user message too
        let mut said = message.to_lowercase();
        for earlier in history.iter().filter(|m| m.role == agentflow_core::Role::User) {
            said.push(' ');
            said.push_str(&earlier.content.to_lowercase());
        }
        let missing: Vec<&str> = category
            .required
            .iter()
            .copied()
            .filter(|detail| !supplied(detail, &said))
            .collect();

        let confidence = (0.6 + 0.1 * hits as f32).min(0.95);
        Ok(RoutingDecision::new(category.name, confidence)
            .requiring(missing)
            .with_priority(category.priority))
    }
}

fn humanize(detail: &str) -> String {
    detail.replace('_', " ")
}

/// Asks for the missing details by name
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateClarifier;

#[async_trait]
impl Clarifier for TemplateClarifier {
    async fn clarify(
        &self,
        _message: &str,
        _history: &[Message],
        required_info: &[String],
    ) -> Result<Reply> {
        let wanted: Vec<String> = required_info.iter().map(|d| humanize(d)).collect();
        let content = match wanted.as_slice() {
            [] => "Could you tell me a bit more about the problem?".to_string(),
            [only] => format!("Could you please specify your {}?", only),
            [init @ .., last] => format!(
                "Could you please specify your {} and {}?",
                init.join(", "),
                last
            ),
        };
        Ok(Reply {
            content,
            missing_info: required_info.to_vec(),
        })
    }
}

/// Canned resolution steps per category
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateSolver;

#[async_trait]
impl Solver for TemplateSolver {
    async fn solve(&self, message: &str, _history: &[Message], category: &str) -> Result<Solution> {
        let (steps, confidence): (&[&str], f32) = match category {
            "technical_support" => (
                &[
                    "Restart the device",
                    "Install pending system updates",
                    "Reinstall the affected application",
                ],
                0.88,
            ),
            "billing" => (
                &[
                    "Review the charge in your billing history",
                    "Reply with the invoice id if it looks wrong",
                ],
                0.85,
            ),
            "account" => (
                &[
                    "Use the password reset link",
                    "Check your inbox for the verification email",
                ],
                0.9,
            ),
            _ => (&["Describe the issue in more detail"], 0.6),
        };

        let first_line = message.lines().next().unwrap_or(message);
        Ok(Solution {
            content: format!(
                "Based on your issue (\"{}\"), here are the steps to resolve it: {}.",
                first_line,
                steps.join("; ")
            ),
            confidence,
            next_steps: steps.iter().map(|s| s.to_string()).collect(),
        })
    }
}

/// Fixed follow-up offering the usual next actions
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateFollowup;

#[async_trait]
impl Followup for TemplateFollowup {
    async fn follow_up(&self, _solution: &str, _history: &[Message]) -> Result<FollowupResult> {
        Ok(FollowupResult {
            content: "Is there anything else you would like to know about this solution?"
                .to_string(),
            suggested_actions: vec![
                "Try another solution".to_string(),
                "Contact human support".to_string(),
                "Close ticket".to_string(),
            ],
        })
    }
}
