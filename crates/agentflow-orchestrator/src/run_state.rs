//! Per-run state and the merge rules for stage output
//!
//! Only the engine mutates a [`RunState`]. Everyone else sees clones.

use agentflow_core::config::PolicySettings;
use agentflow_core::{
    Answer, ContextItem, Critique, Document, DocumentReview, ErrorKind, FlowError,
    FollowupResult, Priority, QueryContext, Reply, Result, RoutingDecision, Severity, Solution,
    Status,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state_machine::Signals;
use crate::workflow::Step;

/// Fallback critique handed to the refiner when the critic gave no text
pub const DEFAULT_REFINEMENT_CRITIQUE: &str = "Needs more specific information";

/// Everything known about one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: Status,
    pub query_context: QueryContext,
    pub contexts: Vec<ContextItem>,
    pub documents: Vec<Document>,
    pub critiques: Vec<Critique>,
    pub answer: Option<Answer>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Retrieval cycles started
    pub cycles: u32,
    /// Times the loop back-edge was taken
    pub loop_iterations: u32,
    pub category: Option<String>,
    pub routing_confidence: Option<f32>,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub required_info: Vec<String>,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    /// Every status entered, in order
    pub trail: Vec<Status>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Artifacts are replaced per cycle instead of appended
    #[serde(skip)]
    replace_per_cycle: bool,
}

/// Output of one step, ready to merge
#[derive(Debug, Clone)]
pub enum StageOutput {
    Contexts(Vec<ContextItem>),
    Expanded(String),
    Documents(Vec<Document>),
    /// Reviews per critic, in critic registration order
    Reviews(Vec<(String, Vec<DocumentReview>)>),
    AnswerCritique(Critique),
    Analyzed,
    Answer(Answer),
    Refined(String),
    Routed(RoutingDecision),
    Clarified(Reply),
    Solved {
        solution: Solution,
        followup: FollowupResult,
    },
}

impl RunState {
    pub fn new(workflow: impl Into<String>, query: impl Into<String>, max_refinements: u32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow: workflow.into(),
            status: Status::Idle,
            query_context: QueryContext::new(query, max_refinements),
            contexts: Vec::new(),
            documents: Vec::new(),
            critiques: Vec::new(),
            answer: None,
            error: None,
            error_kind: None,
            cycles: 0,
            loop_iterations: 0,
            category: None,
            routing_confidence: None,
            priority: None,
            required_info: Vec::new(),
            suggested_actions: Vec::new(),
            trail: vec![Status::Idle],
            started_at: Utc::now(),
            finished_at: None,
            replace_per_cycle: false,
        }
    }

    pub fn replacing_per_cycle(mut self, replace: bool) -> Self {
        self.replace_per_cycle = replace;
        self
    }

    /// Move to a new status, recording it in the trail
    pub fn enter(&mut self, status: Status) {
        self.status = status;
        self.trail.push(status);
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Finish successfully; a run without an answer cannot complete
    pub fn complete(&mut self) -> Result<()> {
        if self.answer.is_none() {
            return Err(FlowError::Other(format!(
                "workflow '{}' finished without an answer",
                self.workflow
            )));
        }
        self.enter(Status::Complete);
        Ok(())
    }

    /// Finish with an error
    ///
    /// Documents, contexts and critiques merged so far are kept; a partial
    /// answer is not.
    pub fn fail(&mut self, error: &FlowError) {
        self.answer = None;
        self.error = Some(error.to_string());
        self.error_kind = Some(error.kind());
        self.enter(Status::Error);
    }

    /// The refinement loop stopped because it ran out of passes
    ///
    /// A zero bound counts: the critic asked for a pass that was never run.
    pub fn loop_bound_reached(&self) -> bool {
        !self.query_context.can_refine()
            && self.answer.as_ref().is_some_and(|a| a.needs_refinement)
    }

    pub fn signals(&self) -> Signals {
        Signals {
            needs_refinement: self.answer.as_ref().is_some_and(|a| a.needs_refinement),
            can_refine: self.query_context.can_refine(),
            needs_clarification: !self.required_info.is_empty(),
            loop_iterations: self.loop_iterations,
        }
    }

    /// Text handed to the refiner
    pub fn refinement_critique(&self) -> String {
        self.answer
            .as_ref()
            .and_then(|a| a.critique.clone())
            .or_else(|| {
                self.critiques
                    .last()
                    .map(|c| c.content.clone())
                    .filter(|c| !c.is_empty())
            })
            .unwrap_or_else(|| DEFAULT_REFINEMENT_CRITIQUE.to_string())
    }

    /// The answer of a completed run, or the error that ended it
    pub fn into_result(self) -> Result<Answer> {
        match (self.status, self.answer, self.error) {
            (Status::Complete, Some(answer), _) => Ok(answer),
            (_, _, Some(error)) => Err(FlowError::Other(error)),
            (status, _, None) => Err(FlowError::Other(format!(
                "run {} has not completed (status: {})",
                self.run_id, status
            ))),
        }
    }

    /// Merge one step's output into the run
    ///
    /// Invalid output (duplicate document ids, scores outside [0, 1]) is a
    /// stage failure and leaves the state untouched.
    pub fn merge(&mut self, step: Step, output: StageOutput, policy: &PolicySettings) -> Result<()> {
        match output {
            StageOutput::Contexts(items) => {
                for item in &items {
                    check_unit(step, "context relevance", item.relevance)?;
                }
                self.contexts = items;
            }
            StageOutput::Expanded(query) => {
                self.query_context.apply_expansion(query);
            }
            StageOutput::Documents(documents) => {
                self.merge_documents(step, documents)?;
            }
            StageOutput::Reviews(per_critic) => {
                self.merge_reviews(per_critic, policy);
            }
            StageOutput::AnswerCritique(critique) => {
                let Some(answer) = self.answer.as_mut() else {
                    return Err(FlowError::stage_failure(
                        step.name(),
                        FlowError::Stage("no answer to critique".to_string()),
                    ));
                };
                answer.needs_refinement = critique.needs_refinement;
                answer.critique = Some(critique.content.clone()).filter(|c| !c.is_empty());
                if self.replace_per_cycle {
                    self.critiques = vec![critique];
                } else {
                    self.critiques.push(critique);
                }
            }
            StageOutput::Analyzed => {}
            StageOutput::Answer(answer) => {
                self.merge_answer(step, answer)?;
            }
            StageOutput::Refined(query) => {
                if !self.query_context.apply_refinement(query) {
                    return Err(FlowError::Other(format!(
                        "refinement bound of {} already reached",
                        self.query_context.max_refinements
                    )));
                }
            }
            StageOutput::Routed(decision) => {
                check_unit(step, "routing confidence", Some(decision.confidence))?;
                self.category = Some(decision.category);
                self.routing_confidence = Some(decision.confidence);
                self.priority = Some(decision.priority);
                self.required_info = decision.required_info;
            }
            StageOutput::Clarified(reply) => {
                let confidence = self.routing_confidence.unwrap_or(0.0);
                self.answer = Some(Answer::new(reply.content, confidence));
                if !reply.missing_info.is_empty() {
                    self.required_info = reply.missing_info;
                }
            }
            StageOutput::Solved { solution, followup } => {
                check_unit(step, "solution confidence", Some(solution.confidence))?;
                self.answer = Some(
                    Answer::new(solution.content, solution.confidence)
                        .with_improvements(solution.next_steps),
                );
                self.suggested_actions = followup.suggested_actions;
            }
        }
        Ok(())
    }

    fn merge_documents(&mut self, step: Step, documents: Vec<Document>) -> Result<()> {
        let mut ids: HashSet<&str> = if self.replace_per_cycle {
            HashSet::new()
        } else {
            self.documents.iter().map(|d| d.id.as_str()).collect()
        };
        for doc in &documents {
            if !ids.insert(doc.id.as_str()) {
                return Err(invalid_output(step, format!("duplicate document id '{}'", doc.id)));
            }
            check_unit(step, "relevance score", doc.relevance_score)?;
        }

        self.cycles += 1;
        if self.replace_per_cycle {
            self.documents = documents;
        } else {
            self.documents.extend(documents);
        }
        Ok(())
    }

    fn merge_reviews(&mut self, per_critic: Vec<(String, Vec<DocumentReview>)>, policy: &PolicySettings) {
        for (critic, reviews) in per_critic {
            for review in reviews {
                let Some(doc) = self.documents.iter_mut().find(|d| d.id == review.document_id) else {
                    warn!(
                        "Critic '{}' reviewed unknown document '{}', ignoring",
                        critic, review.document_id
                    );
                    continue;
                };
                if !doc.annotate(critic.as_str(), review.critique.as_str()) {
                    debug!("Document '{}' already annotated by '{}'", doc.id, critic);
                }

                let severity = policy.severity_for(doc.relevance_score);
                let mut critique = Critique::new(doc.id.clone(), review.critique, severity)
                    .with_refinement(severity == Severity::High);
                critique.suggestion = review.suggestion;
                self.critiques.push(critique);
            }
        }
    }

    fn merge_answer(&mut self, step: Step, mut answer: Answer) -> Result<()> {
        check_unit(step, "answer confidence", Some(answer.confidence))?;

        let known: HashSet<&str> = self.documents.iter().map(|d| d.id.as_str()).collect();
        let before = answer.citations.len();
        answer.citations.retain(|id| known.contains(id.as_str()));
        if answer.citations.len() < before {
            warn!(
                "Dropped {} citation(s) to documents outside the run",
                before - answer.citations.len()
            );
        }

        self.answer = Some(answer);
        Ok(())
    }
}

fn invalid_output(step: Step, message: String) -> FlowError {
    FlowError::stage_failure(step.name(), FlowError::Stage(message))
}

pub(crate) fn check_unit(step: Step, what: &str, value: Option<f32>) -> Result<()> {
    match value {
        Some(v) if !(0.0..=1.0).contains(&v) => {
            Err(invalid_output(step, format!("{} {} outside [0, 1]", what, v)))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PolicySettings {
        PolicySettings::default()
    }

    #[test]
    fn test_new_run_is_idle() {
        let state = RunState::new("self-rag", "What is the capital of France?", 3);
        assert_eq!(state.status, Status::Idle);
        assert_eq!(state.trail, vec![Status::Idle]);
        assert_eq!(state.query_context.max_refinements, 3);
        assert!(state.answer.is_none());
    }

    #[test]
    fn test_documents_append_outside_loop() {
        let mut state = RunState::new("agentic-rag", "q", 0);
        state
            .merge(Step::Retrieve, StageOutput::Documents(vec![Document::new("a", "x", "kb")]), &policy())
            .unwrap();
        state
            .merge(Step::Retrieve, StageOutput::Documents(vec![Document::new("b", "y", "kb")]), &policy())
            .unwrap();
        assert_eq!(state.documents.len(), 2);
        assert_eq!(state.cycles, 2);
    }

    #[test]
    fn test_documents_replace_in_loop() {
        let mut state = RunState::new("self-rag", "q", 3).replacing_per_cycle(true);
        state
            .merge(Step::Retrieve, StageOutput::Documents(vec![Document::new("a", "x", "kb")]), &policy())
            .unwrap();
        state
            .merge(Step::Retrieve, StageOutput::Documents(vec![Document::new("a", "x2", "kb")]), &policy())
            .unwrap();
        assert_eq!(state.documents.len(), 1);
        assert_eq!(state.documents[0].content, "x2");
    }

    #[test]
    fn test_duplicate_document_ids_rejected() {
        let mut state = RunState::new("agentic-rag", "q", 0);
        let docs = vec![Document::new("a", "x", "kb"), Document::new("a", "y", "kb")];
        let err = state
            .merge(Step::Retrieve, StageOutput::Documents(docs), &policy())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StageFailure);
        assert!(state.documents.is_empty());
        assert_eq!(state.cycles, 0);
    }

    #[test]
    fn test_out_of_range_relevance_rejected() {
        let mut state = RunState::new("agentic-rag", "q", 0);
        let docs = vec![Document::new("a", "x", "kb").with_relevance(1.5)];
        assert!(state
            .merge(Step::Retrieve, StageOutput::Documents(docs), &policy())
            .is_err());
    }

    #[test]
    fn test_reviews_annotate_and_grade() {
        let mut state = RunState::new("agentic-rag", "q", 0);
        let docs = vec![
            Document::new("high", "x", "kb").with_relevance(0.9),
            Document::new("mid", "y", "kb").with_relevance(0.7),
            Document::new("low", "z", "kb").with_relevance(0.3),
        ];
        state.merge(Step::Retrieve, StageOutput::Documents(docs), &policy()).unwrap();

        let reviews = vec![
            DocumentReview::new("high", "solid"),
            DocumentReview::new("mid", "partial").with_suggestion("cite the source"),
            DocumentReview::new("low", "off topic"),
            DocumentReview::new("ghost", "not retrieved"),
        ];
        state
            .merge(
                Step::CritiqueDocuments,
                StageOutput::Reviews(vec![("critique".to_string(), reviews)]),
                &policy(),
            )
            .unwrap();

        assert_eq!(state.critiques.len(), 3);
        let severities: Vec<Severity> = state.critiques.iter().map(|c| c.severity).collect();
        assert_eq!(severities, vec![Severity::Low, Severity::Medium, Severity::High]);
        assert!(state.critiques[2].needs_refinement);
        assert_eq!(state.critiques[1].suggestion.as_deref(), Some("cite the source"));
        assert_eq!(state.documents[0].annotations["critique"], "solid");
    }

    #[test]
    fn test_second_critic_does_not_overwrite() {
        let mut state = RunState::new("agentic-rag", "q", 0);
        state
            .merge(
                Step::Retrieve,
                StageOutput::Documents(vec![Document::new("a", "x", "kb").with_relevance(0.9)]),
                &policy(),
            )
            .unwrap();
        state
            .merge(
                Step::CritiqueDocuments,
                StageOutput::Reviews(vec![
                    ("critique".to_string(), vec![DocumentReview::new("a", "first")]),
                    ("critique".to_string(), vec![DocumentReview::new("a", "second")]),
                ]),
                &policy(),
            )
            .unwrap();
        assert_eq!(state.documents[0].annotations["critique"], "first");
        assert_eq!(state.critiques.len(), 2);
    }

    #[test]
    fn test_answer_critique_requires_answer() {
        let mut state = RunState::new("self-rag", "q", 3);
        let err = state
            .merge(
                Step::CritiqueAnswer,
                StageOutput::AnswerCritique(Critique::accept("c")),
                &policy(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("no answer to critique"));
    }

    #[test]
    fn test_answer_critique_sets_refinement_flag() {
        let mut state = RunState::new("self-rag", "q", 3).replacing_per_cycle(true);
        state
            .merge(Step::Generate, StageOutput::Answer(Answer::new("draft", 0.4)), &policy())
            .unwrap();
        state
            .merge(
                Step::CritiqueAnswer,
                StageOutput::AnswerCritique(Critique::refine("c1", "too vague")),
                &policy(),
            )
            .unwrap();

        let answer = state.answer.as_ref().unwrap();
        assert!(answer.needs_refinement);
        assert_eq!(answer.critique.as_deref(), Some("too vague"));
        assert!(state.signals().needs_refinement);
        assert_eq!(state.refinement_critique(), "too vague");
    }

    #[test]
    fn test_refinement_critique_fallback() {
        let state = RunState::new("self-rag", "q", 3);
        assert_eq!(state.refinement_critique(), DEFAULT_REFINEMENT_CRITIQUE);
    }

    #[test]
    fn test_citations_limited_to_run_documents() {
        let mut state = RunState::new("agentic-rag", "q", 0);
        state
            .merge(Step::Retrieve, StageOutput::Documents(vec![Document::new("a", "x", "kb")]), &policy())
            .unwrap();
        state
            .merge(
                Step::Generate,
                StageOutput::Answer(Answer::new("text", 0.8).with_citations(["a", "zzz"])),
                &policy(),
            )
            .unwrap();
        let citations: Vec<&String> = state.answer.as_ref().unwrap().citations.iter().collect();
        assert_eq!(citations, vec!["a"]);
    }

    #[test]
    fn test_refinement_past_bound_is_error() {
        let mut state = RunState::new("self-rag", "q", 1);
        state
            .merge(Step::Refine, StageOutput::Refined("q2".into()), &policy())
            .unwrap();
        assert!(state
            .merge(Step::Refine, StageOutput::Refined("q3".into()), &policy())
            .is_err());
        assert_eq!(state.query_context.current, "q2");
        assert_eq!(state.query_context.refinement_count, 1);
    }

    #[test]
    fn test_routing_and_solution() {
        let mut state = RunState::new("support", "my laptop is slow", 0);
        state
            .merge(
                Step::Route,
                StageOutput::Routed(
                    RoutingDecision::new("technical_support", 0.85).with_priority(Priority::High),
                ),
                &policy(),
            )
            .unwrap();
        assert!(!state.signals().needs_clarification);

        state
            .merge(
                Step::Solve,
                StageOutput::Solved {
                    solution: Solution {
                        content: "Restart it".into(),
                        confidence: 0.9,
                        next_steps: vec!["Restart".into()],
                    },
                    followup: FollowupResult {
                        content: "Anything else?".into(),
                        suggested_actions: vec!["Check updates".into()],
                    },
                },
                &policy(),
            )
            .unwrap();

        let answer = state.answer.as_ref().unwrap();
        assert_eq!(answer.text, "Restart it");
        assert_eq!(answer.improvements, vec!["Restart".to_string()]);
        assert_eq!(state.suggested_actions, vec!["Check updates".to_string()]);
        assert_eq!(state.priority, Some(Priority::High));
    }

    #[test]
    fn test_complete_requires_answer() {
        let mut state = RunState::new("agentic-rag", "q", 0);
        assert!(state.complete().is_err());
        assert_eq!(state.status, Status::Idle);

        state.answer = Some(Answer::new("done", 1.0));
        state.complete().unwrap();
        assert!(state.is_terminal());
        assert!(state.finished_at.is_some());
        assert_eq!(state.into_result().unwrap().text, "done");
    }

    #[test]
    fn test_fail_keeps_artifacts() {
        let mut state = RunState::new("agentic-rag", "q", 0);
        state
            .merge(Step::Retrieve, StageOutput::Documents(vec![Document::new("a", "x", "kb")]), &policy())
            .unwrap();
        state.answer = Some(Answer::new("draft", 0.4));
        state.fail(&FlowError::stage_failure("critique_answer", FlowError::Stage("boom".into())));

        assert_eq!(state.status, Status::Error);
        assert_eq!(state.error_kind, Some(ErrorKind::StageFailure));
        assert_eq!(state.documents.len(), 1);
        assert!(state.answer.is_none());
        assert!(state.into_result().is_err());
    }

    #[test]
    fn test_loop_bound_reached() {
        let mut state = RunState::new("self-rag", "q", 1);
        state.answer = Some(Answer::new("a", 0.2));
        state.answer.as_mut().unwrap().needs_refinement = true;
        assert!(!state.loop_bound_reached());
        state.query_context.apply_refinement("q2");
        assert!(state.loop_bound_reached());
    }

    #[test]
    fn test_zero_bound_is_reached_by_first_vague_answer() {
        let mut state = RunState::new("self-rag", "q", 0);
        state.answer = Some(Answer::new("a", 0.9));
        assert!(!state.loop_bound_reached());
        state.answer.as_mut().unwrap().needs_refinement = true;
        assert!(state.loop_bound_reached());
    }

    #[test]
    fn test_snapshot_serializes() {
        let state = RunState::new("crag", "q", 0);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["workflow"], "crag");
        assert!(json.get("replace_per_cycle").is_none());
    }
}
