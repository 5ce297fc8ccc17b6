//! Declarative workflow definitions
//!
//! A definition is a small directed graph: one node per [`Step`], each with an
//! outgoing [`Edge`]. Edges either go straight to a target or branch on a
//! [`Predicate`] evaluated against the last stage's output. A definition may
//! contain at most one cycle, and that cycle must be declared with a
//! [`LoopBound`] so the engine can cap it.

use agentflow_core::{FlowError, Result, Status};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A unit of work the engine can schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    GatherContext,
    ExpandQuery,
    Retrieve,
    CritiqueDocuments,
    CritiqueAnswer,
    Analyze,
    Generate,
    Refine,
    Route,
    Clarify,
    /// Solution plus the follow-up sub-step
    Solve,
}

impl Step {
    /// Status published while this step runs
    pub fn status(&self) -> Status {
        match self {
            Self::GatherContext => Status::GatheringContext,
            Self::ExpandQuery => Status::ExpandingQuery,
            Self::Retrieve => Status::Retrieving,
            Self::CritiqueDocuments | Self::CritiqueAnswer => Status::Critiquing,
            Self::Analyze => Status::Analyzing,
            Self::Generate => Status::Generating,
            Self::Refine => Status::Refining,
            Self::Route => Status::Routing,
            Self::Clarify => Status::Clarifying,
            Self::Solve => Status::Solving,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GatherContext => "gather_context",
            Self::ExpandQuery => "expand_query",
            Self::Retrieve => "retrieve",
            Self::CritiqueDocuments => "critique_documents",
            Self::CritiqueAnswer => "critique_answer",
            Self::Analyze => "analyze",
            Self::Generate => "generate",
            Self::Refine => "refine",
            Self::Route => "route",
            Self::Clarify => "clarify",
            Self::Solve => "solve",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an edge leads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Step(Step),
    Complete,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step(step) => write!(f, "{}", step),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Branch conditions, evaluated purely from stage output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// The answer critique asked for refinement and the bound allows it
    NeedsRefinement,
    /// Routing returned required information items
    NeedsClarification,
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NeedsRefinement => write!(f, "needs refinement"),
            Self::NeedsClarification => write!(f, "needs clarification"),
        }
    }
}

/// Outgoing edge of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Goto(Target),
    Branch {
        when: Predicate,
        then: Target,
        otherwise: Target,
    },
}

impl Edge {
    pub fn to(step: Step) -> Self {
        Self::Goto(Target::Step(step))
    }

    pub fn complete() -> Self {
        Self::Goto(Target::Complete)
    }

    pub fn branch(when: Predicate, then: Target, otherwise: Target) -> Self {
        Self::Branch {
            when,
            then,
            otherwise,
        }
    }

    /// Every target this edge may lead to
    pub fn targets(&self) -> Vec<Target> {
        match self {
            Self::Goto(target) => vec![*target],
            Self::Branch {
                then, otherwise, ..
            } => vec![*then, *otherwise],
        }
    }
}

/// A step and what follows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub step: Step,
    pub edge: Edge,
}

/// The single permitted back-edge and its iteration cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopBound {
    /// Step whose edge closes the loop
    pub from: Step,
    /// Loop head the back-edge returns to
    pub to: Step,
    /// Maximum number of times the back-edge may be taken
    pub max_iterations: u32,
}

/// Built-in workflow variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    /// retrieve → critique documents → generate
    AgenticRag,
    /// gather context → expand → retrieve → analyze → generate
    CorrectiveRag,
    /// retrieve → generate → critique answer → (refine → retrieve)*
    SelfRag,
    /// route → clarify | solve
    CustomerSupport,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 4] = [
        WorkflowKind::AgenticRag,
        WorkflowKind::CorrectiveRag,
        WorkflowKind::SelfRag,
        WorkflowKind::CustomerSupport,
    ];

    /// Build the definition for this variant
    pub fn definition(&self, max_refinements: u32) -> WorkflowDefinition {
        match self {
            Self::AgenticRag => agentic_rag(),
            Self::CorrectiveRag => corrective_rag(),
            Self::SelfRag => self_rag(max_refinements),
            Self::CustomerSupport => customer_support(),
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AgenticRag => write!(f, "agentic-rag"),
            Self::CorrectiveRag => write!(f, "crag"),
            Self::SelfRag => write!(f, "self-rag"),
            Self::CustomerSupport => write!(f, "support"),
        }
    }
}

impl std::str::FromStr for WorkflowKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "agentic-rag" | "agentic" => Ok(Self::AgenticRag),
            "crag" | "corrective-rag" => Ok(Self::CorrectiveRag),
            "self-rag" | "selfrag" => Ok(Self::SelfRag),
            "support" | "customer-support" => Ok(Self::CustomerSupport),
            _ => Err(format!(
                "Invalid workflow: {}. Use agentic-rag, crag, self-rag, or support.",
                s
            )),
        }
    }
}

/// A named stage graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub entry: Step,
    pub nodes: Vec<Node>,
    pub loop_bound: Option<LoopBound>,
    /// Document critics may run concurrently; results merge in registration order
    #[serde(default)]
    pub concurrent_critics: bool,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, entry: Step) -> Self {
        Self {
            name: name.into(),
            entry,
            nodes: Vec::new(),
            loop_bound: None,
            concurrent_critics: false,
        }
    }

    pub fn node(mut self, step: Step, edge: Edge) -> Self {
        self.nodes.push(Node { step, edge });
        self
    }

    pub fn with_loop(mut self, from: Step, to: Step, max_iterations: u32) -> Self {
        self.loop_bound = Some(LoopBound {
            from,
            to,
            max_iterations,
        });
        self
    }

    pub fn with_concurrent_critics(mut self) -> Self {
        self.concurrent_critics = true;
        self
    }

    /// Outgoing edge of a step, if the step is part of this workflow
    pub fn edge(&self, step: Step) -> Option<&Edge> {
        self.nodes.iter().find(|n| n.step == step).map(|n| &n.edge)
    }

    /// Steps in declaration order
    pub fn steps(&self) -> impl Iterator<Item = Step> + '_ {
        self.nodes.iter().map(|n| n.step)
    }

    pub fn contains(&self, step: Step) -> bool {
        self.nodes.iter().any(|n| n.step == step)
    }

    /// Refinement budget exposed on the run's query context
    pub fn max_refinements(&self) -> u32 {
        self.loop_bound.map(|b| b.max_iterations).unwrap_or(0)
    }

    /// Whether artifacts are replaced per cycle instead of appended
    pub fn has_loop(&self) -> bool {
        self.loop_bound.is_some()
    }

    /// Whether runs read and write the conversation history
    pub fn uses_conversation(&self) -> bool {
        self.contains(Step::Route)
    }

    /// Check the graph is well formed
    ///
    /// - the entry and every edge target have a node, with no duplicates
    /// - every node is reachable from the entry and `Complete` is reachable
    /// - the only cycle is the declared loop, closed by its back-edge
    /// - `NeedsRefinement` is only used together with a loop bound
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| FlowError::InvalidDefinition(format!("{}: {}", self.name, msg));

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.step) {
                return Err(invalid(format!("step '{}' declared twice", node.step)));
            }
        }
        if !seen.contains(&self.entry) {
            return Err(invalid(format!("entry step '{}' has no node", self.entry)));
        }

        let edges: HashMap<Step, &Edge> = self.nodes.iter().map(|n| (n.step, &n.edge)).collect();
        for node in &self.nodes {
            for target in node.edge.targets() {
                if let Target::Step(next) = target {
                    if !edges.contains_key(&next) {
                        return Err(invalid(format!(
                            "edge {} -> {} targets an undeclared step",
                            node.step, next
                        )));
                    }
                }
            }
            if let Edge::Branch {
                when: Predicate::NeedsRefinement,
                ..
            } = node.edge
            {
                if self.loop_bound.is_none() {
                    return Err(invalid(
                        "refinement branch requires a loop bound".to_string(),
                    ));
                }
            }
        }

        // Depth-first walk collecting back-edges
        let mut back_edges = Vec::new();
        let mut visited = HashSet::new();
        let mut on_path = HashSet::new();
        let mut reaches_complete = false;
        walk(
            self.entry,
            &edges,
            &mut visited,
            &mut on_path,
            &mut back_edges,
            &mut reaches_complete,
        );

        if visited.len() != self.nodes.len() {
            let unreachable: Vec<String> = self
                .steps()
                .filter(|s| !visited.contains(s))
                .map(|s| s.to_string())
                .collect();
            return Err(invalid(format!("unreachable steps: {}", unreachable.join(", "))));
        }
        if !reaches_complete {
            return Err(invalid("no path reaches completion".to_string()));
        }

        match (self.loop_bound, back_edges.as_slice()) {
            (None, []) => Ok(()),
            (None, [(from, to), ..]) => Err(invalid(format!(
                "cycle {} -> {} has no loop bound",
                from, to
            ))),
            (Some(bound), edges_found) => {
                if edges_found.len() > 1 {
                    return Err(invalid("more than one loop".to_string()));
                }
                match edges_found.first() {
                    Some((from, to)) if *from == bound.from && *to == bound.to => Ok(()),
                    Some((from, to)) => Err(invalid(format!(
                        "cycle {} -> {} does not match declared loop {} -> {}",
                        from, to, bound.from, bound.to
                    ))),
                    None => Err(invalid(format!(
                        "declared loop {} -> {} has no back-edge",
                        bound.from, bound.to
                    ))),
                }
            }
        }
    }

    /// Render the graph as one line per node, for listings
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            let edge = match node.edge {
                Edge::Goto(target) => target.to_string(),
                Edge::Branch {
                    when,
                    then,
                    otherwise,
                } => format!("if {} then {} else {}", when, then, otherwise),
            };
            out.push_str(&format!("  {} [{}] -> {}\n", node.step, node.step.status(), edge));
        }
        if let Some(bound) = self.loop_bound {
            out.push_str(&format!(
                "  loop {} -> {} at most {} time(s)\n",
                bound.from, bound.to, bound.max_iterations
            ));
        }
        out
    }
}

fn walk(
    step: Step,
    edges: &HashMap<Step, &Edge>,
    visited: &mut HashSet<Step>,
    on_path: &mut HashSet<Step>,
    back_edges: &mut Vec<(Step, Step)>,
    reaches_complete: &mut bool,
) {
    visited.insert(step);
    on_path.insert(step);

    if let Some(edge) = edges.get(&step) {
        for target in edge.targets() {
            match target {
                Target::Complete => *reaches_complete = true,
                Target::Step(next) if on_path.contains(&next) => back_edges.push((step, next)),
                Target::Step(next) if !visited.contains(&next) => {
                    walk(next, edges, visited, on_path, back_edges, reaches_complete)
                }
                Target::Step(_) => {}
            }
        }
    }

    on_path.remove(&step);
}

/// Fixed three-stage pipeline
pub fn agentic_rag() -> WorkflowDefinition {
    WorkflowDefinition::new("agentic-rag", Step::Retrieve)
        .node(Step::Retrieve, Edge::to(Step::CritiqueDocuments))
        .node(Step::CritiqueDocuments, Edge::to(Step::Generate))
        .node(Step::Generate, Edge::complete())
        .with_concurrent_critics()
}

/// Context-augmented pipeline
pub fn corrective_rag() -> WorkflowDefinition {
    WorkflowDefinition::new("crag", Step::GatherContext)
        .node(Step::GatherContext, Edge::to(Step::ExpandQuery))
        .node(Step::ExpandQuery, Edge::to(Step::Retrieve))
        .node(Step::Retrieve, Edge::to(Step::Analyze))
        .node(Step::Analyze, Edge::to(Step::Generate))
        .node(Step::Generate, Edge::complete())
}

/// Bounded critique-refinement loop
pub fn self_rag(max_refinements: u32) -> WorkflowDefinition {
    WorkflowDefinition::new("self-rag", Step::Retrieve)
        .node(Step::Retrieve, Edge::to(Step::Generate))
        .node(Step::Generate, Edge::to(Step::CritiqueAnswer))
        .node(
            Step::CritiqueAnswer,
            Edge::branch(
                Predicate::NeedsRefinement,
                Target::Step(Step::Refine),
                Target::Complete,
            ),
        )
        .node(Step::Refine, Edge::to(Step::Retrieve))
        .with_loop(Step::Refine, Step::Retrieve, max_refinements)
}

/// Routing pipeline for support conversations
pub fn customer_support() -> WorkflowDefinition {
    WorkflowDefinition::new("support", Step::Route)
        .node(
            Step::Route,
            Edge::branch(
                Predicate::NeedsClarification,
                Target::Step(Step::Clarify),
                Target::Step(Step::Solve),
            ),
        )
        .node(Step::Clarify, Edge::complete())
        .node(Step::Solve, Edge::complete())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_definitions_validate() {
        for kind in WorkflowKind::ALL {
            let def = kind.definition(3);
            def.validate()
                .unwrap_or_else(|e| panic!("{} failed validation: {}", kind, e));
        }
    }

    #[test]
    fn test_self_rag_loop_bound() {
        let def = self_rag(5);
        assert_eq!(def.max_refinements(), 5);
        assert!(def.has_loop());
        assert!(!agentic_rag().has_loop());
        assert_eq!(agentic_rag().max_refinements(), 0);
    }

    #[test]
    fn test_unbounded_cycle_rejected() {
        let def = WorkflowDefinition::new("spin", Step::Retrieve)
            .node(Step::Retrieve, Edge::to(Step::Generate))
            .node(
                Step::Generate,
                Edge::branch(
                    Predicate::NeedsClarification,
                    Target::Step(Step::Retrieve),
                    Target::Complete,
                ),
            );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("has no loop bound"));
    }

    #[test]
    fn test_mismatched_loop_rejected() {
        let def = WorkflowDefinition::new("wrong-loop", Step::Retrieve)
            .node(Step::Retrieve, Edge::to(Step::Generate))
            .node(
                Step::Generate,
                Edge::branch(
                    Predicate::NeedsRefinement,
                    Target::Step(Step::Retrieve),
                    Target::Complete,
                ),
            )
            .with_loop(Step::Refine, Step::Retrieve, 2);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("does not match declared loop"));
    }

    #[test]
    fn test_declared_loop_without_cycle_rejected() {
        let def = agentic_rag().with_loop(Step::Generate, Step::Retrieve, 1);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_refinement_branch_requires_bound() {
        let def = WorkflowDefinition::new("no-bound", Step::Generate).node(
            Step::Generate,
            Edge::branch(Predicate::NeedsRefinement, Target::Complete, Target::Complete),
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("requires a loop bound"));
    }

    #[test]
    fn test_undeclared_target_rejected() {
        let def = WorkflowDefinition::new("dangling", Step::Retrieve)
            .node(Step::Retrieve, Edge::to(Step::Generate));
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_unreachable_step_rejected() {
        let def = agentic_rag().node(Step::Analyze, Edge::complete());
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("unreachable steps: analyze"));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let def = agentic_rag().node(Step::Generate, Edge::complete());
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_missing_completion_rejected() {
        let def = WorkflowDefinition::new("forever", Step::Retrieve)
            .node(Step::Retrieve, Edge::to(Step::Generate))
            .node(Step::Generate, Edge::to(Step::Retrieve))
            .with_loop(Step::Generate, Step::Retrieve, 3);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("no path reaches completion"));
    }

    #[test]
    fn test_step_statuses() {
        assert_eq!(Step::CritiqueDocuments.status(), Status::Critiquing);
        assert_eq!(Step::CritiqueAnswer.status(), Status::Critiquing);
        assert_eq!(Step::GatherContext.status(), Status::GatheringContext);
        assert_eq!(Step::Solve.status(), Status::Solving);
    }

    #[test]
    fn test_workflow_kind_parsing() {
        assert_eq!("self-rag".parse::<WorkflowKind>().unwrap(), WorkflowKind::SelfRag);
        assert_eq!("CRAG".parse::<WorkflowKind>().unwrap(), WorkflowKind::CorrectiveRag);
        assert_eq!(
            "customer_support".parse::<WorkflowKind>().unwrap(),
            WorkflowKind::CustomerSupport
        );
        assert!("autogen".parse::<WorkflowKind>().is_err());
        for kind in WorkflowKind::ALL {
            assert_eq!(kind.to_string().parse::<WorkflowKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_describe_mentions_loop() {
        let text = self_rag(3).describe();
        assert!(text.contains("critique_answer [critiquing] -> if needs refinement then refine else complete"));
        assert!(text.contains("loop refine -> retrieve at most 3 time(s)"));
    }

    #[test]
    fn test_support_uses_conversation() {
        assert!(customer_support().uses_conversation());
        assert!(!corrective_rag().uses_conversation());
    }
}
