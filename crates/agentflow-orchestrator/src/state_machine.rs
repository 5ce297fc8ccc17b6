//! Pure control flow for workflow runs
//!
//! Given a definition, the step that just finished and the signals read from
//! its output, [`advance`] decides what runs next. No async, no I/O.
//!
//! - Predicates look only at stage output, never at wall-clock or stage internals
//! - The loop back-edge is refused once the loop bound is spent
//! - Unknown steps produce [`Next::Fail`] (never panic)

use crate::workflow::{Edge, Predicate, Step, Target, WorkflowDefinition};

/// Facts about the run that branch predicates may read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    /// The latest answer critique asked for refinement
    pub needs_refinement: bool,
    /// Refinement count is still below the bound
    pub can_refine: bool,
    /// Routing listed required information
    pub needs_clarification: bool,
    /// Times the loop back-edge has been taken
    pub loop_iterations: u32,
}

/// What the engine should do after a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    /// Run this step
    Run(Step),
    /// Take the loop back-edge and run the loop head
    Loop(Step),
    /// Finish successfully
    Complete,
    /// The definition cannot continue from here
    Fail(String),
}

/// First step of a run
pub fn start(definition: &WorkflowDefinition) -> Next {
    if definition.contains(definition.entry) {
        Next::Run(definition.entry)
    } else {
        Next::Fail(format!("entry step '{}' has no node", definition.entry))
    }
}

/// Decide the step after `current`
pub fn advance(definition: &WorkflowDefinition, current: Step, signals: &Signals) -> Next {
    let Some(edge) = definition.edge(current) else {
        return Next::Fail(format!(
            "step '{}' is not part of workflow '{}'",
            current, definition.name
        ));
    };

    let target = match *edge {
        Edge::Goto(target) => target,
        Edge::Branch {
            when,
            then,
            otherwise,
        } => {
            if holds(when, signals) {
                then
            } else {
                otherwise
            }
        }
    };

    match target {
        Target::Complete => Next::Complete,
        Target::Step(next) => match definition.loop_bound {
            Some(bound) if bound.from == current && bound.to == next => {
                if signals.loop_iterations < bound.max_iterations {
                    Next::Loop(next)
                } else {
                    // Bound spent: finish with what the last cycle produced
                    Next::Complete
                }
            }
            _ => Next::Run(next),
        },
    }
}

/// Evaluate a branch predicate
pub fn holds(predicate: Predicate, signals: &Signals) -> bool {
    match predicate {
        Predicate::NeedsRefinement => signals.needs_refinement && signals.can_refine,
        Predicate::NeedsClarification => signals.needs_clarification,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{agentic_rag, corrective_rag, customer_support, self_rag};

    fn refine_signals(loop_iterations: u32, can_refine: bool) -> Signals {
        Signals {
            needs_refinement: true,
            can_refine,
            loop_iterations,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_enters_entry_step() {
        assert_eq!(start(&agentic_rag()), Next::Run(Step::Retrieve));
        assert_eq!(start(&corrective_rag()), Next::Run(Step::GatherContext));
        assert_eq!(start(&customer_support()), Next::Run(Step::Route));
    }

    #[test]
    fn test_agentic_rag_is_linear() {
        let def = agentic_rag();
        let signals = Signals::default();
        assert_eq!(
            advance(&def, Step::Retrieve, &signals),
            Next::Run(Step::CritiqueDocuments)
        );
        assert_eq!(
            advance(&def, Step::CritiqueDocuments, &signals),
            Next::Run(Step::Generate)
        );
        assert_eq!(advance(&def, Step::Generate, &signals), Next::Complete);
    }

    #[test]
    fn test_corrective_rag_sequence() {
        let def = corrective_rag();
        let signals = Signals::default();
        let mut step = def.entry;
        let mut seen = vec![step];
        while let Next::Run(next) = advance(&def, step, &signals) {
            seen.push(next);
            step = next;
        }
        assert_eq!(
            seen,
            vec![
                Step::GatherContext,
                Step::ExpandQuery,
                Step::Retrieve,
                Step::Analyze,
                Step::Generate
            ]
        );
        assert_eq!(advance(&def, Step::Generate, &signals), Next::Complete);
    }

    #[test]
    fn test_self_rag_accepts_answer() {
        let def = self_rag(3);
        let signals = Signals {
            can_refine: true,
            ..Default::default()
        };
        assert_eq!(advance(&def, Step::CritiqueAnswer, &signals), Next::Complete);
    }

    #[test]
    fn test_self_rag_refines_when_asked() {
        let def = self_rag(3);
        assert_eq!(
            advance(&def, Step::CritiqueAnswer, &refine_signals(0, true)),
            Next::Run(Step::Refine)
        );
        assert_eq!(
            advance(&def, Step::Refine, &refine_signals(0, true)),
            Next::Loop(Step::Retrieve)
        );
    }

    #[test]
    fn test_refinement_stops_at_bound() {
        let def = self_rag(3);
        // Critique still unhappy but the refinement count reached the bound
        assert_eq!(
            advance(&def, Step::CritiqueAnswer, &refine_signals(3, false)),
            Next::Complete
        );
    }

    #[test]
    fn test_back_edge_refused_once_spent() {
        let def = self_rag(2);
        assert_eq!(
            advance(&def, Step::Refine, &refine_signals(1, true)),
            Next::Loop(Step::Retrieve)
        );
        assert_eq!(
            advance(&def, Step::Refine, &refine_signals(2, true)),
            Next::Complete
        );
    }

    #[test]
    fn test_zero_bound_never_refines() {
        let def = self_rag(0);
        assert_eq!(
            advance(&def, Step::CritiqueAnswer, &refine_signals(0, false)),
            Next::Complete
        );
    }

    #[test]
    fn test_support_branches_on_required_info() {
        let def = customer_support();
        let clarify = Signals {
            needs_clarification: true,
            ..Default::default()
        };
        assert_eq!(advance(&def, Step::Route, &clarify), Next::Run(Step::Clarify));
        assert_eq!(
            advance(&def, Step::Route, &Signals::default()),
            Next::Run(Step::Solve)
        );
        assert_eq!(advance(&def, Step::Clarify, &clarify), Next::Complete);
        assert_eq!(advance(&def, Step::Solve, &Signals::default()), Next::Complete);
    }

    #[test]
    fn test_unknown_step_fails() {
        let def = agentic_rag();
        match advance(&def, Step::Route, &Signals::default()) {
            Next::Fail(msg) => assert!(msg.contains("not part of workflow 'agentic-rag'")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_same_signals_same_decision() {
        let def = self_rag(3);
        let signals = refine_signals(1, true);
        let first = advance(&def, Step::CritiqueAnswer, &signals);
        for _ in 0..10 {
            assert_eq!(advance(&def, Step::CritiqueAnswer, &signals), first);
        }
    }

    #[test]
    fn test_predicates() {
        assert!(!holds(Predicate::NeedsRefinement, &refine_signals(0, false)));
        assert!(holds(Predicate::NeedsRefinement, &refine_signals(0, true)));
        assert!(!holds(Predicate::NeedsClarification, &Signals::default()));
    }
}
