//! Workflow engine
//!
//! Drives one run through a [`WorkflowDefinition`]: before each step it checks
//! for cancellation, publishes the step's status, invokes the stage function
//! under the per-stage timeout, merges the output and asks the state machine
//! what comes next. Runs never share mutable state; the conversation history
//! is the only thing deliberately shared across support runs.

use agentflow_core::config::{FlowConfig, PolicySettings};
use agentflow_core::stage::GenerationRequest;
use agentflow_core::{
    FlowError, Message, MessageKind, MessageMetadata, Result, Solution, Status,
};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity_logger::ActivityLogger;
use crate::conversation::ConversationHistory;
use crate::run_state::{check_unit, RunState, StageOutput};
use crate::stages::StageSet;
use crate::state_machine::{self, Next};
use crate::workflow::{Step, WorkflowDefinition};

/// Engine knobs taken from [`FlowConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Applies to each stage invocation separately; `None` disables it
    pub stage_timeout: Option<Duration>,
    pub policy: PolicySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_flow_config(&FlowConfig::default())
    }
}

impl EngineConfig {
    pub fn from_flow_config(config: &FlowConfig) -> Self {
        Self {
            stage_timeout: config.stage_timeout(),
            policy: config.policy.clone(),
        }
    }

    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: PolicySettings) -> Self {
        self.policy = policy;
        self
    }
}

/// A status change of one run
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub run_id: Uuid,
    pub from: Status,
    pub to: Status,
    pub at: DateTime<Utc>,
}

/// Receives every status change, in order
///
/// Observers get a copy of the run state; nothing they do feeds back into
/// the run.
pub trait StatusObserver: Send + Sync {
    fn on_transition(&self, transition: &Transition, snapshot: &RunState);
}

/// Observer that reports transitions through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl StatusObserver for TracingObserver {
    fn on_transition(&self, transition: &Transition, snapshot: &RunState) {
        match transition.to {
            Status::Error => warn!(
                "Run {} failed after {}: {}",
                transition.run_id,
                transition.from,
                snapshot.error.as_deref().unwrap_or("unknown error")
            ),
            _ => info!(
                "Run {} [{}] {} -> {}",
                transition.run_id, snapshot.workflow, transition.from, transition.to
            ),
        }
    }
}

/// Cooperative cancellation, checked between stages
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle to a submitted run
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    updates: watch::Receiver<RunState>,
    cancel: CancelFlag,
    task: JoinHandle<RunState>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.run_id
    }

    /// Latest published state
    pub fn snapshot(&self) -> RunState {
        self.updates.borrow().clone()
    }

    pub fn status(&self) -> Status {
        self.updates.borrow().status
    }

    /// Receiver that sees every published snapshot from now on
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.updates.clone()
    }

    /// Stop the run before its next stage
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to reach a terminal status
    pub async fn wait(self) -> Result<RunState> {
        self.task
            .await
            .map_err(|e| FlowError::Other(format!("run {} task failed: {}", self.run_id, e)))
    }
}

/// Executes runs of a single workflow definition
#[derive(Clone)]
pub struct Orchestrator {
    definition: Arc<WorkflowDefinition>,
    stages: Arc<StageSet>,
    config: EngineConfig,
    conversation: ConversationHistory,
    observers: Vec<Arc<dyn StatusObserver>>,
    activity_logger: Option<ActivityLogger>,
}

impl Orchestrator {
    /// Validate the definition and stage coverage
    pub fn new(definition: WorkflowDefinition, stages: StageSet) -> Result<Self> {
        definition.validate()?;
        stages.check(&definition)?;

        Ok(Self {
            definition: Arc::new(definition),
            stages: Arc::new(stages),
            config: EngineConfig::default(),
            conversation: ConversationHistory::new(),
            observers: Vec::new(),
            activity_logger: None,
        })
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing conversation across orchestrators
    pub fn with_conversation(mut self, conversation: ConversationHistory) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Enable activity logging to `<flow_dir>/activity.md`
    pub fn with_activity_logging(mut self, flow_dir: PathBuf) -> Self {
        self.activity_logger = Some(ActivityLogger::new(flow_dir));
        self
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn conversation(&self) -> &ConversationHistory {
        &self.conversation
    }

    /// Start a run in the background
    pub fn submit(&self, query: &str) -> Result<RunHandle> {
        let state = self.new_run(query)?;
        let run_id = state.run_id;
        let (tx, rx) = watch::channel(state.clone());
        let cancel = CancelFlag::new();

        let engine = self.clone();
        let flag = cancel.clone();
        let task = tokio::spawn(async move { engine.drive(state, &flag, &tx).await });

        Ok(RunHandle {
            run_id,
            updates: rx,
            cancel,
            task,
        })
    }

    /// Run to completion on the current task
    pub async fn execute(&self, query: &str) -> Result<RunState> {
        self.execute_with(query, &CancelFlag::new()).await
    }

    /// Run to completion, stopping early if `cancel` is set
    pub async fn execute_with(&self, query: &str, cancel: &CancelFlag) -> Result<RunState> {
        let state = self.new_run(query)?;
        let (tx, _rx) = watch::channel(state.clone());
        Ok(self.drive(state, cancel, &tx).await)
    }

    fn new_run(&self, query: &str) -> Result<RunState> {
        let query = query.trim();
        if query.is_empty() {
            return Err(FlowError::InvalidInput("query must not be empty".to_string()));
        }
        if query.contains('\0') {
            return Err(FlowError::InvalidInput(
                "query must not contain NUL characters".to_string(),
            ));
        }

        Ok(RunState::new(
            self.definition.name.clone(),
            query,
            self.definition.max_refinements(),
        )
        .replacing_per_cycle(self.definition.has_loop()))
    }

    async fn drive(
        &self,
        mut state: RunState,
        cancel: &CancelFlag,
        updates: &watch::Sender<RunState>,
    ) -> RunState {
        info!(
            "Starting {} run {}: {}",
            self.definition.name, state.run_id, state.query_context.original
        );
        if let Some(logger) = &self.activity_logger {
            logger.log_run_start(&state).await;
        }
        if self.definition.uses_conversation() {
            self.conversation
                .append(Message::user(state.query_context.original.clone()))
                .await;
        }

        let outcome = self.run_steps(&mut state, cancel, updates).await;
        let from = state.status;

        match outcome.and_then(|()| state.complete()) {
            Ok(()) => {
                if state.loop_bound_reached() {
                    info!(
                        "Refinement bound of {} reached, keeping last answer",
                        state.query_context.max_refinements
                    );
                }
            }
            Err(e) => {
                debug!("Run {} ended with error: {}", state.run_id, e);
                if self.definition.uses_conversation() {
                    self.conversation
                        .append(Message::system(
                            e.to_string(),
                            MessageMetadata::of_kind(MessageKind::Error),
                        ))
                        .await;
                }
                state.fail(&e);
            }
        }
        self.publish(from, &state, updates);

        if let Some(logger) = &self.activity_logger {
            logger.log_run_complete(&state).await;
        }
        state
    }

    async fn run_steps(
        &self,
        state: &mut RunState,
        cancel: &CancelFlag,
        updates: &watch::Sender<RunState>,
    ) -> Result<()> {
        let mut next = state_machine::start(&self.definition);

        loop {
            let step = match next {
                Next::Run(step) => step,
                Next::Loop(step) => {
                    state.loop_iterations += 1;
                    debug!(
                        "Loop iteration {} of {}",
                        state.loop_iterations,
                        self.definition.max_refinements()
                    );
                    step
                }
                Next::Complete => return Ok(()),
                Next::Fail(reason) => return Err(FlowError::InvalidDefinition(reason)),
            };

            if cancel.is_cancelled() {
                return Err(FlowError::Cancelled(format!("before step '{}'", step)));
            }

            self.transition(state, step.status(), updates);
            let output = self.invoke(step, state).await?;
            let replies = self.replies(&output, state);
            state.merge(step, output, &self.config.policy)?;
            for message in replies {
                self.conversation.append(message).await;
            }
            updates.send_replace(state.clone());

            if let Some(logger) = &self.activity_logger {
                logger.log_stage_complete(step, state).await;
            }

            next = state_machine::advance(&self.definition, step, &state.signals());
        }
    }

    /// Enter a status, notify observers and publish the snapshot
    fn transition(&self, state: &mut RunState, to: Status, updates: &watch::Sender<RunState>) {
        let from = state.status;
        state.enter(to);
        self.publish(from, state, updates);
    }

    fn publish(&self, from: Status, state: &RunState, updates: &watch::Sender<RunState>) {
        let transition = Transition {
            run_id: state.run_id,
            from,
            to: state.status,
            at: Utc::now(),
        };
        for observer in &self.observers {
            observer.on_transition(&transition, state);
        }
        updates.send_replace(state.clone());
    }

    /// Run a stage future under the configured timeout
    async fn timed<T, F>(&self, step: Step, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = match self.config.stage_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(FlowError::StageTimeout {
                        stage: step.name().to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => fut.await,
        };
        result.map_err(|e| FlowError::stage_failure(step.name(), e))
    }

    async fn invoke(&self, step: Step, state: &RunState) -> Result<StageOutput> {
        let query = &state.query_context;
        let stages = &self.stages;

        match step {
            Step::GatherContext => {
                let gatherer = slot(&stages.gatherer, "context gatherer")?;
                let items = self.timed(step, gatherer.gather(&query.current)).await?;
                Ok(StageOutput::Contexts(items))
            }
            Step::ExpandQuery => {
                let expander = slot(&stages.expander, "query expander")?;
                let relevant: Vec<_> = state
                    .contexts
                    .iter()
                    .filter(|c| self.config.policy.is_expansion_context(c.relevance))
                    .cloned()
                    .collect();
                debug!(
                    "Expanding with {} of {} context item(s)",
                    relevant.len(),
                    state.contexts.len()
                );
                let expanded = self
                    .timed(step, expander.expand(&query.original, &relevant))
                    .await?;
                Ok(StageOutput::Expanded(expanded))
            }
            Step::Retrieve => {
                let retriever = slot(&stages.retriever, "retriever")?;
                let documents = self
                    .timed(step, retriever.retrieve(&query.current, &state.contexts))
                    .await?;
                Ok(StageOutput::Documents(documents))
            }
            Step::CritiqueDocuments => {
                if stages.critics.is_empty() {
                    return Err(FlowError::MissingStage("document critic".to_string()));
                }
                let current = query.current.as_str();
                let documents = state.documents.as_slice();

                let reviews = if self.definition.concurrent_critics {
                    let all = stages.critics.iter().map(|critic| async move {
                        let reviews = critic.review(current, documents).await?;
                        Ok::<_, FlowError>((critic.name().to_string(), reviews))
                    });
                    self.timed(step, try_join_all(all)).await?
                } else {
                    let mut collected = Vec::with_capacity(stages.critics.len());
                    for critic in &stages.critics {
                        let reviews = self.timed(step, critic.review(current, documents)).await?;
                        collected.push((critic.name().to_string(), reviews));
                    }
                    collected
                };
                Ok(StageOutput::Reviews(reviews))
            }
            Step::CritiqueAnswer => {
                let critic = slot(&stages.answer_critic, "answer critic")?;
                let answer = state.answer.as_ref().ok_or_else(|| {
                    FlowError::stage_failure(
                        step.name(),
                        FlowError::Stage("no answer to critique".to_string()),
                    )
                })?;
                let critique = self
                    .timed(step, critic.critique(&query.current, answer, &state.documents))
                    .await?;
                Ok(StageOutput::AnswerCritique(critique))
            }
            Step::Analyze => {
                debug!(
                    "Analyzing {} document(s) against {} context item(s)",
                    state.documents.len(),
                    state.contexts.len()
                );
                Ok(StageOutput::Analyzed)
            }
            Step::Generate => {
                let generator = slot(&stages.generator, "generator")?;
                let request = GenerationRequest::new(&query.current, &state.documents)
                    .with_critiques(&state.critiques)
                    .with_contexts(&state.contexts);
                let answer = self.timed(step, generator.generate(request)).await?;
                Ok(StageOutput::Answer(answer))
            }
            Step::Refine => {
                let refiner = slot(&stages.refiner, "refiner")?;
                let critique = state.refinement_critique();
                let refined = self
                    .timed(step, refiner.refine(&query.original, &critique))
                    .await?;
                Ok(StageOutput::Refined(refined))
            }
            Step::Route => {
                let router = slot(&stages.router, "router")?;
                let history = self.conversation.snapshot().await;
                let decision = self
                    .timed(step, router.route(&query.original, &history))
                    .await?;
                Ok(StageOutput::Routed(decision))
            }
            Step::Clarify => {
                let clarifier = slot(&stages.clarifier, "clarifier")?;
                let history = self.conversation.snapshot().await;
                let reply = self
                    .timed(
                        step,
                        clarifier.clarify(&query.original, &history, &state.required_info),
                    )
                    .await?;
                Ok(StageOutput::Clarified(reply))
            }
            Step::Solve => {
                let solver = slot(&stages.solver, "solver")?;
                let followup = slot(&stages.followup, "follow-up")?;
                let category = state.category.as_deref().unwrap_or("general");

                let mut history = self.conversation.snapshot().await;
                let solution = self
                    .timed(step, solver.solve(&query.original, &history, category))
                    .await?;
                check_unit(step, "solution confidence", Some(solution.confidence))?;

                history.push(solution_message(&solution, category));
                let next = self
                    .timed(step, followup.follow_up(&solution.content, &history))
                    .await?;

                Ok(StageOutput::Solved {
                    solution,
                    followup: next,
                })
            }
        }
    }

    /// Conversation messages a stage output adds once it has been merged
    fn replies(&self, output: &StageOutput, state: &RunState) -> Vec<Message> {
        match output {
            StageOutput::Clarified(reply) => {
                let metadata = MessageMetadata {
                    required_info: reply.missing_info.clone(),
                    category: state.category.clone(),
                    priority: state.priority,
                    ..MessageMetadata::of_kind(MessageKind::Clarification)
                };
                vec![Message::assistant(reply.content.clone(), metadata)]
            }
            StageOutput::Solved { solution, followup } => {
                let category = state.category.as_deref().unwrap_or("general");
                vec![
                    solution_message(solution, category),
                    Message::assistant(
                        followup.content.clone(),
                        MessageMetadata::of_kind(MessageKind::Followup),
                    ),
                ]
            }
            _ => Vec::new(),
        }
    }
}

fn solution_message(solution: &Solution, category: &str) -> Message {
    let metadata = MessageMetadata {
        confidence: Some(solution.confidence),
        category: Some(category.to_string()),
        next_steps: solution.next_steps.clone(),
        ..MessageMetadata::of_kind(MessageKind::Solution)
    };
    Message::assistant(solution.content.clone(), metadata)
}

fn slot<'a, T: ?Sized>(slot: &'a Option<Arc<T>>, name: &str) -> Result<&'a Arc<T>> {
    slot.as_ref()
        .ok_or_else(|| FlowError::MissingStage(name.to_string()))
}
