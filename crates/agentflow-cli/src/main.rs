//! agentflow CLI - run agentic question-answering workflows
//!
//! Usage:
//!   agentflow init                      Write .agentflow/config.toml
//!   agentflow workflows                 List built-in workflows
//!   agentflow run <workflow> <query>    Run one query through a workflow
//!   agentflow chat                      Interactive customer-support session

use agentflow_core::config::{FlowConfig, CONFIG_DIR};
use agentflow_core::Status;
use agentflow_orchestrator::{
    EngineConfig, Orchestrator, RunState, StageSet, TracingObserver, WorkflowKind,
};
use agentflow_stages::{
    ExtractiveGenerator, KeywordRouter, KnowledgeBase, LlmAnswerCritic, LlmClient, LlmGenerator,
    LlmRefiner, LlmRouter, LlmSolver, RelevanceCritic, StaticContexts, SuffixRefiner,
    TemplateClarifier, TemplateFollowup, TemplateSolver, TermExpander, ThresholdCritic,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "agentflow")]
#[command(author, version, about = "Agentic question-answering workflows")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Working root containing .agentflow/
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .agentflow/config.toml
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// List built-in workflows and their stage graphs
    Workflows,

    /// Run one query through a workflow
    Run {
        /// agentic-rag, crag, self-rag or support
        workflow: WorkflowKind,

        /// The query (remaining words are joined)
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,

        #[command(flatten)]
        options: StageOptions,

        /// Print the final run state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Chat with the customer-support workflow over stdin
    Chat {
        #[command(flatten)]
        options: StageOptions,
    },
}

/// Flags shared by commands that execute runs
#[derive(clap::Args)]
struct StageOptions {
    /// Override the refinement bound
    #[arg(long)]
    max_refinements: Option<u32>,

    /// Override the per-stage timeout (0 disables it)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Use Anthropic-backed stages where available
    #[arg(long)]
    llm: bool,

    /// Knowledge base JSON file (array of {id, content, source})
    #[arg(long, value_name = "FILE")]
    kb: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.root, force),
        Commands::Workflows => cmd_workflows(&cli.root),
        Commands::Run {
            workflow,
            query,
            options,
            json,
        } => cmd_run(&cli.root, workflow, &query.join(" "), &options, json).await,
        Commands::Chat { options } => cmd_chat(&cli.root, &options).await,
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let config_path = root.join(CONFIG_DIR).join("config.toml");
    if config_path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", config_path.display());
        return Ok(());
    }

    FlowConfig::write_default(root).context("Failed to write default config")?;
    info!("Initialized agentflow in {}", root.display());

    println!("Created {}", config_path.display());
    println!("\nNext steps:");
    println!("  1. Adjust thresholds and the refinement bound in config.toml");
    println!("  2. Run 'agentflow workflows' to see what is available");
    println!("  3. Run 'agentflow run self-rag \"your question\"'");
    Ok(())
}

fn cmd_workflows(root: &Path) -> Result<()> {
    let config = load_config(root)?;

    println!("Built-in workflows");
    println!("==================");
    for kind in WorkflowKind::ALL {
        let definition = kind.definition(config.refinement.max_refinements);
        definition
            .validate()
            .with_context(|| format!("Built-in workflow {} is invalid", kind))?;
        println!("\n{} (starts at {})", kind, definition.entry);
        print!("{}", definition.describe());
    }
    Ok(())
}

async fn cmd_run(
    root: &Path,
    kind: WorkflowKind,
    query: &str,
    options: &StageOptions,
    json: bool,
) -> Result<()> {
    let config = effective_config(root, options)?;
    let orchestrator = build_orchestrator(root, kind, &config, options)?;

    let state = orchestrator
        .execute(query)
        .await
        .context("Run was rejected")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print_outcome(&state);
    }

    if state.status == Status::Error {
        bail!(
            "{} run failed: {}",
            kind,
            state.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_chat(root: &Path, options: &StageOptions) -> Result<()> {
    let config = effective_config(root, options)?;
    let orchestrator = build_orchestrator(root, WorkflowKind::CustomerSupport, &config, options)?;

    println!("Customer support chat. Type /reset to start over, /quit to leave.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                orchestrator.conversation().reset().await;
                println!("(conversation cleared)");
                continue;
            }
            message => match orchestrator.execute(message).await {
                Ok(state) => print_reply(&state),
                Err(e) => println!("! {}", e),
            },
        }
    }

    info!(
        "Chat ended after {} message(s)",
        orchestrator.conversation().len().await
    );
    Ok(())
}

fn load_config(root: &Path) -> Result<FlowConfig> {
    FlowConfig::load_or_default(root)
        .with_context(|| format!("Failed to load config from {}", root.join(CONFIG_DIR).display()))
}

/// Config file values with command-line overrides applied
fn effective_config(root: &Path, options: &StageOptions) -> Result<FlowConfig> {
    let mut config = load_config(root)?;
    if let Some(max) = options.max_refinements {
        config.refinement.max_refinements = max;
    }
    if let Some(secs) = options.timeout_secs {
        config.engine.stage_timeout_secs = Some(secs);
    }
    Ok(config)
}

fn build_orchestrator(
    root: &Path,
    kind: WorkflowKind,
    config: &FlowConfig,
    options: &StageOptions,
) -> Result<Orchestrator> {
    let stages = build_stages(config, options)?;
    let definition = kind.definition(config.refinement.max_refinements);

    let mut orchestrator = Orchestrator::new(definition, stages)
        .with_context(|| format!("Failed to set up {} workflow", kind))?
        .with_config(EngineConfig::from_flow_config(config))
        .with_observer(Arc::new(TracingObserver));
    if config.engine.activity_log {
        orchestrator = orchestrator.with_activity_logging(root.join(CONFIG_DIR));
    }
    Ok(orchestrator)
}

/// Register a stage for every step any built-in workflow can reach
fn build_stages(config: &FlowConfig, options: &StageOptions) -> Result<StageSet> {
    let knowledge = match &options.kb {
        Some(path) => KnowledgeBase::from_json_file(path)
            .with_context(|| format!("Failed to load knowledge base {}", path.display()))?,
        None => KnowledgeBase::sample(),
    };

    let stages = StageSet::new()
        .with_gatherer(StaticContexts::sample())
        .with_expander(TermExpander)
        .with_retriever(knowledge)
        .with_critic(RelevanceCritic)
        .with_clarifier(TemplateClarifier)
        .with_followup(TemplateFollowup);

    if !options.llm {
        return Ok(stages
            .with_generator(ExtractiveGenerator)
            .with_answer_critic(ThresholdCritic::default())
            .with_refiner(SuffixRefiner)
            .with_router(KeywordRouter)
            .with_solver(TemplateSolver));
    }

    let client = Arc::new(
        LlmClient::from_settings(&config.model).context("Failed to set up the model client")?,
    );
    info!("Using {} for generation, critique, routing and solving", client.model());
    Ok(stages
        .with_generator(LlmGenerator::new(client.clone()))
        .with_answer_critic(LlmAnswerCritic::new(client.clone()))
        .with_refiner(LlmRefiner::new(client.clone()))
        .with_router(LlmRouter::new(client.clone()))
        .with_solver(LlmSolver::new(client)))
}

fn print_outcome(state: &RunState) {
    println!("Run {} [{}]: {}", state.run_id, state.workflow, state.status);
    if let Some(expanded) = &state.query_context.expanded {
        println!("Expanded query: {}", expanded);
    }
    if state.query_context.refinement_count > 0 {
        println!(
            "Refined {} time(s): {}",
            state.query_context.refinement_count, state.query_context.current
        );
    }
    if state.loop_bound_reached() {
        println!("(refinement bound reached)");
    }

    if let Some(error) = &state.error {
        println!("\nError: {}", error);
        return;
    }

    if let Some(answer) = &state.answer {
        println!("\n{}", answer.text);
        println!("\nConfidence: {:.2}", answer.confidence);
        if !answer.citations.is_empty() {
            let cited: Vec<&str> = answer.citations.iter().map(String::as_str).collect();
            println!("Sources: {}", cited.join(", "));
        }
        for improvement in &answer.improvements {
            println!("  - {}", improvement);
        }
    }
    if !state.suggested_actions.is_empty() {
        println!("Suggested: {}", state.suggested_actions.join(" | "));
    }
}

fn print_reply(state: &RunState) {
    match (&state.answer, &state.error) {
        (_, Some(error)) => println!("! {}", error),
        (Some(answer), None) => {
            println!("{}", answer.text);
            for step in &answer.improvements {
                println!("  - {}", step);
            }
            if !state.suggested_actions.is_empty() {
                println!("({})", state.suggested_actions.join(" | "));
            }
        }
        (None, None) => println!("(no reply)"),
    }
}
