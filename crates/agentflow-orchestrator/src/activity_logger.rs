//! Activity Logger - Human-readable run logging to `.agentflow/activity.md`
//!
//! One section per run: the query and workflow, each completed stage with a
//! short preview of what it produced, and a closing summary. Every write is
//! fail-open so a broken log never changes a run's outcome.

use agentflow_core::fail_open::fail_open;
use agentflow_core::{Result, Status};
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::run_state::RunState;
use crate::workflow::Step;

/// Maximum character length for answer previews in the activity log
const ACTIVITY_LOG_PREVIEW_CHARS: usize = 300;

/// Markdown activity log shared by every run of an orchestrator
#[derive(Debug, Clone)]
pub struct ActivityLogger {
    output_path: PathBuf,
}

impl ActivityLogger {
    /// Log into `activity.md` under the given directory
    pub fn new(flow_dir: PathBuf) -> Self {
        Self {
            output_path: flow_dir.join("activity.md"),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.output_path
    }

    pub async fn log_run_start(&self, state: &RunState) {
        fail_open("activity_logger::log_run_start", || async {
            if let Some(parent) = self.output_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let content = format!(
                "## Run {}\n**Workflow**: {}\n**Started**: {}\n**Query**: {}\n\n",
                short_id(state),
                state.workflow,
                Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
                first_line(&state.query_context.original),
            );
            self.append_internal(&content).await
        })
        .await;
    }

    pub async fn log_stage_complete(&self, step: Step, state: &RunState) {
        fail_open("activity_logger::log_stage_complete", || async {
            let detail = match step {
                Step::GatherContext => format!("{} context item(s)", state.contexts.len()),
                Step::ExpandQuery | Step::Refine => {
                    format!("query is now \"{}\"", first_line(&state.query_context.current))
                }
                Step::Retrieve => format!(
                    "{} document(s), cycle {}",
                    state.documents.len(),
                    state.cycles
                ),
                Step::CritiqueDocuments | Step::CritiqueAnswer => {
                    format!("{} critique(s)", state.critiques.len())
                }
                Step::Route => format!(
                    "category {}, {} item(s) required",
                    state.category.as_deref().unwrap_or("unknown"),
                    state.required_info.len()
                ),
                Step::Analyze | Step::Generate | Step::Clarify | Step::Solve => state
                    .answer
                    .as_ref()
                    .map(|a| format!("confidence {:.2}", a.confidence))
                    .unwrap_or_else(|| "no answer".to_string()),
            };

            let content = format!("- `{}` ({}): {}\n", step, step.status(), detail);
            self.append_internal(&content).await
        })
        .await;
    }

    pub async fn log_run_complete(&self, state: &RunState) {
        fail_open("activity_logger::log_run_complete", || async {
            let mut content = String::new();
            let (icon, outcome) = match state.status {
                Status::Complete => ("✓", "complete".to_string()),
                _ => (
                    "✗",
                    state
                        .error
                        .clone()
                        .unwrap_or_else(|| state.status.to_string()),
                ),
            };
            content.push_str(&format!("\n**Outcome**: {} {}\n", icon, outcome));
            content.push_str(&format!(
                "**Refinements**: {}/{}\n",
                state.query_context.refinement_count, state.query_context.max_refinements
            ));

            if let Some(answer) = &state.answer {
                content.push_str("**Answer**:\n> ");
                content.push_str(&preview(&answer.text).replace('\n', "\n> "));
                content.push('\n');
            }

            content.push_str("\n---\n\n");
            self.append_internal(&content).await
        })
        .await;
    }

    /// Append content to the activity log (internal, returns Result for fail_open)
    async fn append_internal(&self, content: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .await?;

        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn short_id(state: &RunState) -> String {
    state.run_id.simple().to_string()[..8].to_string()
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

fn preview(text: &str) -> String {
    if text.chars().count() > ACTIVITY_LOG_PREVIEW_CHARS {
        let truncated: String = text.chars().take(ACTIVITY_LOG_PREVIEW_CHARS).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}
