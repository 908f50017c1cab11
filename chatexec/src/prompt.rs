//! Prompt assembly: the system briefing, the structured instruction
//! payloads, and the execution feedback object.
//!
//! Everything the model sees is built here so the wire contract lives in
//! one place. Instruction payloads are serde structs (stable field order),
//! the briefing is a minijinja template fed from the static capability
//! registry.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::ExecutionResult;
use crate::io::config::Config;
use crate::runtime::capabilities::{CAPABILITIES, RUNTIME_GLOBAL};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// Render the system briefing: role text, format rules, the capability
/// surface and the operator's API catalog.
pub fn system_prompt(config: &Config) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("system", SYSTEM_TEMPLATE)
        .context("system template should be valid")?;
    let template = env.get_template("system").context("get system template")?;
    let rendered = template
        .render(context! {
            role => config.role.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            runtime_global => RUNTIME_GLOBAL,
            capabilities => CAPABILITIES,
            apis => config.api_briefing(),
        })
        .context("render system template")?;
    Ok(rendered)
}

/// First instruction of a task: the task text plus host facts.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPrompt {
    pub task: String,
    pub source: &'static str,
    pub context: TaskContext,
    pub constraints: TaskConstraints,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskContext {
    pub os_type: String,
    pub os_locale: String,
    pub os_platform: String,
    pub python_version: String,
    pub today: String,
    #[serde(rename = "TERM")]
    pub term: String,
    #[serde(rename = "LC_TERMINAL")]
    pub lc_terminal: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskConstraints {
    pub reply_language: &'static str,
    pub file_creation_path: &'static str,
}

impl TaskPrompt {
    pub fn new(instruction: &str, python_version: String) -> Self {
        Self {
            task: instruction.to_string(),
            source: "User",
            context: TaskContext {
                os_type: std::env::consts::OS.to_string(),
                os_locale: std::env::var("LC_ALL")
                    .or_else(|_| std::env::var("LANG"))
                    .unwrap_or_else(|_| "unknown".to_string()),
                os_platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
                python_version,
                today: chrono::Local::now().date_naive().to_string(),
                term: std::env::var("TERM").unwrap_or_else(|_| "unknown".to_string()),
                lc_terminal: std::env::var("LC_TERMINAL")
                    .unwrap_or_else(|_| "unknown".to_string()),
            },
            constraints: TaskConstraints {
                reply_language:
                    "Now, use the exact language of the `task` field for subsequent responses",
                file_creation_path: "current_directory",
            },
        }
    }
}

/// A follow-up instruction in an already-running task. References the
/// original instruction for continuity instead of repeating the briefing.
#[derive(Debug, Clone, Serialize)]
pub struct ChatPrompt {
    pub message: String,
    pub source: &'static str,
    pub context: ChatContext,
    pub constraints: ChatConstraints,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatContext {
    pub initial_task: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatConstraints {
    pub reply_language: &'static str,
}

impl ChatPrompt {
    pub fn new(message: &str, initial_task: &str) -> Self {
        Self {
            message: message.to_string(),
            source: "User",
            context: ChatContext {
                initial_task: initial_task.to_string(),
            },
            constraints: ChatConstraints {
                reply_language:
                    "Now, use the exact language of the `message` field for subsequent responses",
            },
        }
    }
}

/// Execution results fed back to the model after a round.
#[derive(Debug, Clone, Serialize)]
pub struct Feedback {
    pub message: &'static str,
    pub source: &'static str,
    pub results: Vec<FeedbackEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackEntry {
    #[serde(flatten)]
    pub result: ExecutionResult,
    pub block_name: String,
}

impl Feedback {
    pub fn new(results: Vec<FeedbackEntry>) -> Self {
        Self {
            message: "These are the execution results of the code block/s automatically \
                      returned in the order of execution by the runtime environment.",
            source: "Runtime Environment",
            results,
        }
    }
}
