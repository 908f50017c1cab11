//! The task loop: a bounded round-trip state machine tying parsing,
//! execution and feedback together.
//!
//! One task owns its registry, its evaluation namespace and its
//! conversation log. The loop blocks on the chat call, then on block
//! execution, with no overlap; a stop request is honored only at round
//! boundaries and never interrupts an in-flight execution.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tracing::{error, info, instrument, warn};

use crate::core::blocks::BlockRegistry;
use crate::core::history::ChatHistory;
use crate::core::parser::{ParseOutcome, parse_reply};
use crate::core::types::{ChatRole, ExecutionResult, RunRecord, TokenUsage};
use crate::io::client::ChatClient;
use crate::io::config::Config;
use crate::io::transcript::{TaskSnapshot, finalize_workdir, write_snapshot};
use crate::prompt::{ChatPrompt, Feedback, FeedbackEntry, TaskPrompt, system_prompt};
use crate::runtime::install::Installer;
use crate::runtime::{ApprovalGate, BlockRuntime, UploadSink};

/// External tool collaborator invoked for tool-call replies.
pub trait ToolDispatcher {
    fn call(&self, name: &str, arguments: &Value) -> Result<Value>;
}

/// Default dispatcher: every call is rejected.
pub struct NoTools;

impl ToolDispatcher for NoTools {
    fn call(&self, name: &str, _arguments: &Value) -> Result<Value> {
        Err(anyhow!("no tool named '{name}' is available"))
    }
}

/// Collaborators a task needs besides the chat client.
pub struct TaskDeps {
    pub gate: Arc<dyn ApprovalGate>,
    pub installer: Arc<dyn Installer>,
    pub tools: Arc<dyn ToolDispatcher>,
    pub upload: Option<Arc<dyn UploadSink>>,
}

/// Reason why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The reply carried no directive and no errors: nothing actionable.
    NothingToRun,
    /// The configured round bound was reached.
    MaxRounds { max_rounds: u32 },
    /// An external stop request was observed at a round boundary.
    Stopped,
    /// The chat client failed; there is no model to feed anything back to.
    ClientFailed,
}

/// Summary of one `run` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Last reply received from the model.
    pub reply: String,
    /// Rounds consumed (a parse-error feedback consumes a round too).
    pub rounds: u32,
    pub stop: LoopStop,
    pub usage: TokenUsage,
}

enum Dispatch {
    Reply(String),
    Nothing,
    ClientFailed,
}

/// One conversation-driven execution task.
pub struct Task<C: ChatClient> {
    id: String,
    cwd: PathBuf,
    config: Config,
    client: C,
    registry: BlockRegistry,
    runtime: BlockRuntime,
    tools: Arc<dyn ToolDispatcher>,
    history: ChatHistory,
    system_prompt: String,
    instruction: Option<String>,
    start: Option<Instant>,
    stop: Arc<AtomicBool>,
}

impl<C: ChatClient> Task<C> {
    pub fn new(config: Config, client: C, deps: TaskDeps) -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let parent = match &config.workdir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().context("resolve current directory")?,
        };
        let cwd = parent.join(&id);

        let runtime = BlockRuntime::new(
            &cwd,
            config.declared_secrets(),
            deps.gate,
            deps.installer,
            deps.upload,
        )
        .context("create block runtime")?;

        let mut system_prompt = system_prompt(&config)?;
        system_prompt.push_str(&format!(
            "\nThe task working directory is: {}\nUse absolute paths when writing files.\n",
            cwd.display()
        ));

        Ok(Self {
            id,
            cwd,
            config,
            client,
            registry: BlockRegistry::new(),
            runtime,
            tools: deps.tools,
            history: ChatHistory::new(),
            system_prompt,
            instruction: None,
            start: None,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub fn run_log(&self) -> &[RunRecord] {
        self.runtime.history()
    }

    /// Handle for requesting a cooperative stop. The flag is polled at
    /// round boundaries only.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Drive the loop for one instruction until nothing actionable
    /// remains, the round bound is hit, a stop is requested, or the chat
    /// client fails.
    ///
    /// The first instruction of a task carries the system briefing and a
    /// structured context object; follow-up instructions reference the
    /// original instruction instead.
    #[instrument(skip_all, fields(task = %self.id))]
    pub fn run(&mut self, instruction: &str) -> Result<TaskOutcome> {
        fs::create_dir_all(&self.cwd)
            .with_context(|| format!("create task directory {}", self.cwd.display()))?;

        let first = self.instruction.is_none();
        let payload = if first {
            self.start = Some(Instant::now());
            self.instruction = Some(instruction.to_string());
            let prompt = TaskPrompt::new(instruction, self.runtime.python_version());
            serde_json::to_string(&prompt).context("serialize task prompt")?
        } else {
            let initial = self.instruction.clone().unwrap_or_default();
            serde_json::to_string(&ChatPrompt::new(instruction, &initial))
                .context("serialize chat prompt")?
        };
        info!(first, "sending instruction");

        let system = first.then(|| self.system_prompt.clone());
        let Some(mut reply) = self.send(&payload, system) else {
            return Ok(TaskOutcome {
                reply: String::new(),
                rounds: 0,
                stop: LoopStop::ClientFailed,
                usage: self.history.usage(),
            });
        };

        let mut rounds: u32 = 1;
        let stop_reason = loop {
            if rounds > self.config.max_rounds {
                info!(rounds, max_rounds = self.config.max_rounds, "round bound reached");
                break LoopStop::MaxRounds {
                    max_rounds: self.config.max_rounds,
                };
            }
            match self.dispatch(&reply)? {
                Dispatch::Reply(next) => reply = next,
                Dispatch::Nothing => break LoopStop::NothingToRun,
                Dispatch::ClientFailed => break LoopStop::ClientFailed,
            }
            rounds += 1;
            self.snapshot_best_effort();
            if self.stop.load(Ordering::Relaxed) {
                info!("stop requested, ending loop at round boundary");
                break LoopStop::Stopped;
            }
        };

        let usage = self.history.usage();
        let elapsed = self.start.map(|s| s.elapsed()).unwrap_or_default();
        info!(
            rounds,
            elapsed_secs = elapsed.as_secs_f64(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            total_tokens = usage.total_tokens,
            "instruction finished"
        );

        let pruned = self.history.prune_dead_turns(&self.registry);
        if pruned > 0 {
            info!(pruned, "removed dead-end turns from the conversation");
        }
        self.write_snapshot()
            .context("write transcript snapshot")?;

        Ok(TaskOutcome {
            reply,
            rounds,
            stop: stop_reason,
            usage,
        })
    }

    /// Parse one reply and produce the next instruction, if any.
    fn dispatch(&mut self, reply: &str) -> Result<Dispatch> {
        match parse_reply(&mut self.registry, reply, self.config.tool_calls) {
            ParseOutcome::Errors(issues) => {
                warn!(count = issues.len(), "reply failed to parse");
                let report = serde_json::to_string_pretty(&json!({ "errors": issues }))
                    .context("serialize parse errors")?;
                Ok(self.send_next(&format!("# Message parse errors\n{report}")))
            }
            ParseOutcome::Exec(block) => {
                info!(block = %block.name, version = block.version, "executing directive");
                let result = self.runtime.run(&block);
                if result.is_failure() {
                    // Any stderr output evicts, not only raised errors; the
                    // name must be redeclared before it can run again.
                    info!(block = %block.name, "evicting failed block");
                    self.registry.evict(&block.name);
                    self.runtime.evict(&block.name);
                }
                let payload = self.feedback_payload(result, block.name)?;
                Ok(self.send_next(&payload))
            }
            ParseOutcome::ToolCall(call) => {
                info!(tool = %call.name, "invoking tool");
                let result = match self.tools.call(&call.name, &call.arguments) {
                    Ok(value) => ExecutionResult {
                        result: Some(value),
                        ..ExecutionResult::default()
                    },
                    Err(err) => ExecutionResult {
                        errstr: Some(format!("{err:#}")),
                        ..ExecutionResult::default()
                    },
                };
                let payload = self.feedback_payload(result, call.name)?;
                Ok(self.send_next(&payload))
            }
            ParseOutcome::Declarations { declared } => {
                info!(declared, "nothing to run");
                Ok(Dispatch::Nothing)
            }
        }
    }

    fn feedback_payload(&self, result: ExecutionResult, block_name: String) -> Result<String> {
        let feedback = Feedback::new(vec![FeedbackEntry { result, block_name }]);
        serde_json::to_string(&feedback).context("serialize feedback")
    }

    fn send_next(&mut self, payload: &str) -> Dispatch {
        match self.send(payload, None) {
            Some(reply) => Dispatch::Reply(reply),
            None => Dispatch::ClientFailed,
        }
    }

    /// Append the instruction to the log and fetch the next reply.
    /// A client failure is surfaced to the operator, not fed back.
    fn send(&mut self, content: &str, system: Option<String>) -> Option<String> {
        if let Some(system) = system {
            self.history.push(ChatRole::System, system);
        }
        self.history.push(ChatRole::User, content);
        match self.client.complete(self.history.messages()) {
            Ok(completion) => {
                self.history.record_usage(completion.usage);
                self.history
                    .push(ChatRole::Assistant, completion.content.clone());
                Some(completion.content)
            }
            Err(err) => {
                error!(err = %err, "chat client failed");
                None
            }
        }
    }

    fn snapshot_best_effort(&self) {
        if let Err(err) = self.write_snapshot() {
            warn!(err = %err, "transcript snapshot failed");
        }
    }

    fn write_snapshot(&self) -> Result<()> {
        let snapshot = TaskSnapshot {
            instruction: self.instruction.clone().unwrap_or_default(),
            chats: self.history.messages().to_vec(),
            runner: self.runtime.history().to_vec(),
            blocks: self.registry.to_list(),
        };
        write_snapshot(&self.cwd.join("task.json"), &snapshot)
    }

    /// Rename the working directory after the instruction and return the
    /// final path. Best-effort: the original path is kept on collision.
    pub fn finish(&mut self) -> PathBuf {
        let Some(instruction) = self.instruction.clone() else {
            return self.cwd.clone();
        };
        let renamed = finalize_workdir(&self.cwd, &instruction);
        self.cwd = renamed.clone();
        renamed
    }
}
