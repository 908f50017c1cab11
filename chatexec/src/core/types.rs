//! Shared deterministic types for the conversation/execution core.
//!
//! These types define stable contracts between the parser, the runtime and
//! the task loop. They must not depend on I/O and must serialize identically
//! across runs: empty fields are omitted, never emitted as null.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message in the conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Token accounting reported by the chat provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Fold another usage report into this one.
    pub fn absorb(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A completed chat round-trip: the assistant text plus its token cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
}

/// Observable effects of running one code block.
///
/// Fields are omitted from serialized output when empty; the model-facing
/// feedback contract treats a missing key as "nothing was produced".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errstr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ExecutionResult {
    /// Whether this run counts as failed for block-eviction purposes.
    ///
    /// Any stderr output is treated as failure, not only raised errors.
    /// This is deliberate and matches the model-facing contract: a block
    /// that wrote to stderr is not a valid target for re-execution.
    pub fn is_failure(&self) -> bool {
        self.stderr.is_some() || self.errstr.is_some()
    }
}

/// One entry in the runtime's ordered run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub block_name: String,
    pub result: ExecutionResult,
}
