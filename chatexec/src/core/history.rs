//! Conversation log and post-task history repair.
//!
//! The log is append-only while the loop runs. After the loop, dead-end
//! attempts — assistant turns whose directive named a block that was later
//! evicted — are pruned together with their feedback turns so they do not
//! pollute future context.

use serde_json::Value;

use crate::core::blocks::BlockRegistry;
use crate::core::parser::directive_name;
use crate::core::types::{ChatMessage, ChatRole, TokenUsage};

/// Ordered conversation log plus accumulated token usage.
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
    usage: TokenUsage,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: ChatRole, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
    }

    pub fn record_usage(&mut self, usage: TokenUsage) {
        self.usage.absorb(usage);
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Remove dead-end turn pairs after the loop has finished.
    ///
    /// Scans backward (skipping the final exchange) for assistant turns
    /// whose `Cmd-Exec` directive names a block no longer present in the
    /// registry, and removes the assistant turn together with the user
    /// turn that followed it. The scan stops at the original task
    /// instruction or at a system turn. Two passes: turns are marked
    /// first and filtered afterwards, so removal never shifts indices
    /// under the scan.
    ///
    /// Returns the number of messages removed.
    pub fn prune_dead_turns(&mut self, registry: &BlockRegistry) -> usize {
        if self.messages.len() <= 3 {
            return 0;
        }

        let mut doomed = Vec::new();
        let mut index = self.messages.len() - 3;
        loop {
            let message = &self.messages[index];
            match message.role {
                ChatRole::Assistant => {
                    if let Some(name) = directive_name(&message.content) {
                        if !registry.contains(&name) {
                            doomed.push(index);
                            if index + 1 < self.messages.len() {
                                doomed.push(index + 1);
                            }
                        }
                    }
                }
                ChatRole::User => {
                    if is_task_instruction(&message.content) {
                        break;
                    }
                }
                ChatRole::System => break,
            }
            if index == 0 {
                break;
            }
            index -= 1;
        }

        if doomed.is_empty() {
            return 0;
        }
        let before = self.messages.len();
        let mut position = 0usize;
        self.messages.retain(|_| {
            let keep = !doomed.contains(&position);
            position += 1;
            keep
        });
        before - self.messages.len()
    }
}

/// Whether a user message is the original task instruction payload.
fn is_task_instruction(content: &str) -> bool {
    if !content.trim_start().starts_with("{\"task\"") {
        return false;
    }
    serde_json::from_str::<Value>(content).is_ok()
}
