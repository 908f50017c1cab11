//! Transcript snapshots and final working-directory naming.
//!
//! A snapshot (`task.json`) is the durable record of one task: the
//! instruction, the conversation, the run log and every declared block.
//! It is written best-effort after each round and once more when the loop
//! ends, and can be replayed later with `chatexec replay`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::blocks::CodeBlock;
use crate::core::types::{ChatMessage, RunRecord};

/// Serialized record of one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub instruction: String,
    pub chats: Vec<ChatMessage>,
    pub runner: Vec<RunRecord>,
    pub blocks: Vec<CodeBlock>,
}

/// Write a snapshot as pretty-printed JSON with a trailing newline.
pub fn write_snapshot(path: &Path, snapshot: &TaskSnapshot) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
    payload.push('\n');
    fs::write(path, payload).with_context(|| format!("write {}", path.display()))
}

pub fn load_snapshot(path: &Path) -> Result<TaskSnapshot> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Derive a filesystem-safe directory name from an instruction.
///
/// Keeps alphanumerics, dashes and underscores; whitespace collapses to a
/// single underscore; everything else is dropped. Bounded to 32 characters.
/// Returns `None` when nothing safe remains.
pub fn safe_dir_name(instruction: &str) -> Option<String> {
    let mut name = String::new();
    let mut last_was_separator = true;
    for ch in instruction.chars() {
        if name.len() >= 32 {
            break;
        }
        if ch.is_alphanumeric() || ch == '-' || ch == '_' {
            name.push(ch);
            last_was_separator = false;
        } else if ch.is_whitespace() && !last_was_separator {
            name.push('_');
            last_was_separator = true;
        }
    }
    let name = name.trim_matches('_').to_string();
    if name.is_empty() { None } else { Some(name) }
}

/// Rename a finished task directory to a name derived from the
/// instruction. Falls back to the original path when no safe name can be
/// derived, the target already exists, or the rename fails.
pub fn finalize_workdir(cwd: &Path, instruction: &str) -> PathBuf {
    let Some(name) = safe_dir_name(instruction) else {
        return cwd.to_path_buf();
    };
    let Some(parent) = cwd.parent() else {
        return cwd.to_path_buf();
    };
    let target = parent.join(name);
    if target == cwd {
        return cwd.to_path_buf();
    }
    if target.exists() {
        warn!(target = %target.display(), "target name already taken, keeping task id");
        return cwd.to_path_buf();
    }
    match fs::rename(cwd, &target) {
        Ok(()) => {
            info!(target = %target.display(), "renamed task directory");
            target
        }
        Err(err) => {
            warn!(err = %err, "failed to rename task directory");
            cwd.to_path_buf()
        }
    }
}
