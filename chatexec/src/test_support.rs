//! Test-only helpers: scripted collaborators and reply builders.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::types::{Completion, TokenUsage};
use crate::io::client::ChatClient;
use crate::io::config::Config;
use crate::runtime::install::Installer;
use crate::runtime::{ApprovalGate, UploadSink};
use crate::task::{TaskDeps, ToolDispatcher};

/// Chat client that returns predetermined replies in order and fails when
/// the script runs out.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
        }
    }
}

impl ChatClient for ScriptedClient {
    fn complete(&self, _messages: &[crate::core::types::ChatMessage]) -> Result<Completion> {
        let reply = self
            .replies
            .lock()
            .expect("scripted replies")
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted reply left"))?;
        Ok(Completion {
            content: reply,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            },
        })
    }
}

/// Chat client that always fails, for exercising the external-error path.
pub struct FailingClient;

impl ChatClient for FailingClient {
    fn complete(&self, _messages: &[crate::core::types::ChatMessage]) -> Result<Completion> {
        Err(anyhow!("provider unreachable"))
    }
}

/// Gate that approves every request.
pub struct ApproveAll;

impl ApprovalGate for ApproveAll {
    fn approve_install(&self, _packages: &[String]) -> bool {
        true
    }
    fn approve_env(&self, _name: &str, _desc: Option<&str>) -> bool {
        true
    }
}

/// Gate that denies every request.
pub struct DenyAll;

impl ApprovalGate for DenyAll {
    fn approve_install(&self, _packages: &[String]) -> bool {
        false
    }
    fn approve_env(&self, _name: &str, _desc: Option<&str>) -> bool {
        false
    }
}

/// Installer that records calls instead of spawning processes.
pub struct ScriptedInstaller {
    ok: bool,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedInstaller {
    pub fn succeeding() -> Self {
        Self {
            ok: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            ok: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("installer calls").clone()
    }
}

impl Installer for ScriptedInstaller {
    fn install(&self, packages: &[String]) -> Result<bool> {
        self.calls
            .lock()
            .expect("installer calls")
            .push(packages.to_vec());
        Ok(self.ok)
    }
}

/// Tool dispatcher that records calls and answers with a fixed value.
pub struct ScriptedTool {
    response: Value,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTool {
    pub fn new(response: Value) -> Self {
        Self {
            response,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("tool calls").clone()
    }
}

impl ToolDispatcher for ScriptedTool {
    fn call(&self, name: &str, arguments: &Value) -> Result<Value> {
        self.calls
            .lock()
            .expect("tool calls")
            .push((name.to_string(), arguments.clone()));
        Ok(self.response.clone())
    }
}

/// Upload sink that records uploaded paths.
#[derive(Default)]
pub struct RecordingSink {
    paths: Mutex<Vec<std::path::PathBuf>>,
}

impl RecordingSink {
    pub fn paths(&self) -> Vec<std::path::PathBuf> {
        self.paths.lock().expect("sink paths").clone()
    }
}

impl UploadSink for RecordingSink {
    fn upload(&self, path: &Path) -> Result<()> {
        self.paths.lock().expect("sink paths").push(path.to_path_buf());
        Ok(())
    }
}

/// Config rooted in a temp directory, with approvals auto-granted.
pub fn test_config(workdir: &Path) -> Config {
    Config {
        workdir: Some(workdir.display().to_string()),
        auto_install: true,
        auto_approve_env: true,
        ..Config::default()
    }
}

/// Production-shaped deps with scripted leaf collaborators.
pub fn test_deps() -> TaskDeps {
    TaskDeps {
        gate: Arc::new(ApproveAll),
        installer: Arc::new(ScriptedInstaller::succeeding()),
        tools: Arc::new(crate::task::NoTools),
        upload: None,
    }
}

/// Render a block declaration in the wire markup.
pub fn declaration(name: &str, version: u32, code: &str) -> String {
    format!(
        "<!-- Block-Start: {{\"name\": \"{name}\", \"version\": {version}}} -->\n```python\n{code}\n```\n<!-- Block-End: {{\"name\": \"{name}\"}} -->\n"
    )
}

/// Render an execute directive in the wire markup.
pub fn exec_marker(name: &str) -> String {
    format!("<!-- Cmd-Exec: {{\"name\": \"{name}\"}} -->\n")
}
