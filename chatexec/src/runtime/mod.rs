//! Execution runtime: runs one block at a time against a persistent
//! namespace, isolating its observable I/O and converting failures into
//! result data.

pub mod capabilities;
pub mod evaluator;
pub mod install;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::core::blocks::CodeBlock;
use crate::core::redact::redact_value;
use crate::core::types::{ExecutionResult, RunRecord};
use crate::runtime::capabilities::HostBridge;
use crate::runtime::evaluator::PyEvaluator;
use crate::runtime::install::Installer;

/// A secret declared in the operator's API catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretEntry {
    pub value: String,
    pub desc: String,
}

/// State shared between the host and the capability object: the declared
/// secret catalog, remembered installs, the per-round result accumulator
/// and the cross-round session store.
#[derive(Debug, Default)]
pub struct RuntimeState {
    pub secrets: BTreeMap<String, SecretEntry>,
    pub packages: BTreeSet<String>,
    pub current_state: Map<String, Value>,
    pub session: Map<String, Value>,
}

impl RuntimeState {
    fn secret_names(&self) -> std::collections::HashSet<String> {
        self.secrets.keys().cloned().collect()
    }
}

/// Human-in-the-loop gate for capability requests. Implementations may
/// prompt the operator or auto-approve based on configuration.
pub trait ApprovalGate: Send + Sync {
    fn approve_install(&self, packages: &[String]) -> bool;
    fn approve_env(&self, name: &str, desc: Option<&str>) -> bool;
}

/// Gate that answers from fixed configuration flags.
pub struct AutoApprove {
    pub install: bool,
    pub env: bool,
}

impl ApprovalGate for AutoApprove {
    fn approve_install(&self, _packages: &[String]) -> bool {
        self.install
    }
    fn approve_env(&self, _name: &str, _desc: Option<&str>) -> bool {
        self.env
    }
}

/// Optional sink for materialized files (e.g. publishing an artifact).
pub trait UploadSink: Send + Sync {
    fn upload(&self, path: &Path) -> Result<()>;
}

/// Executes blocks and keeps the ordered run log for one task.
pub struct BlockRuntime {
    state: Arc<Mutex<RuntimeState>>,
    evaluator: PyEvaluator,
    upload: Option<Arc<dyn UploadSink>>,
    cwd: PathBuf,
    history: Vec<RunRecord>,
}

impl BlockRuntime {
    /// Build a runtime rooted at the task working directory.
    pub fn new(
        cwd: &Path,
        secrets: BTreeMap<String, SecretEntry>,
        gate: Arc<dyn ApprovalGate>,
        installer: Arc<dyn Installer>,
        upload: Option<Arc<dyn UploadSink>>,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(RuntimeState {
            secrets,
            ..RuntimeState::default()
        }));
        let host = HostBridge::new(state.clone(), gate, installer);
        let evaluator = PyEvaluator::new(host).context("create evaluator")?;
        Ok(Self {
            state,
            evaluator,
            upload,
            cwd: cwd.to_path_buf(),
            history: Vec::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one block and record the outcome in the run log.
    ///
    /// Python blocks execute in the persistent namespace. Non-Python blocks
    /// with a `path` are materialized under the working directory; without a
    /// path they are rejected as unsupported.
    #[instrument(skip_all, fields(block = %block.name, lang = %block.lang))]
    pub fn run(&mut self, block: &CodeBlock) -> ExecutionResult {
        info!("executing block");
        let result = if block.lang == "python" {
            self.run_python(block)
        } else if let Some(path) = block.path.clone() {
            self.materialize(block, &path)
        } else {
            ExecutionResult {
                stderr: Some(format!(
                    "unsupported block language for execution: {}",
                    block.lang
                )),
                ..ExecutionResult::default()
            }
        };
        self.history.push(RunRecord {
            block_name: block.name.clone(),
            result: result.clone(),
        });
        result
    }

    fn run_python(&mut self, block: &CodeBlock) -> ExecutionResult {
        // The per-round accumulator starts empty for every run; only the
        // namespace itself persists.
        self.state().current_state.clear();

        let mut result = self.evaluator.exec(&block.code);

        let state = self.state();
        if !state.current_state.is_empty() {
            let mut value = Value::Object(state.current_state.clone());
            redact_value(&mut value, &state.secret_names());
            result.result = Some(value);
        }
        result
    }

    fn materialize(&self, block: &CodeBlock, path: &str) -> ExecutionResult {
        let dest = self.cwd.join(path);
        let write = || -> Result<()> {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            fs::write(&dest, &block.code)
                .with_context(|| format!("write {}", dest.display()))?;
            if let Some(upload) = &self.upload {
                upload
                    .upload(&dest)
                    .with_context(|| format!("upload {}", dest.display()))?;
            }
            Ok(())
        };
        match write() {
            Ok(()) => {
                info!(path = %dest.display(), "materialized file block");
                ExecutionResult {
                    stdout: Some("OK".to_string()),
                    ..ExecutionResult::default()
                }
            }
            Err(err) => {
                warn!(err = %err, "file block failed");
                ExecutionResult {
                    errstr: Some(format!("{err:#}")),
                    ..ExecutionResult::default()
                }
            }
        }
    }

    /// Drop a name's entries from the run log after eviction.
    pub fn evict(&mut self, name: &str) {
        self.history.retain(|record| record.block_name != name);
    }

    pub fn history(&self) -> &[RunRecord] {
        &self.history
    }

    pub fn python_version(&self) -> String {
        self.evaluator.python_version()
    }

    /// Read a value from the cross-round session store.
    pub fn session_value(&self, key: &str) -> Option<Value> {
        self.state().session.get(key).cloned()
    }
}
