//! Embedded Python evaluator with a persistent namespace.
//!
//! One evaluator is created per task. The namespace (a globals dict) is
//! held explicitly by the host and reused for every block run, so names
//! defined by one block are visible to later blocks. Output streams are
//! redirected through a scoped capture object that is released on every
//! path, and any raised error — including `SystemExit` — is converted into
//! result data rather than propagating out of the runtime.
//!
//! Block execution is deliberately not bounded by a timeout: a runaway
//! block blocks the task. Known limitation.

use std::ffi::CString;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use pyo3::ffi::c_str;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use tracing::{debug, instrument, warn};

use crate::core::types::ExecutionResult;
use crate::runtime::capabilities::{HostBridge, RUNTIME_GLOBAL};

/// Imports pre-seeded into every fresh namespace.
const PRELUDE: &std::ffi::CStr = c_str!(
    "import os\nimport re\nimport sys\nimport json\nimport time\nimport random\nimport traceback\nimport warnings\nwarnings.filterwarnings(\"ignore\")\n"
);

/// Stream redirection swaps `sys.stdout`/`sys.stderr`, which are
/// process-global: block runs must never overlap, even across tasks
/// hosted in the same process.
static EXEC_GUARD: Mutex<()> = Mutex::new(());

/// Persistent evaluation namespace for one task.
pub struct PyEvaluator {
    globals: Py<PyDict>,
}

impl PyEvaluator {
    /// Create a namespace seeded with the import prelude and the host
    /// capability object.
    pub fn new(host: HostBridge) -> Result<Self> {
        Python::attach(|py| {
            let globals = PyDict::new(py);
            globals
                .set_item("__name__", "__main__")
                .context("seed __name__")?;
            globals
                .set_item(RUNTIME_GLOBAL, Py::new(py, host).context("wrap host object")?)
                .context("seed host object")?;
            py.run(PRELUDE, Some(&globals), None)
                .context("run import prelude")?;
            Ok(Self {
                globals: globals.unbind(),
            })
        })
    }

    /// Execute a block body against the persistent namespace.
    ///
    /// Never returns an error: failures become `errstr`/`traceback` in the
    /// result. Captured stdout/stderr are trimmed and omitted when empty.
    #[instrument(skip_all)]
    pub fn exec(&self, code: &str) -> ExecutionResult {
        let _serial = EXEC_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
        Python::attach(|py| {
            let mut result = ExecutionResult::default();
            let source = match CString::new(code) {
                Ok(source) => source,
                Err(_) => {
                    result.errstr = Some("code contains an interior NUL byte".to_string());
                    return result;
                }
            };
            let capture = match StreamCapture::install(py) {
                Ok(capture) => capture,
                Err(err) => {
                    result.errstr = Some(format!("failed to redirect output streams: {err}"));
                    return result;
                }
            };

            let globals = self.globals.bind(py);
            let run = py.run(source.as_c_str(), Some(globals), None);
            let (stdout, stderr) = capture.release();

            if let Err(err) = run {
                debug!("block raised");
                result.errstr = Some(err.value(py).to_string());
                result.traceback = Some(format_traceback(py, &err));
            }
            let stdout = stdout.trim();
            if !stdout.is_empty() {
                result.stdout = Some(stdout.to_string());
            }
            let stderr = stderr.trim();
            if !stderr.is_empty() {
                result.stderr = Some(stderr.to_string());
            }
            result
        })
    }

    /// Interpreter version, e.g. `3.12.4`.
    pub fn python_version(&self) -> String {
        Python::attach(|py| {
            py.version()
                .split_whitespace()
                .next()
                .unwrap_or("unknown")
                .to_string()
        })
    }
}

/// Scoped redirection of `sys.stdout`/`sys.stderr` into string buffers.
///
/// Installed before a block runs and released on every path afterwards;
/// the previous stream objects are always restored.
struct StreamCapture<'py> {
    sys: Bound<'py, PyModule>,
    saved_stdout: Bound<'py, PyAny>,
    saved_stderr: Bound<'py, PyAny>,
    stdout: Bound<'py, PyAny>,
    stderr: Bound<'py, PyAny>,
}

impl<'py> StreamCapture<'py> {
    fn install(py: Python<'py>) -> PyResult<Self> {
        let sys = py.import("sys")?;
        let io = py.import("io")?;
        let saved_stdout = sys.getattr("stdout")?;
        let saved_stderr = sys.getattr("stderr")?;
        let stdout = io.getattr("StringIO")?.call0()?;
        let stderr = io.getattr("StringIO")?.call0()?;
        sys.setattr("stdout", &stdout)?;
        sys.setattr("stderr", &stderr)?;
        Ok(Self {
            sys,
            saved_stdout,
            saved_stderr,
            stdout,
            stderr,
        })
    }

    /// Restore the original streams and return the captured text.
    fn release(self) -> (String, String) {
        let stdout = read_buffer(&self.stdout);
        let stderr = read_buffer(&self.stderr);
        if let Err(err) = self.sys.setattr("stdout", &self.saved_stdout) {
            warn!(err = %err, "failed to restore stdout");
        }
        if let Err(err) = self.sys.setattr("stderr", &self.saved_stderr) {
            warn!(err = %err, "failed to restore stderr");
        }
        (stdout, stderr)
    }
}

fn read_buffer(stream: &Bound<'_, PyAny>) -> String {
    stream
        .call_method0("getvalue")
        .and_then(|value| value.extract())
        .unwrap_or_default()
}

/// Full formatted traceback for a raised error, traceback module style.
fn format_traceback(py: Python<'_>, err: &PyErr) -> String {
    let render = || -> PyResult<String> {
        let traceback = py.import("traceback")?;
        let parts: Vec<String> = traceback
            .call_method1("format_exception", (err.value(py),))?
            .extract()?;
        Ok(parts.concat())
    };
    render().unwrap_or_else(|render_err| {
        warn!(err = %render_err, "failed to format traceback");
        err.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::install::Installer;
    use crate::runtime::{ApprovalGate, RuntimeState};
    use std::sync::{Arc, Mutex};

    struct ApproveNothing;

    impl ApprovalGate for ApproveNothing {
        fn approve_install(&self, _packages: &[String]) -> bool {
            false
        }
        fn approve_env(&self, _name: &str, _desc: Option<&str>) -> bool {
            false
        }
    }

    struct NeverInstall;

    impl Installer for NeverInstall {
        fn install(&self, _packages: &[String]) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    fn evaluator() -> (PyEvaluator, Arc<Mutex<RuntimeState>>) {
        let state = Arc::new(Mutex::new(RuntimeState::default()));
        let host = HostBridge::new(state.clone(), Arc::new(ApproveNothing), Arc::new(NeverInstall));
        (PyEvaluator::new(host).expect("evaluator"), state)
    }

    #[test]
    fn captures_stdout_and_omits_empty_streams() {
        let (eval, _state) = evaluator();
        let result = eval.exec("print(\"hi\")");
        assert_eq!(result.stdout.as_deref(), Some("hi"));
        assert!(result.stderr.is_none());
        assert!(result.errstr.is_none());
    }

    #[test]
    fn captures_stderr_independently() {
        let (eval, _state) = evaluator();
        let result = eval.exec("import sys\nprint(\"warn\", file=sys.stderr)");
        assert_eq!(result.stderr.as_deref(), Some("warn"));
        assert!(result.stdout.is_none());
    }

    #[test]
    fn raised_errors_become_errstr_and_traceback() {
        let (eval, _state) = evaluator();
        let result = eval.exec("raise ValueError(\"boom\")");
        assert_eq!(result.errstr.as_deref(), Some("boom"));
        let traceback = result.traceback.expect("traceback");
        assert!(traceback.contains("ValueError"));
        assert!(traceback.contains("Traceback"));
    }

    #[test]
    fn interpreter_exit_attempts_are_contained() {
        let (eval, _state) = evaluator();
        let result = eval.exec("import sys\nsys.exit(3)");
        assert!(result.errstr.is_some());
        // A later run on the same evaluator still works.
        let result = eval.exec("print(\"still alive\")");
        assert_eq!(result.stdout.as_deref(), Some("still alive"));
    }

    #[test]
    fn namespace_persists_across_runs() {
        let (eval, _state) = evaluator();
        let first = eval.exec("def greet():\n    return \"hello\"\nvalue = 41");
        assert!(first.errstr.is_none());
        let second = eval.exec("print(greet())\nprint(value + 1)");
        assert_eq!(second.stdout.as_deref(), Some("hello\n42"));
    }

    #[test]
    fn prelude_imports_are_available() {
        let (eval, _state) = evaluator();
        let result = eval.exec("print(json.dumps({\"a\": 1}))");
        assert_eq!(result.stdout.as_deref(), Some("{\"a\": 1}"));
    }

    #[test]
    fn set_result_reaches_the_shared_state() {
        let (eval, state) = evaluator();
        let result = eval.exec("chatexec.set_result(success=True, count=2)");
        assert!(result.errstr.is_none());
        let state = state.lock().expect("state");
        assert_eq!(state.current_state["success"], true);
        assert_eq!(state.current_state["count"], 2);
    }

    #[test]
    fn persistent_state_round_trips_through_python() {
        let (eval, _state) = evaluator();
        eval.exec("chatexec.set_persistent_state(data={\"name\": \"ada\"})");
        let result =
            eval.exec("stored = chatexec.get_persistent_state(\"data\")\nprint(stored[\"name\"])");
        assert_eq!(result.stdout.as_deref(), Some("ada"));
    }

    #[test]
    fn get_env_returns_default_when_denied() {
        let (eval, _state) = evaluator();
        let result = eval.exec(
            "value = chatexec.get_env(\"TOKEN\", default=\"fallback\", desc=\"why\")\nprint(value)",
        );
        assert_eq!(result.stdout.as_deref(), Some("fallback"));
    }

    #[test]
    fn python_version_looks_like_a_version() {
        let (eval, _state) = evaluator();
        let version = eval.python_version();
        assert!(version.starts_with('3'), "unexpected version {version}");
    }
}
