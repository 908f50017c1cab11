//! Capability surface exposed to artifact code.
//!
//! A single host object is injected into the evaluation namespace as the
//! global named [`RUNTIME_GLOBAL`]. Its methods are the only bridge from
//! artifact code back into the host: dependency installation, gated secret
//! reads, per-round results, and the cross-round session store.
//!
//! The capability list is enumerated statically in [`CAPABILITIES`] so the
//! prompt section describing the surface is assembled from data, not from
//! runtime reflection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyList, PyString, PyTuple};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::redact::FILTERED;
use crate::runtime::install::Installer;
use crate::runtime::{ApprovalGate, RuntimeState};

/// Name of the host object inside the evaluation namespace.
pub const RUNTIME_GLOBAL: &str = "chatexec";

/// One statically registered capability, for prompt assembly.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CapabilitySpec {
    pub name: &'static str,
    pub signature: &'static str,
    pub description: &'static str,
}

/// The full capability surface, in documentation order.
pub const CAPABILITIES: &[CapabilitySpec] = &[
    CapabilitySpec {
        name: "install_packages",
        signature: "install_packages(*names) -> bool",
        description: "Request installation of third-party packages before importing them. \
                      Returns True when every requested package is available. Approved \
                      installs are remembered, so repeated requests are no-ops.",
    },
    CapabilitySpec {
        name: "get_env",
        signature: "get_env(name, default=None, *, desc=None) -> value",
        description: "Request a named secret or environment value. Pass a human-readable \
                      `desc` explaining why the value is needed. Returns `default` when the \
                      value is absent or the request is denied.",
    },
    CapabilitySpec {
        name: "set_result",
        signature: "set_result(**kwargs)",
        description: "Set key/value pairs as the explicit result of the current block run. \
                      Merged into the `result` field of the execution feedback.",
    },
    CapabilitySpec {
        name: "set_persistent_state",
        signature: "set_persistent_state(**kwargs)",
        description: "Store key/value pairs in the session store that persists across block \
                      runs within the same task.",
    },
    CapabilitySpec {
        name: "get_persistent_state",
        signature: "get_persistent_state(key) -> value | None",
        description: "Read a value previously stored with set_persistent_state. Returns None \
                      when the key is absent.",
    },
];

/// Host-function table injected into the namespace as [`RUNTIME_GLOBAL`].
#[pyclass]
pub struct HostBridge {
    state: Arc<Mutex<RuntimeState>>,
    gate: Arc<dyn ApprovalGate>,
    installer: Arc<dyn Installer>,
}

impl HostBridge {
    pub fn new(
        state: Arc<Mutex<RuntimeState>>,
        gate: Arc<dyn ApprovalGate>,
        installer: Arc<dyn Installer>,
    ) -> Self {
        Self {
            state,
            gate,
            installer,
        }
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[pymethods]
impl HostBridge {
    #[pyo3(signature = (*names))]
    fn install_packages(&self, names: &Bound<'_, PyTuple>) -> PyResult<bool> {
        let names: Vec<String> = names.extract()?;
        if names.is_empty() {
            return Ok(true);
        }

        let pending: Vec<String> = {
            let state = self.state();
            names
                .iter()
                .filter(|name| !state.packages.contains(*name))
                .cloned()
                .collect()
        };
        if pending.is_empty() {
            debug!(?names, "packages already installed");
            return Ok(true);
        }

        if !self.gate.approve_install(&pending) {
            info!(?pending, "package install denied");
            return Ok(false);
        }
        match self.installer.install(&pending) {
            Ok(true) => {
                self.state().packages.extend(pending.iter().cloned());
                info!(?pending, "packages installed");
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                warn!(?pending, err = %err, "package install failed");
                Ok(false)
            }
        }
    }

    #[pyo3(signature = (name, default=None, *, desc=None))]
    fn get_env(
        &self,
        py: Python<'_>,
        name: &str,
        default: Option<Py<PyAny>>,
        desc: Option<&str>,
    ) -> Py<PyAny> {
        let value = if self.gate.approve_env(name, desc) {
            self.state().secrets.get(name).map(|entry| entry.value.clone())
        } else {
            info!(name, "secret read denied");
            None
        };
        match value {
            Some(value) => PyString::new(py, &value).into_any().unbind(),
            None => {
                debug!(name, "returning caller default");
                default.unwrap_or_else(|| py.None())
            }
        }
    }

    #[pyo3(signature = (**kwargs))]
    fn set_result(&self, kwargs: Option<&Bound<'_, PyDict>>) {
        if let Some(kwargs) = kwargs {
            let mut state = self.state();
            for (key, value) in kwargs.iter() {
                state
                    .current_state
                    .insert(dict_key(&key), py_to_json(&value));
            }
        }
    }

    #[pyo3(signature = (**kwargs))]
    fn set_persistent_state(&self, kwargs: Option<&Bound<'_, PyDict>>) {
        if let Some(kwargs) = kwargs {
            let mut state = self.state();
            for (key, value) in kwargs.iter() {
                state.session.insert(dict_key(&key), py_to_json(&value));
            }
        }
    }

    fn get_persistent_state(&self, py: Python<'_>, key: &str) -> PyResult<Py<PyAny>> {
        match self.state().session.get(key) {
            Some(value) => json_to_py(py, value),
            None => Ok(py.None()),
        }
    }
}

fn dict_key(key: &Bound<'_, PyAny>) -> String {
    key.extract::<String>().unwrap_or_else(|_| key.to_string())
}

/// Convert a Python value into JSON. Values outside the JSON data model
/// become the filtered placeholder instead of failing the round.
pub(crate) fn py_to_json(value: &Bound<'_, PyAny>) -> Value {
    if value.is_none() {
        return Value::Null;
    }
    if let Ok(b) = value.downcast::<PyBool>() {
        return Value::Bool(b.is_true());
    }
    if let Ok(i) = value.extract::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = value.extract::<f64>() {
        return serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(FILTERED.to_string()));
    }
    if let Ok(s) = value.extract::<String>() {
        return Value::String(s);
    }
    if let Ok(list) = value.downcast::<PyList>() {
        return Value::Array(list.iter().map(|item| py_to_json(&item)).collect());
    }
    if let Ok(tuple) = value.downcast::<PyTuple>() {
        return Value::Array(tuple.iter().map(|item| py_to_json(&item)).collect());
    }
    if let Ok(dict) = value.downcast::<PyDict>() {
        let mut map = serde_json::Map::new();
        for (key, entry) in dict.iter() {
            map.insert(dict_key(&key), py_to_json(&entry));
        }
        return Value::Object(map);
    }
    Value::String(FILTERED.to_string())
}

/// Convert a JSON value back into a Python object.
pub(crate) fn json_to_py(py: Python<'_>, value: &Value) -> PyResult<Py<PyAny>> {
    Ok(match value {
        Value::Null => py.None(),
        Value::Bool(b) => PyBool::new(py, *b).to_owned().into_any().unbind(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into_pyobject(py)?.into_any().unbind()
            } else if let Some(u) = n.as_u64() {
                u.into_pyobject(py)?.into_any().unbind()
            } else {
                n.as_f64()
                    .unwrap_or(f64::NAN)
                    .into_pyobject(py)?
                    .into_any()
                    .unbind()
            }
        }
        Value::String(s) => PyString::new(py, s).into_any().unbind(),
        Value::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(json_to_py(py, item)?)?;
            }
            list.into_any().unbind()
        }
        Value::Object(map) => {
            let dict = PyDict::new(py);
            for (key, entry) in map {
                dict.set_item(key, json_to_py(py, entry)?)?;
            }
            dict.into_any().unbind()
        }
    })
}
