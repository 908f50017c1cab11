//! Operator configuration stored as `chatexec.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::runtime::SecretEntry;

/// Top-level configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Maximum conversation rounds per task.
    pub max_rounds: u32,

    /// Approve dependency-install requests without prompting.
    pub auto_install: bool,

    /// Approve secret/environment reads without prompting.
    pub auto_approve_env: bool,

    /// Recognize tool-invocation replies (single JSON object) in addition
    /// to block markup.
    pub tool_calls: bool,

    /// Parent directory for per-task working directories. Defaults to the
    /// current directory.
    pub workdir: Option<String>,

    /// Optional role text placed at the top of the system briefing.
    pub role: Option<String>,

    /// Maximum time for one package-install invocation, in seconds.
    pub install_timeout_secs: u64,

    /// Truncate installer output beyond this many bytes.
    pub install_output_limit_bytes: usize,

    pub client: ClientConfig,

    /// Operator-declared APIs: free-text description plus the secrets the
    /// model may request through the environment capability.
    pub api: BTreeMap<String, ApiConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of an OpenAI-compatible chat completion endpoint.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the bearer token, if the endpoint
    /// requires one.
    pub api_key_env: Option<String>,
    pub temperature: f32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".to_string(),
            model: "local-model".to_string(),
            api_key_env: None,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub desc: Option<String>,
    /// Secret name -> value and human-readable meaning.
    pub env: BTreeMap<String, EnvDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvDecl {
    pub value: String,
    pub desc: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_rounds: 16,
            auto_install: false,
            auto_approve_env: false,
            tool_calls: false,
            workdir: None,
            role: None,
            install_timeout_secs: 10 * 60,
            install_output_limit_bytes: 100_000,
            client: ClientConfig::default(),
            api: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            return Err(anyhow!("max_rounds must be > 0"));
        }
        if self.install_timeout_secs == 0 {
            return Err(anyhow!("install_timeout_secs must be > 0"));
        }
        if self.install_output_limit_bytes == 0 {
            return Err(anyhow!("install_output_limit_bytes must be > 0"));
        }
        if self.client.base_url.trim().is_empty() {
            return Err(anyhow!("client.base_url must not be empty"));
        }
        if self.client.model.trim().is_empty() {
            return Err(anyhow!("client.model must not be empty"));
        }
        if !self.client.temperature.is_finite() || self.client.temperature < 0.0 {
            return Err(anyhow!("client.temperature must be a finite value >= 0"));
        }
        Ok(())
    }

    /// Secrets declared across the API catalog, keyed by name. Entries with
    /// empty values are skipped: they are placeholders the operator never
    /// filled in.
    pub fn declared_secrets(&self) -> BTreeMap<String, SecretEntry> {
        let mut secrets = BTreeMap::new();
        for api in self.api.values() {
            for (name, decl) in &api.env {
                if decl.value.trim().is_empty() {
                    continue;
                }
                secrets.insert(
                    name.clone(),
                    SecretEntry {
                        value: decl.value.clone(),
                        desc: decl.desc.clone(),
                    },
                );
            }
        }
        secrets
    }

    /// Markdown section describing the declared APIs for the system
    /// briefing. Secret values never appear here, only names and meanings.
    pub fn api_briefing(&self) -> Option<String> {
        if self.api.is_empty() {
            return None;
        }
        let mut lines = Vec::new();
        for (api_name, api) in &self.api {
            lines.push(format!("## {api_name} API"));
            if let Some(desc) = &api.desc {
                lines.push(format!("### Description\n{desc}"));
            }
            if !api.env.is_empty() {
                lines.push("### Environment variable names and meaning".to_string());
                for (name, decl) in &api.env {
                    if decl.value.trim().is_empty() {
                        continue;
                    }
                    lines.push(format!("- {name}: {}", decl.desc));
                }
            }
        }
        Some(lines.join("\n"))
    }
}

/// Load config from a TOML file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
