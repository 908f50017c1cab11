//! Dependency installation requested by artifact code.

use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::io::process::run_command;

/// Abstraction over the package installation backend. Tests use scripted
/// installers that record calls without spawning processes.
pub trait Installer: Send + Sync {
    /// Install the given packages. `Ok(false)` means the installer ran but
    /// could not provide every package.
    fn install(&self, packages: &[String]) -> Result<bool>;
}

/// Installer that shells out to `uv pip install`.
pub struct UvInstaller {
    timeout: Duration,
    output_limit_bytes: usize,
}

impl UvInstaller {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            timeout,
            output_limit_bytes,
        }
    }
}

impl Installer for UvInstaller {
    #[instrument(skip_all, fields(count = packages.len()))]
    fn install(&self, packages: &[String]) -> Result<bool> {
        if packages.is_empty() {
            return Ok(true);
        }
        info!(?packages, "installing packages");

        let mut cmd = Command::new("uv");
        cmd.args(["pip", "install", "-q"]).args(packages);
        let output = run_command(cmd, self.timeout, self.output_limit_bytes)?;
        if !output.success() {
            warn!(
                exit_code = ?output.status.code(),
                timed_out = output.timed_out,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "package install failed"
            );
            return Ok(false);
        }
        Ok(true)
    }
}
