//! Conversation-driven code execution host CLI.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use chatexec::exit_codes;
use chatexec::io::client::HttpChatClient;
use chatexec::io::config::{Config, load_config};
use chatexec::io::transcript::load_snapshot;
use chatexec::logging;
use chatexec::runtime::install::UvInstaller;
use chatexec::runtime::{ApprovalGate, BlockRuntime};
use chatexec::task::{LoopStop, NoTools, Task, TaskDeps};

#[derive(Parser)]
#[command(
    name = "chatexec",
    version,
    about = "Conversation-driven code execution host"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "chatexec.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one instruction through the conversation loop.
    Run { instruction: String },
    /// Re-execute the Python blocks recorded in a transcript snapshot.
    Replay { snapshot: PathBuf },
    /// Print the effective configuration as TOML.
    Config,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { instruction } => cmd_run(&cli.config, &instruction),
        Command::Replay { snapshot } => cmd_replay(&cli.config, &snapshot),
        Command::Config => cmd_config(&cli.config),
    }
}

fn cmd_run(config_path: &Path, instruction: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let client = HttpChatClient::new(&config.client)?;
    let deps = production_deps(&config);

    let mut task = Task::new(config, client, deps)?;
    let outcome = task.run(instruction)?;

    if !outcome.reply.is_empty() {
        println!("{}", outcome.reply);
    }
    let final_dir = task.finish();
    eprintln!(
        "rounds: {} | tokens: {}/{}/{} | saved: {}",
        outcome.rounds,
        outcome.usage.input_tokens,
        outcome.usage.output_tokens,
        outcome.usage.total_tokens,
        final_dir.display()
    );

    Ok(match outcome.stop {
        LoopStop::ClientFailed => exit_codes::CLIENT_FAILED,
        _ => exit_codes::OK,
    })
}

fn cmd_replay(config_path: &Path, snapshot_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let snapshot = load_snapshot(snapshot_path)?;
    let cwd = std::env::current_dir().context("resolve current directory")?;

    let deps = production_deps(&config);
    let mut runtime = BlockRuntime::new(
        &cwd,
        config.declared_secrets(),
        deps.gate,
        deps.installer,
        deps.upload,
    )?;

    for block in &snapshot.blocks {
        if block.lang != "python" {
            continue;
        }
        let result = runtime.run(block);
        if let Some(stdout) = &result.stdout {
            println!("{stdout}");
        }
        if let Some(stderr) = &result.stderr {
            eprintln!("{stderr}");
        }
        if let Some(errstr) = &result.errstr {
            eprintln!("error in block '{}': {errstr}", block.name);
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_config(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let rendered = toml::to_string_pretty(&config).context("serialize config")?;
    println!("{rendered}");
    Ok(exit_codes::OK)
}

fn production_deps(config: &Config) -> TaskDeps {
    TaskDeps {
        gate: Arc::new(ConsoleGate {
            auto_install: config.auto_install,
            auto_env: config.auto_approve_env,
        }),
        installer: Arc::new(UvInstaller::new(
            Duration::from_secs(config.install_timeout_secs),
            config.install_output_limit_bytes,
        )),
        tools: Arc::new(NoTools),
        upload: None,
    }
}

/// Gate that asks the operator on the terminal unless auto-approval is
/// configured. This is the blocking human-in-the-loop confirmation the
/// runtime may wait on during a block run.
struct ConsoleGate {
    auto_install: bool,
    auto_env: bool,
}

impl ApprovalGate for ConsoleGate {
    fn approve_install(&self, packages: &[String]) -> bool {
        if self.auto_install {
            return true;
        }
        confirm(&format!(
            "The model requests installation of: {}. Allow?",
            packages.join(", ")
        ))
    }

    fn approve_env(&self, name: &str, desc: Option<&str>) -> bool {
        if self.auto_env {
            return true;
        }
        confirm(&format!(
            "The model requests the value of '{name}' (reason: {}). Allow?",
            desc.unwrap_or("not given")
        ))
    }
}

fn confirm(question: &str) -> bool {
    eprint!("{question} [y/N] ");
    let _ = io::stderr().flush();
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
