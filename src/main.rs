//! Autonomous sprint supervisor for sandboxed coding agents.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use agentbox::agent::{AgentRunner, NoopAgentRunner, ProcessAgentRunner};
use agentbox::cancel::CancelToken;
use agentbox::config::load_config;
use agentbox::journal::Journal;
use agentbox::store::Store;
use agentbox::supervisor::Supervisor;
use agentbox::workflow::GitCli;

#[derive(Parser)]
#[command(
    name = "agentbox",
    version,
    about = "Autonomous sprint supervisor for sandboxed coding agents"
)]
struct Cli {
    /// Workspace directory holding `.agentbox/`.
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full supervisor session against a PRD.
    Run {
        /// Agent command to execute per task (prompt on stdin). Empty
        /// means dry-run with the no-op runner.
        #[arg(long)]
        agent_command: Vec<String>,
        /// Per-task agent timeout in seconds.
        #[arg(long, default_value_t = 1800)]
        agent_timeout_secs: u64,
    },
    /// Show the latest session's task and usage summary.
    Status,
    /// Dump the latest session's dashboard data as JSON.
    Dashboard,
    /// Export the latest session's journal as markdown.
    Journal,
}

fn main() {
    agentbox::logging::init();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            agent_command,
            agent_timeout_secs,
        } => cmd_run(&cli.workdir, agent_command, agent_timeout_secs),
        Command::Status => cmd_status(&cli.workdir),
        Command::Dashboard => cmd_dashboard(&cli.workdir),
        Command::Journal => cmd_journal(&cli.workdir),
    }
}

fn cmd_run(workdir: &PathBuf, agent_command: Vec<String>, agent_timeout_secs: u64) -> Result<()> {
    let mut cfg = load_config(&workdir.join("agentbox.toml"))?;
    if cfg.work_dir.is_empty() {
        cfg.work_dir = workdir.to_string_lossy().to_string();
    }

    let workflow = Box::new(GitCli::new(cfg.repo_url.clone(), workdir.clone()));
    let runner: Box<dyn AgentRunner> = if agent_command.is_empty() {
        Box::new(NoopAgentRunner)
    } else {
        Box::new(ProcessAgentRunner {
            command: agent_command,
            workdir: workdir.clone(),
            timeout: Duration::from_secs(agent_timeout_secs),
            output_limit_bytes: 1_000_000,
        })
    };

    let mut supervisor = Supervisor::new(cfg, workflow, runner, None)?;
    let cancel = CancelToken::new();
    supervisor.run(&cancel)
}

fn open_workspace_store(workdir: &PathBuf) -> Result<Store> {
    let path = workdir.join(".agentbox/agentbox.db");
    if !path.exists() {
        anyhow::bail!("no agentbox database at {} (run a session first)", path.display());
    }
    Store::open(&path)
}

fn cmd_status(workdir: &PathBuf) -> Result<()> {
    let store = open_workspace_store(workdir)?;
    let session = store.latest_session()?;
    let stats = store.task_stats(session.id)?;
    let usage = store.total_usage(session.id)?;

    println!("Session {} [{}] on {}", session.id, session.status, session.branch_name);
    println!(
        "Tasks: {} total | {} completed | {} pending | {} in progress | {} failed | {} deferred",
        stats.total, stats.completed, stats.pending, stats.in_progress, stats.failed, stats.deferred,
    );
    println!(
        "Usage: {} iterations | {} tokens | {}ms container time",
        usage.iteration, usage.estimated_tokens, usage.container_time_ms,
    );
    Ok(())
}

fn cmd_dashboard(workdir: &PathBuf) -> Result<()> {
    let store = open_workspace_store(workdir)?;
    let session = store.latest_session()?;
    let data = store.export_dashboard_data(session.id)?;
    let json = serde_json::to_string_pretty(&data).context("serialize dashboard")?;
    println!("{json}");
    Ok(())
}

fn cmd_journal(workdir: &PathBuf) -> Result<()> {
    let store = open_workspace_store(workdir)?;
    let session = store.latest_session()?;
    let journal = Journal::new(std::sync::Arc::new(store), session.id);
    print!("{}", journal.export_markdown()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["agentbox", "run"]);
        match cli.command {
            Command::Run {
                agent_command,
                agent_timeout_secs,
            } => {
                assert!(agent_command.is_empty());
                assert_eq!(agent_timeout_secs, 1800);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parse_status_with_workdir() {
        let cli = Cli::parse_from(["agentbox", "--workdir", "/tmp/ws", "status"]);
        assert_eq!(cli.workdir, PathBuf::from("/tmp/ws"));
        assert!(matches!(cli.command, Command::Status));
    }
}
