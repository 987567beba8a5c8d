//! Per-invocation context: workspace, agent identity and output mode.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::ArgMatches;
use ensemble_core::{load_config, lock::Holder, EnsembleConfig, Workspace};

/// Everything a handler needs, resolved once from the global flags.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub workspace: Workspace,
    pub holder: Holder,
    pub json: bool,
}

impl CommandContext {
    /// Resolve the root, layer CLI flags over the loaded config and open the
    /// workspace.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        Self::resolve(matches, |key| std::env::var(key).ok())
    }

    pub fn resolve<F>(matches: &ArgMatches, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let root = match matches.get_one::<String>("root") {
            Some(root) => PathBuf::from(root),
            None => std::env::current_dir().context("failed to read the current directory")?,
        };
        let config = apply_cli_flags(load_config(&root)?, matches);
        let workspace = Workspace::open(root, config)?;
        let holder = resolve_holder(matches, &env)?;
        tracing::debug!(agent = %holder.agent_id, pid = holder.pid, "resolved agent identity");

        Ok(Self {
            workspace,
            holder,
            json: matches.get_flag("json"),
        })
    }

    pub fn agent(&self) -> &str {
        &self.holder.agent_id
    }
}

/// Final configuration layer: explicit command-line overrides.
pub fn apply_cli_flags(mut config: EnsembleConfig, matches: &ArgMatches) -> EnsembleConfig {
    if let Some(ms) = matches.get_one::<u64>("acquire-timeout-ms") {
        config.locks.acquire_timeout_ms = *ms;
    }
    if let Some(secs) = matches.get_one::<u64>("stale-threshold") {
        config.locks.stale_threshold_secs = *secs;
    }
    config
}

/// The agent is the long-lived process that runs this CLI, so its pid, not
/// ours, goes on the lock.
fn resolve_holder<F>(matches: &ArgMatches, env: &F) -> Result<Holder>
where
    F: Fn(&str) -> Option<String>,
{
    let pid = match matches.get_one::<u32>("pid") {
        Some(pid) => *pid,
        None => match env("ENSEMBLE_AGENT_PID") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid ENSEMBLE_AGENT_PID '{raw}'"))?,
            None => parent_pid(),
        },
    };

    let agent_id = matches
        .get_one::<String>("agent")
        .cloned()
        .or_else(|| env("ENSEMBLE_AGENT_ID"))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("agent-{pid}"));

    Ok(Holder::new(agent_id).with_pid(pid))
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    std::process::id()
}
