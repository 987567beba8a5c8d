//! Partition handlers

use anyhow::Result;
use clap::ArgMatches;

use super::{output::emit, strings};
use crate::cli::context::CommandContext;

pub fn handle_partition(ctx: &CommandContext, sub_m: &ArgMatches) -> Result<()> {
    let partitions = ctx.workspace.partitions();
    match sub_m.subcommand() {
        Some(("list", _)) => {
            let table = partitions.load()?;
            emit(ctx.json, "partition-list", &table, |table| {
                if table.agents.is_empty() {
                    println!("No active partitions");
                }
                for (agent, entry) in &table.agents {
                    println!("{agent} ({}): {}", entry.task_id, entry.prefixes.join(", "));
                }
            })
        }
        Some(("check", m)) => {
            let conflicts = partitions.check_targets(ctx.agent(), &strings(m, "paths"))?;
            emit(ctx.json, "partition-check", &conflicts, |conflicts| {
                if conflicts.is_empty() {
                    println!("✓ No other agent claims these paths");
                }
                for conflict in conflicts {
                    println!("! {conflict}");
                }
            })
        }
        _ => anyhow::bail!("unknown partition subcommand"),
    }
}
