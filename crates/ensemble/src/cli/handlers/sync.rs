//! Sync point handler

use anyhow::Result;
use clap::ArgMatches;

use super::output::emit;
use crate::cli::context::CommandContext;

pub fn handle_sync(ctx: &CommandContext, _sub_m: &ArgMatches) -> Result<()> {
    let report = ctx.workspace.sync_point().run()?;
    emit(ctx.json, "sync-report", &report, |report| {
        println!("✓ Sync point: cleaned {} lock(s)", report.cleaned_locks);
        if report.conflicts.is_empty() {
            println!("  no conflicts");
        } else {
            println!("  {} conflict(s):", report.conflicts.len());
            for conflict in &report.conflicts {
                println!("  ! {conflict}");
            }
        }
        println!("  findings: {}", report.findings_path.display());
    })
}
