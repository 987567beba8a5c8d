//! Error registry handlers

use anyhow::{Context, Result};
use clap::ArgMatches;
use ensemble_core::registry::{ErrorRecord, ErrorReport, ErrorStatus, SearchFilter};
use serde_json::json;

use super::{
    output::{emit, preview},
    joined, parse_enum, required,
};
use crate::cli::context::CommandContext;

pub fn handle_error(ctx: &CommandContext, sub_m: &ArgMatches) -> Result<()> {
    match sub_m.subcommand() {
        Some(("register", m)) => register(ctx, m),
        Some(("resolve", m)) => resolve(ctx, m),
        Some(("search", m)) => search(ctx, m),
        Some(("show", m)) => show(ctx, m),
        Some(("findings", _)) => findings(ctx),
        Some(("rebuild-signatures", _)) => rebuild(ctx),
        _ => anyhow::bail!("unknown error subcommand"),
    }
}

fn register(ctx: &CommandContext, m: &ArgMatches) -> Result<()> {
    let category = parse_enum(required(m, "type")?, "error type")?;
    let mut report = ErrorReport::new(category, required(m, "file")?, joined(m, "message"))
        .with_agent(ctx.agent());
    if let Some(line) = m.get_one::<u32>("line") {
        report = report.with_line(*line);
    }
    if let Some(task) = m.get_one::<String>("task") {
        report = report.with_task(task.as_str());
    }

    let registration = ctx.workspace.registry().register(report)?;
    emit(ctx.json, "error-registration", &registration, |r| {
        if r.duplicate {
            println!(
                "Known error {} seen again ({} occurrences)",
                r.record.id, r.record.occurrences
            );
        } else {
            println!("✓ Registered {}", r.record.id);
        }
        println!("  signature: {}", r.record.signature);
    })
}

fn resolve(ctx: &CommandContext, m: &ArgMatches) -> Result<()> {
    let id = required(m, "id")?;
    let record = ctx
        .workspace
        .registry()
        .resolve(id, &joined(m, "resolution"), ctx.agent())?;
    emit(ctx.json, "error-record", &record, |r| {
        println!("✓ Resolved {} ({} occurrences)", r.id, r.occurrences);
    })
}

fn search(ctx: &CommandContext, m: &ArgMatches) -> Result<()> {
    let filter = SearchFilter {
        file: m.get_one::<String>("file").cloned(),
        category: m
            .get_one::<String>("type")
            .map(|raw| parse_enum(raw, "error type"))
            .transpose()?,
        status: m
            .get_one::<String>("status")
            .map(|raw| parse_enum::<ErrorStatus>(raw, "error status"))
            .transpose()?,
        task_id: m.get_one::<String>("task").cloned(),
    };
    let records = ctx.workspace.registry().search(&filter)?;
    emit(ctx.json, "error-list", &records, |records| {
        if records.is_empty() {
            println!("No matching errors");
        }
        for record in records {
            print_summary_line(record);
        }
    })
}

fn show(ctx: &CommandContext, m: &ArgMatches) -> Result<()> {
    let record = ctx.workspace.registry().get(required(m, "id")?)?;
    emit(ctx.json, "error-record", &record, |r| {
        print_summary_line(r);
        println!("  file:        {}{}", r.file, r.line.map(|l| format!(":{l}")).unwrap_or_default());
        println!("  signature:   {}", r.signature);
        println!("  first seen:  {}", r.first_seen.to_rfc3339());
        println!("  last seen:   {}", r.last_seen.to_rfc3339());
        if !r.related_tasks.is_empty() {
            println!("  tasks:       {}", r.related_tasks.join(", "));
        }
        if let Some(resolution) = &r.resolution {
            println!("  resolution:  {resolution}");
        }
        println!();
        println!("{}", r.message);
    })
}

fn findings(ctx: &CommandContext) -> Result<()> {
    let path = ctx.workspace.registry().regenerate_summary()?;
    let data = json!({ "path": path });
    emit(ctx.json, "findings", &data, |_| {
        println!("✓ Findings written to {}", path.display());
    })
}

fn rebuild(ctx: &CommandContext) -> Result<()> {
    let merged = ctx
        .workspace
        .registry()
        .rebuild_signatures()
        .context("failed to rebuild error signatures")?;
    let data = json!({ "merged": merged });
    emit(ctx.json, "signature-rebuild", &data, |_| {
        println!("✓ Signatures rebuilt; {merged} duplicate record(s) merged");
    })
}

fn print_summary_line(record: &ErrorRecord) {
    println!(
        "{} {:<8} {:<8} x{:<4} {}: {}",
        record.id,
        record.category.to_string(),
        record.status.to_string(),
        record.occurrences,
        record.file,
        preview(&record.message, 80)
    );
}
