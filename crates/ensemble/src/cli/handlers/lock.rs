//! Lock handlers: acquire, release, list, cleanup, release-all, events

use std::time::Duration;

use anyhow::Result;
use clap::ArgMatches;
use ensemble_core::lock::{Acquisition, LockKind, Released};
use serde_json::json;

use super::{
    output::{emit, format_age},
    required,
};
use crate::cli::context::CommandContext;

pub fn handle_lock(ctx: &CommandContext, sub_m: &ArgMatches) -> Result<()> {
    match sub_m.subcommand() {
        Some(("acquire", m)) => acquire(ctx, m),
        Some(("release", m)) => release(ctx, m),
        Some(("list", _)) => list(ctx),
        Some(("cleanup", _)) => cleanup(ctx),
        Some(("release-all", _)) => release_all(ctx),
        Some(("events", m)) => events(ctx, m),
        _ => anyhow::bail!("unknown lock subcommand"),
    }
}

fn acquire(ctx: &CommandContext, m: &ArgMatches) -> Result<()> {
    let resource = required(m, "resource")?;
    let ttl = m.get_one::<u64>("ttl").map(|secs| Duration::from_secs(*secs));
    let kind = if m.get_flag("review") {
        LockKind::Review
    } else {
        LockKind::Exclusive
    };
    let locks = ctx.workspace.locks();

    let grant = if m.get_flag("no-wait") {
        match locks.try_acquire(resource, &ctx.holder, ttl, kind)? {
            Acquisition::Acquired(grant) => grant,
            Acquisition::Held(info) => return Err(info.held_error().into()),
        }
    } else {
        locks.acquire(resource, &ctx.holder, ttl, kind)?
    };

    emit(ctx.json, "lock-grant", &grant, |grant| {
        let verb = if grant.renewed { "Renewed" } else { "Acquired" };
        println!(
            "✓ {verb} {} lock on '{}' for {} (ttl {}s)",
            grant.record.kind, grant.record.resource, grant.record.agent_id, grant.record.ttl_seconds
        );
        for stale in &grant.quarantined {
            println!("  quarantined stale lock on '{stale}'");
        }
    })
}

fn release(ctx: &CommandContext, m: &ArgMatches) -> Result<()> {
    let resource = required(m, "resource")?;
    let outcome = ctx.workspace.locks().release(resource, &ctx.holder)?;
    let data = json!({ "resource": resource, "outcome": outcome });
    emit(ctx.json, "lock-release", &data, |_| match outcome {
        Released::Released => println!("✓ Released '{resource}'"),
        Released::NotHeld => println!("'{resource}' was not locked"),
    })
}

fn list(ctx: &CommandContext) -> Result<()> {
    let locks = ctx.workspace.locks().list()?;
    emit(ctx.json, "lock-list", &locks, |locks| {
        if locks.is_empty() {
            println!("No live locks");
            return;
        }
        println!(
            "{:<40} {:<10} {:<20} {:>8} {:>8} {:<12}",
            "RESOURCE", "KIND", "AGENT", "PID", "AGE", "LIVENESS"
        );
        for info in locks {
            let flag = if info.stale { " (stale)" } else { "" };
            println!(
                "{:<40} {:<10} {:<20} {:>8} {:>8} {:<12}{flag}",
                info.record.resource,
                info.record.kind.to_string(),
                info.record.agent_id,
                info.record.holder_pid,
                format_age(info.age_secs),
                info.liveness.to_string(),
            );
        }
    })
}

fn cleanup(ctx: &CommandContext) -> Result<()> {
    let report = ctx.workspace.locks().cleanup_expired()?;
    emit(ctx.json, "lock-cleanup", &report, |report| {
        println!(
            "✓ Cleaned {} lock(s); purged {} old quarantine file(s)",
            report.cleaned(),
            report.purged
        );
        for resource in &report.quarantined {
            println!("  quarantined '{resource}'");
        }
    })
}

fn release_all(ctx: &CommandContext) -> Result<()> {
    let released = ctx.workspace.locks().release_all(ctx.agent())?;
    let data = json!({ "agent_id": ctx.agent(), "released": released });
    emit(ctx.json, "lock-release-all", &data, |_| {
        println!("✓ Released {released} lock(s) held by {}", ctx.agent());
    })
}

fn events(ctx: &CommandContext, m: &ArgMatches) -> Result<()> {
    let limit = m.get_one::<usize>("limit").copied().unwrap_or(20);
    let entries = ctx.workspace.locks().recent_events(limit)?;
    emit(ctx.json, "lock-events", &entries, |entries| {
        for entry in entries {
            println!("{} {:<24} {}", entry.timestamp_utc_iso, entry.event.to_string(), entry.details);
        }
    })
}
