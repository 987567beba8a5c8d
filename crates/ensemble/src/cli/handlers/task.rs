//! Task lifecycle handlers

use anyhow::Result;
use clap::ArgMatches;
use ensemble_core::task::{Activation, Task, TaskState};

use super::{joined, output::emit, parse_enum, required, strings};
use crate::cli::context::CommandContext;

pub fn handle_task(ctx: &CommandContext, sub_m: &ArgMatches) -> Result<()> {
    let board = ctx.workspace.tasks();
    match sub_m.subcommand() {
        Some(("new", m)) => {
            let task = board.create(&joined(m, "title"), &strings(m, "partition"))?;
            emit(ctx.json, "task", &task, |t| println!("✓ Created {} [{}] {}", t.id, t.state, t.title))
        }
        Some(("start", m)) => {
            let activation = board.start(
                required(m, "id")?,
                &ctx.holder,
                &strings(m, "partition"),
                !m.get_flag("no-lock"),
            )?;
            emit(ctx.json, "task-activation", &activation, print_activation)
        }
        Some(("verify", m)) => {
            if !m.get_flag("pass") && !m.get_flag("fail") {
                anyhow::bail!("pass either --pass or --fail");
            }
            let detail = m.get_one::<String>("detail").map_or("", String::as_str);
            let task = board.record_verification(required(m, "id")?, m.get_flag("pass"), detail, ctx.agent())?;
            emit(ctx.json, "task", &task, |t| {
                let outcome = t.verification.as_ref().is_some_and(|v| v.passed);
                println!("✓ Recorded verification for {}: {}", t.id, if outcome { "passed" } else { "failed" });
            })
        }
        Some(("close", m)) => {
            let task = board.close(required(m, "id")?, ctx.agent())?;
            emit(ctx.json, "task", &task, |t| println!("✓ {} is {}", t.id, t.state))
        }
        Some(("halt", m)) => {
            let task = board.halt(
                required(m, "id")?,
                ctx.agent(),
                required(m, "reason")?,
                m.get_one::<String>("resume-when").map(String::as_str),
            )?;
            emit(ctx.json, "task", &task, |t| println!("✓ {} is {}; locks released", t.id, t.state))
        }
        Some(("resume", m)) => {
            let activation = board.resume(required(m, "id")?, &ctx.holder, !m.get_flag("no-lock"))?;
            emit(ctx.json, "task-activation", &activation, print_activation)
        }
        Some(("dump", m)) => {
            let task = board.dump(required(m, "id")?, ctx.agent(), required(m, "reason")?)?;
            emit(ctx.json, "task", &task, |t| println!("✓ {} is {}", t.id, t.state))
        }
        Some(("reopen", m)) => {
            let activation = board.reopen(
                required(m, "id")?,
                &ctx.holder,
                required(m, "reason")?,
                !m.get_flag("no-lock"),
            )?;
            emit(ctx.json, "task-activation", &activation, print_activation)
        }
        Some(("show", m)) => {
            let task = board.get(required(m, "id")?)?;
            emit(ctx.json, "task", &task, print_task)
        }
        Some(("list", m)) => {
            let state = m
                .get_one::<String>("state")
                .map(|raw| parse_enum::<TaskState>(raw, "task state"))
                .transpose()?;
            let tasks = board.list(state)?;
            emit(ctx.json, "task-list", &tasks, |tasks| {
                if tasks.is_empty() {
                    println!("No tasks");
                }
                for t in tasks {
                    println!(
                        "{} {:<9} {:<16} {}",
                        t.id,
                        t.state.to_string(),
                        t.owner.as_deref().unwrap_or("-"),
                        t.title
                    );
                }
            })
        }
        _ => anyhow::bail!("unknown task subcommand"),
    }
}

fn print_activation(activation: &Activation) {
    let task = &activation.task;
    println!(
        "✓ {} is {} for {}",
        task.id,
        task.state,
        task.owner.as_deref().unwrap_or("-")
    );
    for resource in &activation.locked {
        println!("  locked '{resource}'");
    }
    for info in &activation.lock_conflicts {
        println!(
            "  ! '{}' is locked by {} (pid {})",
            info.record.resource, info.record.agent_id, info.record.holder_pid
        );
    }
    for conflict in &activation.partition_conflicts {
        println!("  ! {conflict}");
    }
}

fn print_task(task: &Task) {
    println!("{} [{}] {}", task.id, task.state, task.title);
    if let Some(owner) = &task.owner {
        println!("  owner:       {owner}");
    }
    if !task.partitions.is_empty() {
        println!("  partitions:  {}", task.partitions.join(", "));
    }
    if !task.locks.is_empty() {
        println!("  locks:       {}", task.locks.join(", "));
    }
    match &task.verification {
        Some(v) => println!(
            "  verified:    {} by {} ({})",
            if v.passed { "passed" } else { "failed" },
            v.recorded_by,
            v.detail
        ),
        None => println!("  verified:    no"),
    }
    if let Some(halt) = &task.halt {
        println!("  halted:      {}", halt.reason);
        if let Some(condition) = &halt.resume_condition {
            println!("  resume when: {condition}");
        }
    }
    if task.reopen_count > 0 {
        println!("  reopened:    {} time(s)", task.reopen_count);
    }
    for step in &task.history {
        println!(
            "  {} {} -> {} by {}{}",
            step.at.to_rfc3339(),
            step.from,
            step.to,
            step.by,
            step.reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
        );
    }
}
