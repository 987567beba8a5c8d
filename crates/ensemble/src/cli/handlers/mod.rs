//! CLI command handlers that bridge between `clap` and `ensemble_core`
//!
//! - `lock`: acquire, release, list, cleanup, release-all, events
//! - `error`: register, resolve, search, show, findings
//! - `sync`: sync point
//! - `task`: task lifecycle
//! - `partition`: list, check
//! - `output`: JSON envelopes and formatting helpers

use std::str::FromStr;

use anyhow::Result;
use clap::ArgMatches;

use crate::cli::context::CommandContext;

pub mod error;
pub mod lock;
pub mod output;
pub mod partition;
pub mod sync;
pub mod task;

pub use self::{
    error::handle_error, lock::handle_lock, output::output_json_error,
    partition::handle_partition, sync::handle_sync, task::handle_task,
};

/// Run the parsed command to completion. Blocking.
pub fn run(matches: &ArgMatches) -> Result<()> {
    let ctx = CommandContext::from_matches(matches)?;
    match matches.subcommand() {
        Some(("lock", sub_m)) => handle_lock(&ctx, sub_m),
        Some(("error", sub_m)) => handle_error(&ctx, sub_m),
        Some(("sync", sub_m)) => handle_sync(&ctx, sub_m),
        Some(("task", sub_m)) => handle_task(&ctx, sub_m),
        Some(("partition", sub_m)) => handle_partition(&ctx, sub_m),
        _ => anyhow::bail!("no command given; see --help"),
    }
}

/// Format an error for user display (no stack traces)
pub fn format_error(err: &anyhow::Error) -> String {
    let msg = err.to_string();
    if let Some(source) = err.source() {
        let source_msg = source.to_string();
        if !msg.contains(&source_msg) && !source_msg.is_empty() {
            return format!("{msg}\nCause: {source_msg}");
        }
    }
    msg
}

/// Process exit code for `err`; 1 unless it carries an `ensemble_core::Error`.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ensemble_core::Error>()
        .map_or(1, ensemble_core::Error::exit_code)
}

fn required<'a>(m: &'a ArgMatches, name: &str) -> Result<&'a str> {
    m.get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("{name} is required"))
}

/// All values of a multi-value argument.
fn strings(m: &ArgMatches, name: &str) -> Vec<String> {
    m.get_many::<String>(name)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

/// Multi-word positional joined back into one string.
fn joined(m: &ArgMatches, name: &str) -> String {
    strings(m, name).join(" ")
}

fn parse_enum<T: FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ensemble_core::Error::InvalidInput(format!("unknown {what} '{raw}'")).into())
}

#[cfg(test)]
mod tests {
    use std::io;

    use ensemble_core::{registry::ErrorCategory, Error};

    use super::*;

    #[test]
    fn exit_codes_survive_context() {
        let err = anyhow::Error::from(Error::not_found("task", "TASK-1")).context("showing task");
        assert_eq!(exit_code(&err), 3);
        assert_eq!(exit_code(&anyhow::anyhow!("plain")), 1);
    }

    #[test]
    fn format_error_adds_new_cause() {
        let err = anyhow::Error::from(io::Error::other("disk full")).context("writing table");
        assert_eq!(format_error(&err), "writing table\nCause: disk full");
    }

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!(parse_enum::<ErrorCategory>("type", "error type").ok(), Some(ErrorCategory::Type));
        let err = parse_enum::<ErrorCategory>("nope", "error type").expect_err("rejected");
        assert_eq!(exit_code(&err), 1);
    }
}
