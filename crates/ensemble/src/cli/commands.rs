//! CLI command definitions using `clap`

use clap::{value_parser, Arg, ArgAction, Command as ClapCommand};

pub fn after_help_text(examples: &[&str]) -> String {
    let mut text = String::from("EXAMPLES:\n");
    for example in examples {
        text.push_str("  ");
        text.push_str(example);
        text.push('\n');
    }
    text
}

fn no_lock_arg() -> Arg {
    Arg::new("no-lock")
        .long("no-lock")
        .action(ArgAction::SetTrue)
        .help("Declare partitions without locking them")
}

fn partition_arg() -> Arg {
    Arg::new("partition")
        .long("partition")
        .short('p')
        .action(ArgAction::Append)
        .value_name("PREFIX")
        .help("Path prefix the task works in (repeatable)")
}

fn reason_arg(help: &'static str) -> Arg {
    Arg::new("reason")
        .long("reason")
        .short('r')
        .required(true)
        .help(help)
}

fn task_id_arg() -> Arg {
    Arg::new("id").required(true).help("Task id (TASK-YYYYMMDD-NNN)")
}

pub fn cmd_lock() -> ClapCommand {
    ClapCommand::new("lock")
        .about("Acquire, release and inspect resource locks")
        .subcommand_required(true)
        .subcommand(
            ClapCommand::new("acquire")
                .about("Lock a resource, waiting up to the acquire timeout")
                .arg(Arg::new("resource").required(true).help("Resource path, e.g. src/x.py"))
                .arg(
                    Arg::new("ttl")
                        .long("ttl")
                        .value_parser(value_parser!(u64))
                        .value_name("SECS")
                        .help("Lock lifetime in seconds (default from config)"),
                )
                .arg(
                    Arg::new("review")
                        .long("review")
                        .action(ArgAction::SetTrue)
                        .help("Take a shared review lock instead of an exclusive one"),
                )
                .arg(
                    Arg::new("no-wait")
                        .long("no-wait")
                        .action(ArgAction::SetTrue)
                        .help("Fail immediately if the lock is held"),
                )
                .after_help(after_help_text(&[
                    "ensemble lock acquire src/x.py                 Exclusive lock",
                    "ensemble lock acquire docs/api.md --review     Shared review lock",
                    "ensemble lock acquire src/x.py --ttl 600       Ten minute lock",
                ])),
        )
        .subcommand(
            ClapCommand::new("release")
                .about("Release a lock held by this agent")
                .arg(Arg::new("resource").required(true)),
        )
        .subcommand(ClapCommand::new("list").about("List live locks with age and liveness"))
        .subcommand(
            ClapCommand::new("cleanup")
                .about("Quarantine stale locks and purge old quarantine files"),
        )
        .subcommand(
            ClapCommand::new("release-all").about("Release every lock held by this agent"),
        )
        .subcommand(
            ClapCommand::new("events")
                .about("Show recent lock events")
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .short('n')
                        .value_parser(value_parser!(usize))
                        .default_value("20"),
                ),
        )
}

pub fn cmd_error() -> ClapCommand {
    ClapCommand::new("error")
        .about("Register, resolve and search recurring errors")
        .subcommand_required(true)
        .subcommand(
            ClapCommand::new("register")
                .about("Record an error; repeats of a known error are deduplicated")
                .arg(
                    Arg::new("type")
                        .long("type")
                        .short('t')
                        .required(true)
                        .help("SYNTAX, IMPORT, RUNTIME, TYPE, LOGIC, CONFIG, BUILD, TEST or OTHER"),
                )
                .arg(Arg::new("file").long("file").short('f').required(true))
                .arg(
                    Arg::new("line")
                        .long("line")
                        .short('l')
                        .value_parser(value_parser!(u32)),
                )
                .arg(Arg::new("task").long("task").help("Related task id"))
                .arg(
                    Arg::new("message")
                        .required(true)
                        .num_args(1..)
                        .help("Error message"),
                )
                .after_help(after_help_text(&[
                    "ensemble error register -t TYPE -f src/app.ts -l 10 \"TypeError: ...\"",
                ])),
        )
        .subcommand(
            ClapCommand::new("resolve")
                .about("Mark an error resolved")
                .arg(Arg::new("id").required(true))
                .arg(
                    Arg::new("resolution")
                        .required(true)
                        .num_args(1..)
                        .help("What fixed it"),
                ),
        )
        .subcommand(
            ClapCommand::new("search")
                .about("Search the registry")
                .arg(Arg::new("file").long("file").help("Substring of the file path"))
                .arg(Arg::new("type").long("type"))
                .arg(Arg::new("status").long("status").help("OPEN or RESOLVED"))
                .arg(Arg::new("task").long("task")),
        )
        .subcommand(
            ClapCommand::new("show")
                .about("Show one error record")
                .arg(Arg::new("id").required(true)),
        )
        .subcommand(ClapCommand::new("findings").about("Regenerate the findings summary"))
        .subcommand(
            ClapCommand::new("rebuild-signatures")
                .about("Recompute signatures with the current normalization policy"),
        )
}

pub fn cmd_sync() -> ClapCommand {
    ClapCommand::new("sync")
        .about("Clean expired locks and report partition conflicts")
        .after_help(after_help_text(&[
            "ensemble sync           Run a sync point",
            "ensemble --json sync    Machine-readable conflict report",
        ]))
}

pub fn cmd_task() -> ClapCommand {
    ClapCommand::new("task")
        .about("Move tasks through INBOX, ACTIVE, COMPLETED, HALTED and DUMPED")
        .subcommand_required(true)
        .subcommand(
            ClapCommand::new("new")
                .about("Create a task in INBOX")
                .arg(Arg::new("title").required(true).num_args(1..))
                .arg(partition_arg()),
        )
        .subcommand(
            ClapCommand::new("start")
                .about("INBOX -> ACTIVE: declare and lock the task's partitions")
                .arg(task_id_arg())
                .arg(partition_arg())
                .arg(no_lock_arg()),
        )
        .subcommand(
            ClapCommand::new("verify")
                .about("Record the verification result for an ACTIVE task")
                .arg(task_id_arg())
                .arg(
                    Arg::new("pass")
                        .long("pass")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("fail"),
                )
                .arg(Arg::new("fail").long("fail").action(ArgAction::SetTrue))
                .arg(Arg::new("detail").long("detail").short('d').default_value("")),
        )
        .subcommand(
            ClapCommand::new("close")
                .about("ACTIVE -> COMPLETED; needs a passing verification")
                .arg(task_id_arg()),
        )
        .subcommand(
            ClapCommand::new("halt")
                .about("ACTIVE -> HALTED: release locks and partitions")
                .arg(task_id_arg())
                .arg(reason_arg("Why work stopped"))
                .arg(
                    Arg::new("resume-when")
                        .long("resume-when")
                        .help("Condition under which to resume"),
                ),
        )
        .subcommand(
            ClapCommand::new("resume")
                .about("HALTED -> ACTIVE")
                .arg(task_id_arg())
                .arg(no_lock_arg()),
        )
        .subcommand(
            ClapCommand::new("dump")
                .about("ACTIVE -> DUMPED; abandons the task for good")
                .arg(task_id_arg())
                .arg(reason_arg("Why the task is abandoned")),
        )
        .subcommand(
            ClapCommand::new("reopen")
                .about("COMPLETED -> ACTIVE; the earlier verification is discarded")
                .arg(task_id_arg())
                .arg(reason_arg("Why the task needs more work"))
                .arg(no_lock_arg()),
        )
        .subcommand(
            ClapCommand::new("show")
                .about("Show a task record")
                .arg(task_id_arg()),
        )
        .subcommand(
            ClapCommand::new("list")
                .about("List tasks")
                .arg(Arg::new("state").long("state").short('s')),
        )
}

pub fn cmd_partition() -> ClapCommand {
    ClapCommand::new("partition")
        .about("Inspect declared path partitions")
        .subcommand_required(true)
        .subcommand(ClapCommand::new("list").about("List active partitions by agent"))
        .subcommand(
            ClapCommand::new("check")
                .about("Report other agents' partitions overlapping the given paths")
                .arg(Arg::new("paths").required(true).num_args(1..)),
        )
}

pub fn build_cli() -> ClapCommand {
    ClapCommand::new("ensemble")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Coordinate parallel agents through a shared workspace")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("root")
                .long("root")
                .global(true)
                .value_name("DIR")
                .help("Workspace root (default: current directory)"),
        )
        .arg(
            Arg::new("agent")
                .long("agent")
                .global(true)
                .value_name("ID")
                .help("Agent id (default: $ENSEMBLE_AGENT_ID, then agent-<parent pid>)"),
        )
        .arg(
            Arg::new("pid")
                .long("pid")
                .global(true)
                .value_parser(value_parser!(u32))
                .help("Holder pid recorded on locks (default: $ENSEMBLE_AGENT_PID, then the parent pid)"),
        )
        .arg(
            Arg::new("acquire-timeout-ms")
                .long("acquire-timeout-ms")
                .global(true)
                .value_parser(value_parser!(u64))
                .help("How long lock acquisition keeps retrying"),
        )
        .arg(
            Arg::new("stale-threshold")
                .long("stale-threshold")
                .global(true)
                .value_parser(value_parser!(u64))
                .value_name("SECS")
                .help("Age after which an unverifiable lock is stale"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Output as JSON"),
        )
        .subcommand(cmd_lock())
        .subcommand(cmd_error())
        .subcommand(cmd_sync())
        .subcommand(cmd_task())
        .subcommand(cmd_partition())
}
