//! Ensemble CLI - coordinate parallel agents through a shared workspace
//!
//! Binary name: `ensemble`

use std::process;

use ensemble::cli::{
    build_cli,
    handlers::{exit_code, format_error, output_json_error, run},
    init_tracing,
};

/// Conventional exit status for a command interrupted by a signal.
const INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    if let Err(e) = init_tracing() {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("Warning: {e}");
        }
    }

    let matches = build_cli().get_matches();
    let json_mode = matches.get_flag("json");

    // Handlers do blocking file I/O and back off with thread sleeps.
    let work = tokio::task::spawn_blocking(move || run(&matches));

    let cli_result = tokio::select! {
        joined = work => match joined {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("command task failed: {e}")),
        },
        () = shutdown_signal() => {
            tracing::info!("Received shutdown signal, aborting command");
            #[allow(clippy::print_stderr)]
            {
                eprintln!("Error: interrupted");
            }
            #[allow(clippy::exit)]
            process::exit(INTERRUPTED);
        }
    };

    if let Err(err) = cli_result {
        let code = if json_mode {
            output_json_error(&err)
        } else {
            exit_code(&err)
        };
        #[allow(clippy::print_stderr)]
        {
            eprintln!("Error: {}", format_error(&err));
        }

        #[allow(clippy::exit)]
        process::exit(code);
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    () = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
