//! The `buzz` command line.
//!
//! `buzz [flags] <script> [args...]` runs a script; `-t` runs its `test`
//! blocks, `-c` checks without running, `-L` adds library search
//! directories, and `BUZZ_PATH` supplies a colon-separated import prefix.
//! Exit code 0 on success, 1 on any compile or runtime failure.

use std::{path::PathBuf, process::ExitCode};

use buzz::{Runner, StdPrint};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "buzz", disable_version_flag = true, disable_help_flag = false)]
struct Cli {
    /// Run every `test "..."` block of the script.
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Check the script without running it.
    #[arg(short = 'c', long = "check")]
    check: bool,

    /// Print the version and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Add a library search directory (repeatable).
    #[arg(short = 'L', value_name = "PATH")]
    library: Vec<PathBuf>,

    /// Script to run.
    script: Option<PathBuf>,

    /// Arguments passed to the script's `main`.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("BUZZ_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.version {
        println!("buzz {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }
    let Some(script) = cli.script else {
        eprintln!("usage: buzz [flags] <script> [args...] (see --help)");
        return ExitCode::FAILURE;
    };

    let mut runner = Runner::new();
    for path in cli.library {
        runner.add_search_path(path);
    }
    runner.set_args(cli.args);

    let source = match std::fs::read_to_string(&script) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("buzz: can't read `{}`: {err}", script.display());
            return ExitCode::FAILURE;
        }
    };

    let mut writer = StdPrint::default();
    let result = if cli.check {
        runner.check_source(&source, Some(&script))
    } else if cli.test {
        runner.run_tests(&source, Some(&script), &mut writer)
    } else {
        runner.run_source(&source, Some(&script), &mut writer)
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
