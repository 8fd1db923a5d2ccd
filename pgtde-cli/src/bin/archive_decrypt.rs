//! Wraps an archive command so that it archives decrypted WAL.

#![warn(clippy::pedantic, clippy::nursery)]

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use pgtde_cli::archive;
use pgtde_cli::config::{init_logging, ToolConfig};

#[derive(Parser)]
#[command(name = "pg_tde_archive_decrypt", version)]
#[command(about = "Decrypts a WAL segment and pipes it into an archive command", long_about = None)]
#[command(disable_help_flag = true)]
struct Cli {
    /// Print help
    #[arg(short = '?', long = "help", action = ArgAction::Help)]
    help: Option<bool>,

    /// Path of the WAL segment to archive (%p)
    source: PathBuf,

    /// Archive command; arguments equal to the segment path read the decrypted data
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };
    init_logging();

    match archive::run(&ToolConfig::from_env(), &cli.source, &cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pg_tde_archive_decrypt: error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
