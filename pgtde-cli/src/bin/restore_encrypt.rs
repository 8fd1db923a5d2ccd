//! Wraps a restore command so that restored WAL is written encrypted.

#![warn(clippy::pedantic, clippy::nursery)]

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use pgtde_cli::config::{init_logging, ToolConfig};
use pgtde_cli::restore;

#[derive(Parser)]
#[command(name = "pg_tde_restore_encrypt", version)]
#[command(about = "Encrypts a WAL segment produced by a restore command", long_about = None)]
#[command(disable_help_flag = true)]
struct Cli {
    /// Print help
    #[arg(short = '?', long = "help", action = ArgAction::Help)]
    help: Option<bool>,

    /// File name of the WAL segment to restore (%f)
    file_name: OsString,

    /// Destination path of the segment (%p)
    dest: PathBuf,

    /// Restore command; arguments equal to the destination write the plaintext data
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

    match restore::run(&ToolConfig::from_env(), &cli.file_name, &cli.dest, &cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pg_tde_restore_encrypt: error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
