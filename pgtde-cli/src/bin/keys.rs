//! Offline key provider administration.

#![warn(clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pgtde::prelude::*;
use pgtde_cli::config::{init_logging, ToolConfig};
use pgtde_cli::server_key::{delete_provider, delete_server_key, rotate_server_key, set_server_key};

#[derive(Parser)]
#[command(name = "pg_tde_keys", version)]
#[command(about = "Manage pg_tde key providers", long_about = None)]
struct Cli {
    /// TDE data directory [default: $PG_TDE_DATA_DIR or ./pg_tde]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Target {
    /// Use the global provider file
    #[arg(long)]
    global: bool,

    /// Use the provider file of a database
    #[arg(long)]
    db: Option<Oid>,
}

impl Target {
    fn oid(&self) -> Oid {
        self.db.filter(|_| !self.global).unwrap_or(GLOBAL_DATA_TDE_OID)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Add a key provider
    Add {
        #[command(flatten)]
        target: Target,
        /// Provider name
        name: String,
        /// Provider type: file, vault-v2 or kmip
        provider_type: String,
        /// Provider options as JSON
        options: String,
    },
    /// Replace the options of a key provider
    Change {
        #[command(flatten)]
        target: Target,
        /// Provider name
        name: String,
        /// Provider type: file, vault-v2 or kmip
        provider_type: String,
        /// Provider options as JSON
        options: String,
    },
    /// Delete a key provider
    Delete {
        #[command(flatten)]
        target: Target,
        /// Provider name
        name: String,
    },
    /// List key providers
    List {
        #[command(flatten)]
        target: Target,
    },
    /// Create the server key in a global provider and enable WAL encryption
    SetServerKey {
        /// Global provider name
        provider: String,
        /// Name of the new key
        key_name: String,
    },
    /// Reseal the WAL keys with a new server key in a global provider
    RotateServerKey {
        /// Global provider name
        provider: String,
        /// Name of the new key
        key_name: String,
    },
    /// Remove a server key that no WAL key depends on
    DeleteServerKey,
}

fn record(name: String, provider_type: &str, options: String) -> Result<ProviderRecord> {
    Ok(ProviderRecord::new(name, ProviderType::from_name(provider_type), options)?)
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.data_dir.map_or_else(|| ToolConfig::from_env().tde, TdeConfig::new);
    let registry = Registry::new(config.clone());

    match cli.command {
        Commands::Add { target, name, provider_type, options } => {
            let id = registry
                .add(record(name.clone(), &provider_type, options)?, target.oid(), false)
                .with_context(|| format!("could not add key provider \"{name}\""))?;
            println!("{id}");
        }
        Commands::Change { target, name, provider_type, options } => {
            registry
                .modify(record(name.clone(), &provider_type, options)?, target.oid(), false)
                .with_context(|| format!("could not change key provider \"{name}\""))?;
        }
        Commands::Delete { target, name } => {
            delete_provider(&config, &name, target.oid())
                .with_context(|| format!("could not delete key provider \"{name}\""))?;
        }
        Commands::List { target } => {
            for row in registry.list(target.oid()).context("could not list key providers")? {
                println!("{}\t{}\t{}\t{}", row.id, row.name, row.type_name, row.options);
            }
        }
        Commands::SetServerKey { provider, key_name } => {
            set_server_key(&config, &provider, &key_name)
                .with_context(|| format!("could not set server key \"{key_name}\""))?;
        }
        Commands::RotateServerKey { provider, key_name } => {
            rotate_server_key(&config, &provider, &key_name)
                .with_context(|| format!("could not rotate server key to \"{key_name}\""))?;
        }
        Commands::DeleteServerKey => {
            delete_server_key(&config).context("could not delete server key")?;
        }
    }
    Ok(())
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pg_tde_keys: error: {err:#}");
            std::process::ExitCode::FAILURE
        }
    }
}
