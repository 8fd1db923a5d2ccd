//! Tool configuration from the environment.

use std::path::PathBuf;

use pgtde::config::TdeConfig;
use tracing_subscriber::EnvFilter;

/// Overrides the TDE data directory.
pub const DATA_DIR_ENV: &str = "PG_TDE_DATA_DIR";

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Settings shared by the tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    /// Where providers and WAL keys live.
    pub tde: TdeConfig,
}

impl ToolConfig {
    /// Reads `PG_TDE_DATA_DIR`, falling back to `pg_tde` relative to the
    /// working directory (the server data directory for archive and
    /// restore commands).
    #[must_use]
    pub fn from_env() -> Self {
        let tde = std::env::var_os(DATA_DIR_ENV)
            .filter(|dir| !dir.is_empty())
            .map_or_else(TdeConfig::default, |dir| TdeConfig::new(PathBuf::from(dir)));
        Self { tde }
    }
}

/// Installs the stderr log subscriber; stdout carries data and listings.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
