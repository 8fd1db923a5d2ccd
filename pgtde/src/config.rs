//! Process-wide TDE configuration.

use std::path::{Path, PathBuf};

use crate::scope::Scope;

/// Default TDE directory, relative to the server data directory.
pub const DEFAULT_DATA_DIR: &str = "pg_tde";

/// File name of the WAL internal key file inside the TDE directory.
pub const WAL_KEY_FILE_NAME: &str = "wal_keys";

/// Where the TDE layer keeps its files.
///
/// The host sets this once before initializing the registry; nothing in
/// this crate reads the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdeConfig {
    data_dir: PathBuf,
}

impl TdeConfig {
    /// Creates a configuration rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    /// Returns the TDE data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the provider file for `scope`.
    #[must_use]
    pub fn provider_file_path(&self, scope: Scope) -> PathBuf {
        self.data_dir.join(scope.provider_file_name())
    }

    /// Path of the WAL internal key file.
    #[must_use]
    pub fn wal_key_file_path(&self) -> PathBuf {
        self.data_dir.join(WAL_KEY_FILE_NAME)
    }
}

impl Default for TdeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::GLOBAL_DATA_TDE_OID;

    #[test]
    fn test_provider_file_paths() {
        let config = TdeConfig::new("/data/pg_tde");
        assert_eq!(
            config.provider_file_path(Scope::Database(5)),
            PathBuf::from("/data/pg_tde/pg_tde_5_keyring")
        );
        assert_eq!(
            config.provider_file_path(Scope::Global),
            PathBuf::from(format!("/data/pg_tde/pg_tde_{GLOBAL_DATA_TDE_OID}_keyring"))
        );
    }

    #[test]
    fn test_default_is_relative() {
        assert_eq!(TdeConfig::default().data_dir(), Path::new("pg_tde"));
    }
}
