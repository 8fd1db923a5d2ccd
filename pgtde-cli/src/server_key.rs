//! Principal key of the WAL and the storage manager built on it.

use pgtde::config::TdeConfig;
use pgtde::error::Error;
use pgtde::key_provider::KeyInfo;
use pgtde::registry::Registry;
use pgtde::scope::{Oid, ProviderId, Scope, GLOBAL_DATA_TDE_OID};
use pgtde::wal::keys::{PrincipalKeyRef, WalKeyFile, WalKeyType};
use pgtde::wal::smgr::{StandardSmgr, TdeSmgr, XLogSmgr};
use tracing::info;

use crate::keyring::open_provider;

/// Length of generated principal keys.
pub const PRINCIPAL_KEY_LEN: usize = 32;

/// Builds the storage manager for the cluster at `config`.
///
/// Without a WAL key file the WAL was never encrypted and segments pass
/// through unchanged. Otherwise the principal key is fetched from its
/// global provider and the internal keys are unsealed with it.
///
/// # Errors
///
/// Returns registry, provider and key file errors.
pub fn load_smgr(config: &TdeConfig) -> Result<Box<dyn XLogSmgr>, Error> {
    let key_file = WalKeyFile::new(config);
    if !key_file.exists() {
        return Ok(Box::new(StandardSmgr));
    }

    let principal = key_file.read_principal()?;
    let keyring = Registry::new(config.clone()).get_by_id(principal.provider_id, GLOBAL_DATA_TDE_OID)?;
    let key = open_provider(&keyring)?.get_key(&principal.key_name)?;
    let keys = key_file.load_keys(key.data())?;
    Ok(Box::new(TdeSmgr::new(keys)))
}

/// Creates a principal key in the global provider `provider_name` and
/// starts WAL encryption with a first internal key at LSN 0.
///
/// # Errors
///
/// - `Error::NotFound` if there is no such global provider
/// - `Error::KeyProvider` if the key cannot be stored, for example
///   because `key_name` already exists
/// - `Error::InvalidCall` if the WAL key file already exists
pub fn set_server_key(config: &TdeConfig, provider_name: &str, key_name: &str) -> Result<ProviderId, Error> {
    let key_file = WalKeyFile::new(config);
    if key_file.exists() {
        return Err(Error::InvalidCall(format!(
            "WAL key file \"{}\" already exists",
            key_file.path().display()
        )));
    }

    let keyring = Registry::new(config.clone()).get_by_name(provider_name, GLOBAL_DATA_TDE_OID)?;
    let key = KeyInfo::generate(key_name, PRINCIPAL_KEY_LEN)?;
    open_provider(&keyring)?.store_key(&key)?;

    let principal = PrincipalKeyRef { provider_id: keyring.id(), key_name: key_name.to_string() };
    key_file.create(&principal, key.data())?;
    key_file.append_key(key.data(), WalKeyType::Encrypted, 0)?;

    info!(provider = provider_name, key_name, "server key set");
    Ok(keyring.id())
}

/// Moves the WAL keys to a new principal key created in the global
/// provider `provider_name`.
///
/// # Errors
///
/// - `Error::InvalidCall` if no server key was ever set
/// - `Error::NotFound` if either provider is missing
/// - `Error::KeyProvider` if the current key cannot be fetched or the new
///   one cannot be stored
/// - `Error::Crypto` if the current key does not unseal the WAL keys
pub fn rotate_server_key(config: &TdeConfig, provider_name: &str, key_name: &str) -> Result<ProviderId, Error> {
    let key_file = existing_key_file(config)?;
    let registry = Registry::new(config.clone());

    let current = key_file.read_principal()?;
    let current_keyring = registry.get_by_id(current.provider_id, GLOBAL_DATA_TDE_OID)?;
    let current_key = open_provider(&current_keyring)?.get_key(&current.key_name)?;
    key_file.load_keys(current_key.data())?;

    let keyring = registry.get_by_name(provider_name, GLOBAL_DATA_TDE_OID)?;
    let key = KeyInfo::generate(key_name, PRINCIPAL_KEY_LEN)?;
    open_provider(&keyring)?.store_key(&key)?;

    let principal = PrincipalKeyRef { provider_id: keyring.id(), key_name: key_name.to_string() };
    key_file.rotate_principal(current_key.data(), &principal, key.data())?;

    info!(provider = provider_name, key_name, previous = %current.key_name, "server key rotated");
    Ok(keyring.id())
}

/// Drops the server key of a cluster whose WAL key file holds no keys.
///
/// # Errors
///
/// Returns `Error::InvalidCall` if there is no server key or WAL keys
/// still depend on it.
pub fn delete_server_key(config: &TdeConfig) -> Result<(), Error> {
    existing_key_file(config)?.remove()
}

/// Deletes the provider named `name`, refusing the global provider that
/// holds the server key.
///
/// # Errors
///
/// - `Error::InvalidCall` if the provider holds the server key
/// - `Error::NotFound` if no live provider has that name
/// - `Error::Corrupt` or `Error::Io` on file problems
pub fn delete_provider(config: &TdeConfig, name: &str, db: Oid) -> Result<ProviderId, Error> {
    let registry = Registry::new(config.clone());
    let key_file = WalKeyFile::new(config);

    if Scope::from_oid(db).is_global() && key_file.exists() {
        let principal = key_file.read_principal()?;
        let in_use = registry
            .list(db)?
            .iter()
            .any(|row| row.id == principal.provider_id && row.name == name);
        if in_use {
            return Err(Error::InvalidCall(
                "Can't delete a provider which is currently in use".to_string(),
            ));
        }
    }
    registry.delete_by_name(name, db, false)
}

fn existing_key_file(config: &TdeConfig) -> Result<WalKeyFile, Error> {
    let key_file = WalKeyFile::new(config);
    if !key_file.exists() {
        return Err(Error::InvalidCall("no server key is set".to_string()));
    }
    Ok(key_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgtde::options::ProviderType;
    use pgtde::record::ProviderRecord;
    use tempfile::TempDir;

    fn add_global_file_provider(config: &TdeConfig, dir: &TempDir) {
        add_global_provider(config, dir, "global-file");
    }

    fn add_global_provider(config: &TdeConfig, dir: &TempDir, name: &str) {
        let options = format!(r#"{{"file_name":"{}"}}"#, dir.path().join(name).display());
        let record = ProviderRecord::new(name, ProviderType::File, options).unwrap();
        Registry::new(config.clone()).add(record, GLOBAL_DATA_TDE_OID, false).unwrap();
    }

    #[test]
    fn test_plain_without_key_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(load_smgr(&TdeConfig::new(temp_dir.path())).is_ok());
    }

    #[test]
    fn test_set_server_key_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let config = TdeConfig::new(temp_dir.path().join("pg_tde"));
        add_global_file_provider(&config, &temp_dir);

        let id = set_server_key(&config, "global-file", "server-key").unwrap();
        assert!(id.is_global());

        let key_file = WalKeyFile::new(&config);
        let principal = key_file.read_principal().unwrap();
        assert_eq!(principal.provider_id, id);
        assert_eq!(principal.key_name, "server-key");
        assert!(load_smgr(&config).is_ok());
    }

    #[test]
    fn test_set_server_key_twice() {
        let temp_dir = TempDir::new().unwrap();
        let config = TdeConfig::new(temp_dir.path().join("pg_tde"));
        add_global_file_provider(&config, &temp_dir);

        set_server_key(&config, "global-file", "server-key").unwrap();
        assert!(matches!(
            set_server_key(&config, "global-file", "server-key-2"),
            Err(Error::InvalidCall(_))
        ));
    }

    #[test]
    fn test_unknown_provider() {
        let temp_dir = TempDir::new().unwrap();
        let config = TdeConfig::new(temp_dir.path());
        assert!(matches!(set_server_key(&config, "nope", "k"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_rotate_server_key() {
        let temp_dir = TempDir::new().unwrap();
        let config = TdeConfig::new(temp_dir.path().join("pg_tde"));
        add_global_file_provider(&config, &temp_dir);
        add_global_provider(&config, &temp_dir, "other-file");
        set_server_key(&config, "global-file", "server-key").unwrap();

        let id = rotate_server_key(&config, "other-file", "server-key-2").unwrap();

        let principal = WalKeyFile::new(&config).read_principal().unwrap();
        assert_eq!(principal.provider_id, id);
        assert_eq!(principal.key_name, "server-key-2");
        assert!(load_smgr(&config).is_ok());

        // The old provider no longer holds the server key
        delete_provider(&config, "global-file", GLOBAL_DATA_TDE_OID).unwrap();
        assert!(matches!(
            delete_provider(&config, "other-file", GLOBAL_DATA_TDE_OID),
            Err(Error::InvalidCall(_))
        ));
    }

    #[test]
    fn test_rotate_without_server_key() {
        let temp_dir = TempDir::new().unwrap();
        let config = TdeConfig::new(temp_dir.path());
        add_global_file_provider(&config, &temp_dir);

        assert!(matches!(
            rotate_server_key(&config, "global-file", "k"),
            Err(Error::InvalidCall(_))
        ));
        assert!(matches!(delete_server_key(&config), Err(Error::InvalidCall(_))));
    }

    #[test]
    fn test_delete_provider_in_use() {
        let temp_dir = TempDir::new().unwrap();
        let config = TdeConfig::new(temp_dir.path().join("pg_tde"));
        add_global_file_provider(&config, &temp_dir);
        set_server_key(&config, "global-file", "server-key").unwrap();

        let err = delete_provider(&config, "global-file", GLOBAL_DATA_TDE_OID).unwrap_err();
        assert!(err.to_string().contains("currently in use"));
        assert!(load_smgr(&config).is_ok());

        // WAL keys depend on the server key
        assert!(matches!(delete_server_key(&config), Err(Error::InvalidCall(_))));
    }

    #[test]
    fn test_delete_database_provider_ignores_server_key() {
        let temp_dir = TempDir::new().unwrap();
        let config = TdeConfig::new(temp_dir.path().join("pg_tde"));
        add_global_file_provider(&config, &temp_dir);
        set_server_key(&config, "global-file", "server-key").unwrap();

        let options = format!(r#"{{"file_name":"{}"}}"#, temp_dir.path().join("db").display());
        let record = ProviderRecord::new("global-file", ProviderType::File, options).unwrap();
        Registry::new(config.clone()).add(record, 5, false).unwrap();

        assert!(delete_provider(&config, "global-file", 5).is_ok());
    }
}
