//! Provider dispatch.

use pgtde::error::KeyProviderError;
use pgtde::key_provider::KeyringProvider;
use pgtde::options::{Keyring, ProviderOptions};
use pgtde_key_file::FileKeyring;
use pgtde_kmip::KmipKeyring;
use pgtde_vault::VaultV2Keyring;

/// Builds the provider backend described by `keyring`.
///
/// # Errors
///
/// Returns `KeyProviderError::InvalidConfig` if the backend cannot be set
/// up from the stored options (unreadable certificates, bad URL).
pub fn open_provider(keyring: &Keyring) -> Result<Box<dyn KeyringProvider>, KeyProviderError> {
    Ok(match keyring.options() {
        ProviderOptions::File(options) => Box::new(FileKeyring::from_options(options)),
        ProviderOptions::VaultV2(options) => Box::new(VaultV2Keyring::new(options)?),
        ProviderOptions::Kmip(options) => Box::new(KmipKeyring::new(options)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgtde::key_provider::KeyInfo;
    use pgtde::options::ProviderType;
    use pgtde::record::ProviderRecord;
    use tempfile::TempDir;

    #[test]
    fn test_file_provider_dispatch() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys");
        let options = format!(r#"{{"file_name":"{}"}}"#, path.display());
        let record = ProviderRecord::new("kr", ProviderType::File, options).unwrap().with_provider_id(1);
        let keyring = Keyring::load_from_record(&record).unwrap();

        let provider = open_provider(&keyring).unwrap();
        provider.store_key(&KeyInfo::new("k1", vec![3; 16]).unwrap()).unwrap();
        assert_eq!(provider.get_key("k1").unwrap().data(), &[3; 16]);
        assert!(path.exists());
    }

    #[test]
    fn test_kmip_bad_certificates() {
        let options = r#"{"host":"localhost","port":5696,"ca_path":"/nonexistent/ca.pem","cert_path":"/nonexistent/c.pem"}"#;
        let record = ProviderRecord::new("kr", ProviderType::Kmip, options).unwrap().with_provider_id(1);
        let keyring = Keyring::load_from_record(&record).unwrap();
        assert!(matches!(open_provider(&keyring), Err(KeyProviderError::InvalidConfig(_))));
    }
}
