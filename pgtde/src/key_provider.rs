//! Key provider abstraction.

use std::fmt;

use aes_gcm::aead::{rand_core::RngCore, OsRng};
use secrecy::{ExposeSecret, SecretVec};

use crate::error::KeyProviderError;

/// Size of the key name field, including the terminating NUL.
pub const KEY_NAME_LEN: usize = 256;

/// Longest key name in bytes.
pub const MAX_KEY_NAME_LEN: usize = KEY_NAME_LEN - 1;

/// Largest key a provider can hand out (256-bit symmetric keys).
pub const MAX_KEY_DATA_SIZE: usize = 32;

/// A named symmetric key.
pub struct KeyInfo {
    name: String,
    data: SecretVec<u8>,
}

impl KeyInfo {
    /// Creates a key from its name and raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::InvalidConfig` if the name is empty or too
    /// long, and `KeyProviderError::InvalidKeySize` if the key is empty or
    /// longer than [`MAX_KEY_DATA_SIZE`].
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Result<Self, KeyProviderError> {
        let name = name.into();
        validate_key_name(&name)?;
        if data.is_empty() || data.len() > MAX_KEY_DATA_SIZE {
            let actual = data.len();
            drop(SecretVec::new(data));
            return Err(KeyProviderError::InvalidKeySize { actual, max: MAX_KEY_DATA_SIZE });
        }
        Ok(Self { name, data: SecretVec::new(data) })
    }

    /// Generates a random key of `len` bytes.
    ///
    /// # Errors
    ///
    /// Same as [`KeyInfo::new`].
    pub fn generate(name: impl Into<String>, len: usize) -> Result<Self, KeyProviderError> {
        let mut data = vec![0u8; len];
        OsRng.fill_bytes(&mut data);
        Self::new(name, data)
    }

    /// Returns the key name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the key bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.expose_secret()
    }

    /// Returns the key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.expose_secret().len()
    }

    /// Always false; keys are never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.expose_secret().is_empty()
    }
}

impl fmt::Debug for KeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyInfo").field("name", &self.name).field("len", &self.len()).finish()
    }
}

/// Checks that `name` fits the on-disk key name field.
///
/// # Errors
///
/// Returns `KeyProviderError::InvalidConfig` if the name is empty, too long
/// or contains NUL.
pub fn validate_key_name(name: &str) -> Result<(), KeyProviderError> {
    if name.is_empty() {
        return Err(KeyProviderError::InvalidConfig("key name is empty".to_string()));
    }
    if name.len() > MAX_KEY_NAME_LEN {
        return Err(KeyProviderError::InvalidConfig(format!(
            "key name is too long (maximum is {MAX_KEY_NAME_LEN} bytes)"
        )));
    }
    if name.contains('\0') {
        return Err(KeyProviderError::InvalidConfig("key name contains NUL".to_string()));
    }
    Ok(())
}

/// Stores and retrieves named symmetric keys.
///
/// Implementations hold no lock of the registry and keep no shared mutable
/// state between calls; callers serialize writes externally.
///
/// # Example
///
/// ```rust,ignore
/// use pgtde::key_provider::{KeyInfo, KeyringProvider};
///
/// fn rotate(provider: &dyn KeyringProvider) -> Result<KeyInfo, KeyProviderError> {
///     let key = KeyInfo::generate("principal-2", 32)?;
///     provider.store_key(&key)?;
///     provider.get_key("principal-2")
/// }
/// ```
pub trait KeyringProvider: Send + Sync {
    /// Fetches the key called `name`.
    ///
    /// # Errors
    ///
    /// - `KeyProviderError::KeyNotFound` if no such key exists
    /// - `KeyProviderError::Corrupt` if the backend holds a damaged key
    /// - `KeyProviderError::InvalidKeySize` if the key is too large
    /// - `KeyProviderError::Backend` on transient or remote failures
    fn get_key(&self, name: &str) -> Result<KeyInfo, KeyProviderError>;

    /// Stores `key` under its name.
    ///
    /// # Errors
    ///
    /// - `KeyProviderError::Duplicate` if the name is taken
    /// - `KeyProviderError::Backend` or `KeyProviderError::Io` on failure
    fn store_key(&self, key: &KeyInfo) -> Result<(), KeyProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_size_limits() {
        assert!(KeyInfo::new("k", vec![1; MAX_KEY_DATA_SIZE]).is_ok());
        assert!(matches!(
            KeyInfo::new("k", vec![1; MAX_KEY_DATA_SIZE + 1]),
            Err(KeyProviderError::InvalidKeySize { actual: 33, max: 32 })
        ));
        assert!(KeyInfo::new("k", Vec::new()).is_err());
    }

    #[test]
    fn test_key_name_limits() {
        assert!(KeyInfo::new("n".repeat(MAX_KEY_NAME_LEN), vec![1; 16]).is_ok());
        assert!(KeyInfo::new("n".repeat(KEY_NAME_LEN), vec![1; 16]).is_err());
        assert!(KeyInfo::new("", vec![1; 16]).is_err());
    }

    #[test]
    fn test_generate_is_random() {
        let a = KeyInfo::generate("a", 32).unwrap();
        let b = KeyInfo::generate("b", 32).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a.data(), b.data());
    }

    #[test]
    fn test_debug_hides_key() {
        let key = KeyInfo::new("secret", vec![0xAB; 16]).unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("secret"));
        assert!(!debug.contains("171"));
    }
}
