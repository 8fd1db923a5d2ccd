//! Local key file provider for `pgtde`.
//!
//! Keys live in an append-only flat file of fixed-width records:
//!
//! ```text
//! [name:256, NUL-terminated][data:32][length:u32]
//! ```
//!
//! Keys are never rewritten or removed. The provider takes no lock of its
//! own; callers serialize writers.

#![warn(clippy::pedantic, clippy::nursery)]

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use pgtde::error::KeyProviderError;
use pgtde::key_provider::{KeyInfo, KeyringProvider, KEY_NAME_LEN, MAX_KEY_DATA_SIZE};
use pgtde::options::FileOptions;
use tracing::debug;
use zeroize::Zeroizing;

/// Size of one key record on disk.
pub const KEY_RECORD_SIZE: usize = KEY_NAME_LEN + MAX_KEY_DATA_SIZE + 4;

const DATA_OFFSET: usize = KEY_NAME_LEN;
const LEN_OFFSET: usize = DATA_OFFSET + MAX_KEY_DATA_SIZE;

/// Key provider backed by a local file.
#[derive(Debug, Clone)]
pub struct FileKeyring {
    path: PathBuf,
}

impl FileKeyring {
    /// Creates a provider over the key file at `path`. The file is created
    /// on the first store.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates a provider from parsed provider options.
    #[must_use]
    pub fn from_options(options: &FileOptions) -> Self {
        Self::new(&options.file_name)
    }

    /// Returns the key file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scans the file for `name`, ignoring ASCII case.
    fn find(&self, file: &File, name: &str) -> Result<Option<KeyInfo>, KeyProviderError> {
        let len = file.metadata()?.len();
        let mut record = Zeroizing::new([0u8; KEY_RECORD_SIZE]);
        let mut offset = 0u64;

        while offset < len {
            if len - offset < KEY_RECORD_SIZE as u64 {
                return Err(KeyProviderError::Corrupt(format!(
                    "key file \"{}\" ends with a partial record",
                    self.path.display()
                )));
            }
            file.read_exact_at(record.as_mut_slice(), offset)?;
            offset += KEY_RECORD_SIZE as u64;

            let stored = read_name(&record[..DATA_OFFSET]);
            if !stored.eq_ignore_ascii_case(name.as_bytes()) {
                continue;
            }

            let mut raw_len = [0u8; 4];
            raw_len.copy_from_slice(&record[LEN_OFFSET..]);
            let key_len = u32::from_ne_bytes(raw_len) as usize;
            if key_len > MAX_KEY_DATA_SIZE {
                return Err(KeyProviderError::InvalidKeySize {
                    actual: key_len,
                    max: MAX_KEY_DATA_SIZE,
                });
            }

            let name = String::from_utf8_lossy(stored).into_owned();
            let data = record[DATA_OFFSET..DATA_OFFSET + key_len].to_vec();
            return KeyInfo::new(name, data).map(Some);
        }
        Ok(None)
    }
}

fn read_name(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

impl KeyringProvider for FileKeyring {
    fn get_key(&self, name: &str) -> Result<KeyInfo, KeyProviderError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(KeyProviderError::KeyNotFound(name.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        self.find(&file, name)?.ok_or_else(|| KeyProviderError::KeyNotFound(name.to_string()))
    }

    fn store_key(&self, key: &KeyInfo) -> Result<(), KeyProviderError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&self.path)?;

        if self.find(&file, key.name())?.is_some() {
            return Err(KeyProviderError::Duplicate(key.name().to_string()));
        }

        let mut record = Zeroizing::new([0u8; KEY_RECORD_SIZE]);
        record[..key.name().len()].copy_from_slice(key.name().as_bytes());
        record[DATA_OFFSET..DATA_OFFSET + key.len()].copy_from_slice(key.data());
        // KeyInfo bounds the length to MAX_KEY_DATA_SIZE.
        #[allow(clippy::cast_possible_truncation)]
        record[LEN_OFFSET..].copy_from_slice(&(key.len() as u32).to_ne_bytes());

        let offset = file.metadata()?.len();
        file.write_all_at(record.as_slice(), offset)?;
        file.sync_all()?;

        debug!(path = %self.path.display(), name = key.name(), "stored key");
        Ok(())
    }
}
