//! WAL internal key file.
//!
//! Layout (native byte order):
//!
//! ```text
//! header: [magic:u32][provider_id:i32][key_name:256][check_iv:12][check_tag:16]
//! entry:  [type:u32][start_lsn:u64][base_iv:16][entry_iv:12][tag:16][key:16]
//! ```
//!
//! The header names the principal key that seals every entry; its check
//! tag authenticates the key name under that principal key so a wrong key
//! is reported before any entry is opened. Each entry holds one internal
//! key sealed with AES-GCM, authenticated together with its type, start
//! LSN and base IV.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::crypt::{BASE_IV_LEN, INTERNAL_KEY_LEN};
use crate::config::TdeConfig;
use crate::error::Error;
use crate::key_provider::{validate_key_name, KEY_NAME_LEN};
use crate::scope::ProviderId;

/// File format magic ("WEK" version 1).
pub const WAL_KEY_FILE_MAGIC: u32 = 0x014B_4557;

const ENTRY_IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Size of the file header.
pub const HEADER_SIZE: usize = 4 + 4 + KEY_NAME_LEN + ENTRY_IV_LEN + TAG_LEN;

/// Size of one key entry.
pub const ENTRY_SIZE: usize = 4 + 8 + BASE_IV_LEN + ENTRY_IV_LEN + TAG_LEN + INTERNAL_KEY_LEN;

/// What a key entry means for the WAL range it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalKeyType {
    /// WAL from `start_lsn` on is written in plaintext.
    Unencrypted,
    /// WAL from `start_lsn` on is encrypted with this key.
    Encrypted,
    /// Superseded entry; never used.
    Invalid,
}

impl WalKeyType {
    const fn as_u32(self) -> u32 {
        match self {
            Self::Unencrypted => 1,
            Self::Encrypted => 2,
            Self::Invalid => 3,
        }
    }

    const fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Unencrypted,
            2 => Self::Encrypted,
            _ => Self::Invalid,
        }
    }
}

/// Names the principal key sealing the WAL keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalKeyRef {
    /// Global provider holding the principal key.
    pub provider_id: ProviderId,
    /// Name of the key in that provider.
    pub key_name: String,
}

/// An unsealed WAL internal key.
#[derive(Clone)]
pub struct WalKey {
    kind: WalKeyType,
    start_lsn: u64,
    key: Zeroizing<[u8; INTERNAL_KEY_LEN]>,
    base_iv: [u8; BASE_IV_LEN],
}

impl WalKey {
    /// Creates a key from its parts.
    #[must_use]
    pub fn new(
        kind: WalKeyType,
        start_lsn: u64,
        key: [u8; INTERNAL_KEY_LEN],
        base_iv: [u8; BASE_IV_LEN],
    ) -> Self {
        Self { kind, start_lsn, key: Zeroizing::new(key), base_iv }
    }

    /// Returns the entry type.
    #[must_use]
    pub const fn kind(&self) -> WalKeyType {
        self.kind
    }

    /// Returns the first LSN this key applies to.
    #[must_use]
    pub const fn start_lsn(&self) -> u64 {
        self.start_lsn
    }

    /// Returns the key bytes.
    #[must_use]
    pub fn key(&self) -> &[u8; INTERNAL_KEY_LEN] {
        &self.key
    }

    /// Returns the base IV.
    #[must_use]
    pub const fn base_iv(&self) -> &[u8; BASE_IV_LEN] {
        &self.base_iv
    }

    /// Checks if WAL under this key is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.kind == WalKeyType::Encrypted
    }
}

impl std::fmt::Debug for WalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalKey")
            .field("kind", &self.kind)
            .field("start_lsn", &format_args!("{:X}/{:X}", self.start_lsn >> 32, self.start_lsn as u32))
            .finish_non_exhaustive()
    }
}

/// Returns the key governing `lsn`: the newest usable key starting at or
/// before it. `keys` must be in file order.
#[must_use]
pub fn key_for_lsn(keys: &[WalKey], lsn: u64) -> Option<&WalKey> {
    keys.iter().rev().find(|key| key.kind != WalKeyType::Invalid && key.start_lsn <= lsn)
}

enum PrincipalCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl PrincipalCipher {
    fn new(key: &[u8]) -> Result<Self, Error> {
        match key.len() {
            16 => Aes128Gcm::new_from_slice(key).map(|c| Self::Aes128(Box::new(c))),
            32 => Aes256Gcm::new_from_slice(key).map(|c| Self::Aes256(Box::new(c))),
            len => return Err(Error::Crypto(format!("principal key of {len} bytes is not supported"))),
        }
        .map_err(|e| Error::Crypto(format!("invalid principal key: {e}")))
    }

    fn seal(&self, iv: &[u8; ENTRY_IV_LEN], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = Nonce::from_slice(iv);
        let payload = Payload { msg, aad };
        match self {
            Self::Aes128(cipher) => cipher.encrypt(nonce, payload),
            Self::Aes256(cipher) => cipher.encrypt(nonce, payload),
        }
        .map_err(|e| Error::Crypto(format!("sealing failed: {e}")))
    }

    fn open(&self, iv: &[u8; ENTRY_IV_LEN], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = Nonce::from_slice(iv);
        let payload = Payload { msg, aad };
        match self {
            Self::Aes128(cipher) => cipher.decrypt(nonce, payload),
            Self::Aes256(cipher) => cipher.decrypt(nonce, payload),
        }
        .map_err(|_| Error::Crypto("authentication failed, wrong principal key?".to_string()))
    }
}

struct Header {
    principal: PrincipalKeyRef,
    check_iv: [u8; ENTRY_IV_LEN],
    check_tag: [u8; TAG_LEN],
}

impl Header {
    fn seal(principal: &PrincipalKeyRef, cipher: &PrincipalCipher) -> Result<Self, Error> {
        let mut check_iv = [0u8; ENTRY_IV_LEN];
        OsRng.fill_bytes(&mut check_iv);
        let sealed = cipher.seal(&check_iv, &[], principal.key_name.as_bytes())?;
        let mut check_tag = [0u8; TAG_LEN];
        check_tag.copy_from_slice(&sealed);
        Ok(Self { principal: principal.clone(), check_iv, check_tag })
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        let name = self.principal.key_name.as_bytes();
        let mut pos = 0;
        put(&mut bytes, &mut pos, &WAL_KEY_FILE_MAGIC.to_ne_bytes());
        put(&mut bytes, &mut pos, &self.principal.provider_id.to_signed().to_ne_bytes());
        bytes[pos..pos + name.len()].copy_from_slice(name);
        pos += KEY_NAME_LEN;
        put(&mut bytes, &mut pos, &self.check_iv);
        put(&mut bytes, &mut pos, &self.check_tag);
        bytes
    }

    fn from_bytes(bytes: &[u8; HEADER_SIZE], path: &Path) -> Result<Self, Error> {
        let mut pos = 0;
        if u32::from_ne_bytes(take(bytes, &mut pos)) != WAL_KEY_FILE_MAGIC {
            return Err(Error::corrupt(path, "bad magic"));
        }
        let provider_id = ProviderId::from_signed(i32::from_ne_bytes(take(bytes, &mut pos)))
            .ok_or_else(|| Error::corrupt(path, "principal key has no provider"))?;
        let name_field = &bytes[pos..pos + KEY_NAME_LEN];
        pos += KEY_NAME_LEN;
        let end = name_field.iter().position(|&b| b == 0).unwrap_or(KEY_NAME_LEN);
        let key_name = String::from_utf8(name_field[..end].to_vec())
            .map_err(|_| Error::corrupt(path, "principal key name is not UTF-8"))?;

        Ok(Self {
            principal: PrincipalKeyRef { provider_id, key_name },
            check_iv: take(bytes, &mut pos),
            check_tag: take(bytes, &mut pos),
        })
    }
}

fn put(dst: &mut [u8], pos: &mut usize, src: &[u8]) {
    dst[*pos..*pos + src.len()].copy_from_slice(src);
    *pos += src.len();
}

fn take<const N: usize>(src: &[u8], pos: &mut usize) -> [u8; N] {
    let mut raw = [0u8; N];
    raw.copy_from_slice(&src[*pos..*pos + N]);
    *pos += N;
    raw
}

fn entry_aad(kind: WalKeyType, start_lsn: u64, base_iv: &[u8; BASE_IV_LEN]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(4 + 8 + BASE_IV_LEN);
    aad.extend_from_slice(&kind.as_u32().to_ne_bytes());
    aad.extend_from_slice(&start_lsn.to_ne_bytes());
    aad.extend_from_slice(base_iv);
    aad
}

fn seal_entry(cipher: &PrincipalCipher, key: &WalKey) -> Result<[u8; ENTRY_SIZE], Error> {
    let mut entry_iv = [0u8; ENTRY_IV_LEN];
    OsRng.fill_bytes(&mut entry_iv);
    let sealed = Zeroizing::new(cipher.seal(
        &entry_iv,
        &key.key[..],
        &entry_aad(key.kind, key.start_lsn, &key.base_iv),
    )?);
    let (ciphertext, tag) = sealed.split_at(INTERNAL_KEY_LEN);

    let mut entry = [0u8; ENTRY_SIZE];
    let mut pos = 0;
    put(&mut entry, &mut pos, &key.kind.as_u32().to_ne_bytes());
    put(&mut entry, &mut pos, &key.start_lsn.to_ne_bytes());
    put(&mut entry, &mut pos, &key.base_iv);
    put(&mut entry, &mut pos, &entry_iv);
    put(&mut entry, &mut pos, tag);
    put(&mut entry, &mut pos, ciphertext);
    Ok(entry)
}

/// Handle on the WAL internal key file.
#[derive(Debug, Clone)]
pub struct WalKeyFile {
    path: PathBuf,
}

impl WalKeyFile {
    /// Points at the key file of `config`.
    #[must_use]
    pub fn new(config: &TdeConfig) -> Self {
        Self { path: config.wal_key_file_path() }
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checks if the key file exists, that is, if WAL encryption was ever
    /// configured.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Creates the key file with a header naming `principal`. Missing
    /// parent directories are created.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCall` if the file already exists
    /// - `Error::KeyProvider` if the key name is unusable
    /// - `Error::Crypto` if `principal_key` is not 16 or 32 bytes
    /// - `Error::Io` if the file cannot be written
    pub fn create(&self, principal: &PrincipalKeyRef, principal_key: &[u8]) -> Result<(), Error> {
        validate_key_name(&principal.key_name)?;
        let header = Header::seal(principal, &PrincipalCipher::new(principal_key)?)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = match OpenOptions::new().write(true).create_new(true).mode(0o600).open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::InvalidCall(format!(
                    "WAL key file \"{}\" already exists",
                    self.path.display()
                )))
            }
            Err(err) => return Err(Error::io(&self.path, err)),
        };
        file.write_all_at(&header.to_bytes(), 0).map_err(|e| Error::io(&self.path, e))?;
        file.sync_all().map_err(|e| Error::io(&self.path, e))?;

        info!(
            provider_id = %principal.provider_id,
            key_name = %principal.key_name,
            "created WAL key file"
        );
        Ok(())
    }

    /// Reads which principal key seals the WAL keys.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupt` on a damaged header and `Error::Io` if the
    /// file cannot be read.
    pub fn read_principal(&self) -> Result<PrincipalKeyRef, Error> {
        let file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        Ok(self.read_header(&file)?.principal)
    }

    /// Generates a new internal key starting at `start_lsn`, seals it and
    /// appends it.
    ///
    /// # Errors
    ///
    /// - `Error::Crypto` if `principal_key` does not match the header
    /// - `Error::Corrupt` or `Error::Io` on file problems
    pub fn append_key(
        &self,
        principal_key: &[u8],
        kind: WalKeyType,
        start_lsn: u64,
    ) -> Result<WalKey, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        let header = self.read_header(&file)?;
        let cipher = self.verified_cipher(&header, principal_key)?;
        let count = self.entry_count(&file)?;

        let mut key = Zeroizing::new([0u8; INTERNAL_KEY_LEN]);
        let mut base_iv = [0u8; BASE_IV_LEN];
        OsRng.fill_bytes(&mut key[..]);
        OsRng.fill_bytes(&mut base_iv);
        let key = WalKey { kind, start_lsn, key, base_iv };
        let entry = seal_entry(&cipher, &key)?;

        let offset = (HEADER_SIZE + count * ENTRY_SIZE) as u64;
        file.write_all_at(&entry, offset).map_err(|e| Error::io(&self.path, e))?;
        file.sync_all().map_err(|e| Error::io(&self.path, e))?;

        debug!(index = count, ?kind, start_lsn, "appended WAL key");
        Ok(key)
    }

    /// Opens every entry and returns the usable keys in file order.
    ///
    /// # Errors
    ///
    /// - `Error::Crypto` if `principal_key` does not match or an entry
    ///   fails authentication
    /// - `Error::Corrupt` or `Error::Io` on file problems
    pub fn load_keys(&self, principal_key: &[u8]) -> Result<Vec<WalKey>, Error> {
        let file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let header = self.read_header(&file)?;
        let cipher = self.verified_cipher(&header, principal_key)?;
        let count = self.entry_count(&file)?;

        let mut keys = Vec::with_capacity(count);
        let mut entry = [0u8; ENTRY_SIZE];
        for index in 0..count {
            let offset = (HEADER_SIZE + index * ENTRY_SIZE) as u64;
            file.read_exact_at(&mut entry, offset).map_err(|e| Error::io(&self.path, e))?;

            let mut pos = 0;
            let kind = WalKeyType::from_u32(u32::from_ne_bytes(take(&entry, &mut pos)));
            let start_lsn = u64::from_ne_bytes(take(&entry, &mut pos));
            let base_iv: [u8; BASE_IV_LEN] = take(&entry, &mut pos);
            let entry_iv: [u8; ENTRY_IV_LEN] = take(&entry, &mut pos);
            let tag: [u8; TAG_LEN] = take(&entry, &mut pos);
            let ciphertext: [u8; INTERNAL_KEY_LEN] = take(&entry, &mut pos);

            if kind == WalKeyType::Invalid {
                continue;
            }

            let mut sealed = Vec::with_capacity(INTERNAL_KEY_LEN + TAG_LEN);
            sealed.extend_from_slice(&ciphertext);
            sealed.extend_from_slice(&tag);
            let opened = Zeroizing::new(cipher.open(
                &entry_iv,
                &sealed,
                &entry_aad(kind, start_lsn, &base_iv),
            )?);

            let mut key = Zeroizing::new([0u8; INTERNAL_KEY_LEN]);
            key.copy_from_slice(&opened);
            keys.push(WalKey { kind, start_lsn, key, base_iv });
        }
        Ok(keys)
    }

    /// Reseals the header and every usable entry under a new principal key.
    ///
    /// The new file is written next to the old one and renamed over it, so
    /// a crash leaves either the old or the new file. Invalid entries are
    /// dropped.
    ///
    /// # Errors
    ///
    /// - `Error::Crypto` if `principal_key` does not match the header or
    ///   `new_key` is not 16 or 32 bytes
    /// - `Error::KeyProvider` if the new key name is unusable
    /// - `Error::Corrupt` or `Error::Io` on file problems
    pub fn rotate_principal(
        &self,
        principal_key: &[u8],
        new_principal: &PrincipalKeyRef,
        new_key: &[u8],
    ) -> Result<(), Error> {
        validate_key_name(&new_principal.key_name)?;
        let keys = self.load_keys(principal_key)?;
        let cipher = PrincipalCipher::new(new_key)?;

        let mut bytes = Vec::with_capacity(HEADER_SIZE + keys.len() * ENTRY_SIZE);
        bytes.extend_from_slice(&Header::seal(new_principal, &cipher)?.to_bytes());
        for key in &keys {
            bytes.extend_from_slice(&seal_entry(&cipher, key)?);
        }

        let mut tmp_name = OsString::from(self.path.as_os_str());
        tmp_name.push(".r");
        let tmp_path = PathBuf::from(tmp_name);
        let tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)
            .map_err(|e| Error::io(&tmp_path, e))?;
        tmp.write_all_at(&bytes, 0).map_err(|e| Error::io(&tmp_path, e))?;
        tmp.sync_all().map_err(|e| Error::io(&tmp_path, e))?;

        fs::rename(&tmp_path, &self.path).map_err(|e| Error::io(&self.path, e))?;
        if let Some(parent) = self.path.parent() {
            File::open(parent).and_then(|dir| dir.sync_all()).map_err(|e| Error::io(parent, e))?;
        }

        info!(
            provider_id = %new_principal.provider_id,
            key_name = %new_principal.key_name,
            keys = keys.len(),
            "rotated WAL principal key"
        );
        Ok(())
    }

    /// Removes a key file that holds no key entries.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCall` if any entry was ever appended
    /// - `Error::Corrupt` or `Error::Io` on file problems
    pub fn remove(&self) -> Result<(), Error> {
        let file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        self.read_header(&file)?;
        let count = self.entry_count(&file)?;
        if count > 0 {
            return Err(Error::InvalidCall(format!(
                "WAL key file \"{}\" still holds {count} keys",
                self.path.display()
            )));
        }

        fs::remove_file(&self.path).map_err(|e| Error::io(&self.path, e))?;
        info!(path = %self.path.display(), "removed WAL key file");
        Ok(())
    }

    fn read_header(&self, file: &File) -> Result<Header, Error> {
        let mut bytes = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut bytes, 0).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::corrupt(&self.path, "truncated header")
            } else {
                Error::io(&self.path, e)
            }
        })?;
        Header::from_bytes(&bytes, &self.path)
    }

    fn verified_cipher(&self, header: &Header, principal_key: &[u8]) -> Result<PrincipalCipher, Error> {
        let cipher = PrincipalCipher::new(principal_key)?;
        cipher
            .open(&header.check_iv, &header.check_tag, header.principal.key_name.as_bytes())
            .map_err(|_| {
                Error::Crypto(format!(
                    "principal key \"{}\" does not match WAL key file \"{}\"",
                    header.principal.key_name,
                    self.path.display()
                ))
            })?;
        Ok(cipher)
    }

    fn entry_count(&self, file: &File) -> Result<usize, Error> {
        let len = file.metadata().map_err(|e| Error::io(&self.path, e))?.len();
        let body = len.saturating_sub(HEADER_SIZE as u64);
        if body % ENTRY_SIZE as u64 != 0 {
            return Err(Error::corrupt(&self.path, "partial key entry"));
        }
        usize::try_from(body / ENTRY_SIZE as u64)
            .map_err(|_| Error::corrupt(&self.path, "too many key entries"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use tempfile::TempDir;

    fn principal() -> PrincipalKeyRef {
        PrincipalKeyRef {
            provider_id: ProviderId::new(Scope::Global, 1).unwrap(),
            key_name: "server-key".to_string(),
        }
    }

    fn key_file(dir: &TempDir) -> WalKeyFile {
        WalKeyFile::new(&TdeConfig::new(dir.path()))
    }

    #[test]
    fn test_layout_sizes() {
        assert_eq!(HEADER_SIZE, 292);
        assert_eq!(ENTRY_SIZE, 72);
    }

    #[test]
    fn test_create_and_read_principal() {
        let dir = TempDir::new().unwrap();
        let file = key_file(&dir);
        assert!(!file.exists());

        file.create(&principal(), &[1; 32]).unwrap();
        assert!(file.exists());
        assert_eq!(file.read_principal().unwrap(), principal());
        assert!(matches!(file.create(&principal(), &[1; 32]), Err(Error::InvalidCall(_))));
    }

    #[test]
    fn test_append_and_load() {
        let dir = TempDir::new().unwrap();
        let file = key_file(&dir);
        file.create(&principal(), &[1; 16]).unwrap();

        let first = file.append_key(&[1; 16], WalKeyType::Encrypted, 0).unwrap();
        let second = file.append_key(&[1; 16], WalKeyType::Unencrypted, 0x3000_0000).unwrap();

        let keys = file.load_keys(&[1; 16]).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key(), first.key());
        assert_eq!(keys[0].base_iv(), first.base_iv());
        assert_eq!(keys[1].start_lsn(), second.start_lsn());
        assert!(!keys[1].is_encrypted());
    }

    #[test]
    fn test_wrong_principal_key() {
        let dir = TempDir::new().unwrap();
        let file = key_file(&dir);
        file.create(&principal(), &[1; 32]).unwrap();
        file.append_key(&[1; 32], WalKeyType::Encrypted, 0).unwrap();

        assert!(matches!(file.load_keys(&[2; 32]), Err(Error::Crypto(_))));
        assert!(matches!(file.append_key(&[2; 32], WalKeyType::Encrypted, 0), Err(Error::Crypto(_))));
        assert!(matches!(file.load_keys(&[1; 20]), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_tampered_entry_fails() {
        let dir = TempDir::new().unwrap();
        let file = key_file(&dir);
        file.create(&principal(), &[1; 32]).unwrap();
        file.append_key(&[1; 32], WalKeyType::Encrypted, 0).unwrap();

        // Move the start LSN; the entry no longer authenticates.
        let mut bytes = std::fs::read(file.path()).unwrap();
        bytes[HEADER_SIZE + 4] ^= 0xFF;
        std::fs::write(file.path(), bytes).unwrap();
        assert!(matches!(file.load_keys(&[1; 32]), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_partial_entry_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let file = key_file(&dir);
        file.create(&principal(), &[1; 32]).unwrap();

        let mut bytes = std::fs::read(file.path()).unwrap();
        bytes.extend_from_slice(&[0; 5]);
        std::fs::write(file.path(), bytes).unwrap();
        assert!(matches!(file.load_keys(&[1; 32]), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_create_makes_missing_directories() {
        let dir = TempDir::new().unwrap();
        let file = WalKeyFile::new(&TdeConfig::new(dir.path().join("data/pg_tde")));

        file.create(&principal(), &[1; 32]).unwrap();
        assert_eq!(file.read_principal().unwrap(), principal());
    }

    #[test]
    fn test_rotate_principal_reseals_entries() {
        let dir = TempDir::new().unwrap();
        let file = key_file(&dir);
        file.create(&principal(), &[1; 32]).unwrap();
        let first = file.append_key(&[1; 32], WalKeyType::Encrypted, 0).unwrap();
        let second = file.append_key(&[1; 32], WalKeyType::Unencrypted, 0x100).unwrap();

        let rotated = PrincipalKeyRef {
            provider_id: ProviderId::new(Scope::Global, 2).unwrap(),
            key_name: "server-key-2".to_string(),
        };
        file.rotate_principal(&[1; 32], &rotated, &[7; 16]).unwrap();

        assert_eq!(file.read_principal().unwrap(), rotated);
        assert!(matches!(file.load_keys(&[1; 32]), Err(Error::Crypto(_))));
        let keys = file.load_keys(&[7; 16]).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key(), first.key());
        assert_eq!(keys[0].base_iv(), first.base_iv());
        assert_eq!(keys[1].start_lsn(), second.start_lsn());
        assert_eq!(keys[1].kind(), WalKeyType::Unencrypted);
        assert!(!dir.path().join("wal_keys.r").exists());
    }

    #[test]
    fn test_rotate_with_wrong_key_keeps_file() {
        let dir = TempDir::new().unwrap();
        let file = key_file(&dir);
        file.create(&principal(), &[1; 32]).unwrap();
        file.append_key(&[1; 32], WalKeyType::Encrypted, 0).unwrap();
        let before = std::fs::read(file.path()).unwrap();

        assert!(matches!(
            file.rotate_principal(&[2; 32], &principal(), &[3; 32]),
            Err(Error::Crypto(_))
        ));
        assert_eq!(std::fs::read(file.path()).unwrap(), before);
    }

    #[test]
    fn test_remove_only_without_entries() {
        let dir = TempDir::new().unwrap();
        let file = key_file(&dir);
        file.create(&principal(), &[1; 32]).unwrap();
        file.remove().unwrap();
        assert!(!file.exists());

        file.create(&principal(), &[1; 32]).unwrap();
        file.append_key(&[1; 32], WalKeyType::Encrypted, 0).unwrap();
        assert!(matches!(file.remove(), Err(Error::InvalidCall(_))));
        assert!(file.exists());
    }

    #[test]
    fn test_key_for_lsn() {
        let keys = vec![
            WalKey::new(WalKeyType::Encrypted, 0, [1; 16], [0; 16]),
            WalKey::new(WalKeyType::Invalid, 100, [2; 16], [0; 16]),
            WalKey::new(WalKeyType::Unencrypted, 200, [3; 16], [0; 16]),
        ];

        assert_eq!(key_for_lsn(&keys, 50).unwrap().key(), &[1; 16]);
        assert_eq!(key_for_lsn(&keys, 150).unwrap().key(), &[1; 16]);
        assert_eq!(key_for_lsn(&keys, 200).unwrap().kind(), WalKeyType::Unencrypted);
        assert!(key_for_lsn(&keys[2..], 10).is_none());
    }
}
