//! Fixed-width provider records.
//!
//! A provider file is a plain array of records, no header:
//!
//! ```text
//! [provider_id:i32][provider_name:128, NUL-terminated][options:1024, NUL-terminated][provider_type:i32]
//! ```
//!
//! Integers are in native byte order; the file belongs to one installation
//! and is not meant to be portable.

use crate::error::Error;
use crate::options::ProviderType;

/// Size of the name field, including the terminating NUL.
pub const PROVIDER_NAME_LEN: usize = 128;

/// Longest provider name in bytes.
pub const MAX_PROVIDER_NAME_LEN: usize = PROVIDER_NAME_LEN - 1;

/// Size of the options field, including the terminating NUL.
pub const PROVIDER_OPTIONS_LEN: usize = 1024;

/// Longest options blob in bytes.
pub const MAX_OPTIONS_LEN: usize = PROVIDER_OPTIONS_LEN - 1;

/// Size of one record on disk.
pub const RECORD_SIZE: usize = 4 + PROVIDER_NAME_LEN + PROVIDER_OPTIONS_LEN + 4;

const NAME_OFFSET: usize = 4;
const OPTIONS_OFFSET: usize = NAME_OFFSET + PROVIDER_NAME_LEN;
const TYPE_OFFSET: usize = OPTIONS_OFFSET + PROVIDER_OPTIONS_LEN;

/// One provider as stored in a provider file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    provider_id: i32,
    name: String,
    options: String,
    provider_type: ProviderType,
}

impl ProviderRecord {
    /// Creates an unassigned record (id `0`) for add or modify.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidOptions` if the name is empty or contains NUL
    /// or if the options do not fit, and `Error::NameTooLong` if the name
    /// does not fit.
    pub fn new(
        name: impl Into<String>,
        provider_type: ProviderType,
        options: impl Into<String>,
    ) -> Result<Self, Error> {
        let name = name.into();
        let options = options.into();

        if name.is_empty() {
            return Err(Error::InvalidOptions("provider name \"\" is too short".to_string()));
        }
        if name.len() > MAX_PROVIDER_NAME_LEN {
            return Err(Error::NameTooLong { name, max: MAX_PROVIDER_NAME_LEN });
        }
        if name.contains('\0') {
            return Err(Error::InvalidOptions("provider name contains NUL".to_string()));
        }
        if options.len() > MAX_OPTIONS_LEN {
            return Err(Error::InvalidOptions(format!(
                "too large provider options, maximum size is {MAX_OPTIONS_LEN} bytes"
            )));
        }
        if options.contains('\0') {
            return Err(Error::InvalidOptions("provider options contain NUL".to_string()));
        }

        Ok(Self { provider_id: 0, name, options, provider_type })
    }

    /// Returns the signed on-disk provider id.
    #[must_use]
    pub const fn provider_id(&self) -> i32 {
        self.provider_id
    }

    /// Returns the provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the raw options blob.
    #[must_use]
    pub fn options(&self) -> &str {
        &self.options
    }

    /// Returns the provider type.
    #[must_use]
    pub const fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    /// Checks if this record marks a deleted provider.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.provider_type == ProviderType::Unknown
    }

    /// Sets the signed on-disk provider id.
    #[must_use]
    pub const fn with_provider_id(mut self, provider_id: i32) -> Self {
        self.provider_id = provider_id;
        self
    }

    /// Returns the tombstone of this record: same id and name, no type,
    /// no options.
    #[must_use]
    pub fn tombstone(&self) -> Self {
        Self {
            provider_id: self.provider_id,
            name: self.name.clone(),
            options: String::new(),
            provider_type: ProviderType::Unknown,
        }
    }

    /// Serializes the record into its fixed-width form. Unused bytes are zero.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];

        bytes[..NAME_OFFSET].copy_from_slice(&self.provider_id.to_ne_bytes());
        // Lengths were bounded by `new`; truncation only guards decoded input.
        copy_field(&mut bytes[NAME_OFFSET..OPTIONS_OFFSET], self.name.as_bytes());
        copy_field(&mut bytes[OPTIONS_OFFSET..TYPE_OFFSET], self.options.as_bytes());
        bytes[TYPE_OFFSET..].copy_from_slice(&self.provider_type.as_i32().to_ne_bytes());

        bytes
    }

    /// Decodes a record from its fixed-width form.
    ///
    /// Text fields end at the first NUL; invalid UTF-8 is replaced rather
    /// than rejected so that damaged names can still be listed and deleted.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        let provider_id = i32::from_ne_bytes(read_i32(&bytes[..NAME_OFFSET]));
        let name = read_field(&bytes[NAME_OFFSET..OPTIONS_OFFSET]);
        let options = read_field(&bytes[OPTIONS_OFFSET..TYPE_OFFSET]);
        let provider_type = ProviderType::from_i32(i32::from_ne_bytes(read_i32(&bytes[TYPE_OFFSET..])));

        Self { provider_id, name, options, provider_type }
    }
}

fn copy_field(dst: &mut [u8], src: &[u8]) {
    let len = src.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&src[..len]);
}

fn read_field(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

fn read_i32(src: &[u8]) -> [u8; 4] {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&src[..4]);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_record_size() {
        assert_eq!(RECORD_SIZE, 1160);
    }

    #[test]
    fn test_name_boundaries() {
        let longest = "n".repeat(MAX_PROVIDER_NAME_LEN);
        assert!(ProviderRecord::new(longest, ProviderType::File, "{}").is_ok());

        let too_long = "n".repeat(MAX_PROVIDER_NAME_LEN + 1);
        let err = ProviderRecord::new(too_long, ProviderType::File, "{}").unwrap_err();
        assert!(matches!(err, Error::NameTooLong { max: 127, .. }));

        let err = ProviderRecord::new("", ProviderType::File, "{}").unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn test_options_boundaries() {
        assert!(ProviderRecord::new("kr", ProviderType::File, "o".repeat(MAX_OPTIONS_LEN)).is_ok());
        let err =
            ProviderRecord::new("kr", ProviderType::File, "o".repeat(MAX_OPTIONS_LEN + 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn test_layout() {
        let record = ProviderRecord::new("kr1", ProviderType::Kmip, r#"{"a":1}"#)
            .unwrap()
            .with_provider_id(-2);
        let bytes = record.to_bytes();

        assert_eq!(&bytes[..4], &(-2i32).to_ne_bytes());
        assert_eq!(&bytes[4..8], b"kr1\0");
        assert_eq!(&bytes[OPTIONS_OFFSET..OPTIONS_OFFSET + 7], br#"{"a":1}"#);
        assert_eq!(&bytes[TYPE_OFFSET..], &3i32.to_ne_bytes());
        assert!(bytes[OPTIONS_OFFSET + 7..TYPE_OFFSET].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tombstone_keeps_id_and_name() {
        let record = ProviderRecord::new("kr1", ProviderType::File, r#"{"file_name":"/k"}"#)
            .unwrap()
            .with_provider_id(4);
        let tombstone = ProviderRecord::from_bytes(&record.tombstone().to_bytes());

        assert!(tombstone.is_tombstone());
        assert_eq!(tombstone.provider_id(), 4);
        assert_eq!(tombstone.name(), "kr1");
        assert_eq!(tombstone.options(), "");
    }

    #[test]
    fn test_unrecognized_type_decodes_as_tombstone() {
        let mut bytes = ProviderRecord::new("kr1", ProviderType::File, "{}").unwrap().to_bytes();
        bytes[TYPE_OFFSET..].copy_from_slice(&42i32.to_ne_bytes());
        assert!(ProviderRecord::from_bytes(&bytes).is_tombstone());
    }

    proptest! {
        #[test]
        fn prop_record_round_trip(
            id in any::<i32>(),
            name in "[a-zA-Z0-9_-]{1,127}",
            options in "[ -~]{0,1023}",
            tag in 0i32..4,
        ) {
            let record = ProviderRecord::new(name, ProviderType::from_i32(tag), options)
                .unwrap()
                .with_provider_id(id);
            prop_assert_eq!(ProviderRecord::from_bytes(&record.to_bytes()), record);
        }
    }
}
