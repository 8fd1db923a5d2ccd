//! Redo records for provider file writes.
//!
//! Every registry write in a running server is preceded by a redo record
//! in the host's write-ahead log. Replaying the record rewrites the provider
//! record at exactly the logged offset, so replay is idempotent.

use crate::error::Error;
use crate::record::{ProviderRecord, RECORD_SIZE};
use crate::scope::Oid;

/// Size of an encoded redo record.
pub const REDO_RECORD_SIZE: usize = 4 + 8 + RECORD_SIZE;

/// A provider record write, as carried in the host WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyProviderRedo {
    /// Database whose provider file was written.
    pub database_id: Oid,
    /// Byte offset of the record in the provider file.
    pub offset_in_file: u64,
    /// Record written at that offset.
    pub record: ProviderRecord,
}

impl KeyProviderRedo {
    /// Encodes the redo record.
    ///
    /// Format: `[database_id:i32][offset_in_file:i64][record:1160]`, native
    /// byte order.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(REDO_RECORD_SIZE);
        // Oids travel as the host's signed 32-bit field.
        bytes.extend_from_slice(&(self.database_id as i32).to_ne_bytes());
        bytes.extend_from_slice(&(self.offset_in_file as i64).to_ne_bytes());
        bytes.extend_from_slice(&self.record.to_bytes());
        bytes
    }

    /// Decodes a redo record.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidCall` if the payload has the wrong size or a
    /// negative or unaligned offset.
    #[allow(clippy::cast_sign_loss)]
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() != REDO_RECORD_SIZE {
            return Err(Error::InvalidCall(format!(
                "key provider redo record has {} bytes, expected {REDO_RECORD_SIZE}",
                data.len()
            )));
        }

        let mut db = [0u8; 4];
        db.copy_from_slice(&data[..4]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&data[4..12]);
        let mut record = [0u8; RECORD_SIZE];
        record.copy_from_slice(&data[12..]);

        let offset = i64::from_ne_bytes(offset);
        if offset < 0 || offset as u64 % RECORD_SIZE as u64 != 0 {
            return Err(Error::InvalidCall(format!("invalid provider record offset {offset}")));
        }

        Ok(Self {
            database_id: i32::from_ne_bytes(db) as u32,
            offset_in_file: offset as u64,
            record: ProviderRecord::from_bytes(&record),
        })
    }
}

/// Receives redo records from the registry.
///
/// The host implements this to append records to its WAL. Returning from
/// `log_key_provider_write` means the record is in the log; the registry
/// only writes the provider file afterwards.
pub trait XLogSink: Send + Sync {
    /// Appends a provider write to the log.
    ///
    /// # Errors
    ///
    /// Any error aborts the registry write before the file is touched.
    fn log_key_provider_write(&self, redo: &KeyProviderRedo) -> Result<(), Error>;
}
