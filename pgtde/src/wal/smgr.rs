//! WAL segment storage managers.
//!
//! WAL readers and writers go through an [`XLogSmgr`] rather than raw
//! positional I/O, so the TDE layer can encrypt segments on their way to
//! disk and decrypt them on their way back.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use super::crypt::crypt_segment;
use super::keys::{key_for_lsn, WalKey, WalKeyType};

/// Positional segment I/O.
///
/// `offset` is relative to the start of segment `segno` on timeline `tli`;
/// `segsize` is the segment size of the cluster.
pub trait XLogSmgr: Send + Sync {
    /// Reads into `buf` until it is full or the file ends and returns the
    /// number of bytes read.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn seg_read(
        &self,
        file: &File,
        buf: &mut [u8],
        offset: u64,
        tli: u32,
        segno: u64,
        segsize: u64,
    ) -> io::Result<usize>;

    /// Writes all of `buf` and returns its length.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn seg_write(
        &self,
        file: &File,
        buf: &[u8],
        offset: u64,
        tli: u32,
        segno: u64,
        segsize: u64,
    ) -> io::Result<usize>;
}

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(done)
}

/// Plain positional I/O.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardSmgr;

impl XLogSmgr for StandardSmgr {
    fn seg_read(
        &self,
        file: &File,
        buf: &mut [u8],
        offset: u64,
        _tli: u32,
        _segno: u64,
        _segsize: u64,
    ) -> io::Result<usize> {
        read_full_at(file, buf, offset)
    }

    fn seg_write(
        &self,
        file: &File,
        buf: &[u8],
        offset: u64,
        _tli: u32,
        _segno: u64,
        _segsize: u64,
    ) -> io::Result<usize> {
        file.write_all_at(buf, offset)?;
        Ok(buf.len())
    }
}

/// Encrypting storage manager.
///
/// Every byte is processed with the internal key governing its LSN;
/// bytes under an `Unencrypted` key or before the first key pass through.
#[derive(Debug, Clone)]
pub struct TdeSmgr {
    keys: Vec<WalKey>,
}

impl TdeSmgr {
    /// Creates a storage manager over `keys`, in key file order.
    #[must_use]
    pub fn new(keys: Vec<WalKey>) -> Self {
        Self { keys }
    }

    /// Returns the keys in use.
    #[must_use]
    pub fn keys(&self) -> &[WalKey] {
        &self.keys
    }

    /// Fails with `InvalidInput` when the byte range does not map to an LSN.
    fn crypt(
        &self,
        data: &mut [u8],
        offset: u64,
        tli: u32,
        segno: u64,
        segsize: u64,
    ) -> io::Result<()> {
        let start = segno
            .checked_mul(segsize)
            .and_then(|base| base.checked_add(offset))
            .filter(|start| start.checked_add(data.len() as u64).is_some())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "segment {segno} of {segsize} bytes at offset {offset} is beyond the last LSN"
                    ),
                )
            })?;
        let mut done = 0usize;

        while done < data.len() {
            let lsn = start + done as u64;
            let next_start = self
                .keys
                .iter()
                .filter(|key| key.kind() != WalKeyType::Invalid && key.start_lsn() > lsn)
                .map(WalKey::start_lsn)
                .min();
            let run_end = next_start.map_or(data.len(), |next| {
                usize::try_from(next - start).map_or(data.len(), |end| end.min(data.len()))
            });

            if let Some(key) = key_for_lsn(&self.keys, lsn).filter(|key| key.is_encrypted()) {
                crypt_segment(
                    key.key(),
                    key.base_iv(),
                    tli,
                    segno,
                    offset + done as u64,
                    &mut data[done..run_end],
                );
            }
            done = run_end;
        }
        Ok(())
    }
}

impl XLogSmgr for TdeSmgr {
    fn seg_read(
        &self,
        file: &File,
        buf: &mut [u8],
        offset: u64,
        tli: u32,
        segno: u64,
        segsize: u64,
    ) -> io::Result<usize> {
        let n = read_full_at(file, buf, offset)?;
        self.crypt(&mut buf[..n], offset, tli, segno, segsize)?;
        Ok(n)
    }

    fn seg_write(
        &self,
        file: &File,
        buf: &[u8],
        offset: u64,
        tli: u32,
        segno: u64,
        segsize: u64,
    ) -> io::Result<usize> {
        let mut data = buf.to_vec();
        self.crypt(&mut data, offset, tli, segno, segsize)?;
        file.write_all_at(&data, offset)?;
        Ok(data.len())
    }
}
