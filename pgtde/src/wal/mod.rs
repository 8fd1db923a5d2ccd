//! WAL segment layout and encrypted segment storage.
//!
//! Segments are fixed-size files of `XLOG_BLCKSZ` pages named after their
//! timeline and segment number. The first page of every segment starts
//! with a long page header that records the segment size.

pub mod crypt;
pub mod keys;
pub mod smgr;

use std::path::Path;

use crate::error::Error;

/// WAL page size.
pub const XLOG_BLCKSZ: usize = 8192;

/// Smallest valid segment size.
pub const MIN_SEGMENT_SIZE: u64 = 1 << 20;

/// Largest valid segment size.
pub const MAX_SEGMENT_SIZE: u64 = 1 << 30;

/// Segment size used when none is configured.
pub const DEFAULT_SEGMENT_SIZE: u64 = 16 << 20;

/// Length of a WAL segment file name.
pub const WAL_FILE_NAME_LEN: usize = 24;

/// `xlp_info` flag marking a long page header.
pub const XLP_LONG_HEADER: u16 = 0x0002;

/// Size of the long page header.
pub const LONG_PAGE_HEADER_SIZE: usize = 40;

/// Checks that `size` is a power of two between 1 MiB and 1 GiB.
#[must_use]
pub const fn is_valid_segment_size(size: u64) -> bool {
    size.is_power_of_two() && size >= MIN_SEGMENT_SIZE && size <= MAX_SEGMENT_SIZE
}

/// Returns `size` if it is a valid segment size.
///
/// # Errors
///
/// Returns `Error::InvalidSegmentSize` otherwise.
pub fn check_segment_size(size: u64) -> Result<u64, Error> {
    if is_valid_segment_size(size) {
        Ok(size)
    } else {
        Err(Error::InvalidSegmentSize(size))
    }
}

const fn segments_per_xlog_id(segsize: u64) -> u64 {
    0x1_0000_0000 / segsize
}

/// Formats the file name of segment `segno` on timeline `tli`.
#[must_use]
pub fn wal_file_name(tli: u32, segno: u64, segsize: u64) -> String {
    let per_id = segments_per_xlog_id(segsize);
    format!("{tli:08X}{:08X}{:08X}", segno / per_id, segno % per_id)
}

/// Checks if `name` looks like a WAL segment file name: 24 hex digits.
#[must_use]
pub fn is_wal_file_name(name: &str) -> bool {
    name.len() == WAL_FILE_NAME_LEN && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parses a segment file name into `(timeline, segno)`.
///
/// Returns `None` if the name is not a WAL segment name or its segment
/// part is out of range for `segsize`.
#[must_use]
pub fn parse_wal_file_name(name: &str, segsize: u64) -> Option<(u32, u64)> {
    if !is_wal_file_name(name) {
        return None;
    }
    let tli = u32::from_str_radix(&name[..8], 16).ok()?;
    let log = u64::from_str_radix(&name[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&name[16..], 16).ok()?;

    let per_id = segments_per_xlog_id(segsize);
    if seg >= per_id {
        return None;
    }
    Some((tli, log * per_id + seg))
}

/// Header of the first page of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongPageHeader {
    /// WAL format magic.
    pub magic: u16,
    /// Page flags; has [`XLP_LONG_HEADER`] set.
    pub info: u16,
    /// Timeline of the page.
    pub tli: u32,
    /// WAL position of the page.
    pub pageaddr: u64,
    /// Bytes of a continued record on this page.
    pub rem_len: u32,
    /// System identifier of the cluster.
    pub sysid: u64,
    /// Segment size in bytes.
    pub seg_size: u32,
    /// Page size in bytes.
    pub xlog_blcksz: u32,
}

impl LongPageHeader {
    /// Decodes the header at the start of `page` (native byte order).
    /// `source` names the segment the page came from.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupt` if `page` is shorter than the header or
    /// lacks the long header flag and `Error::InvalidSegmentSize` if the
    /// segment size is not valid.
    pub fn parse(page: &[u8], source: impl AsRef<Path>) -> Result<Self, Error> {
        if page.len() < LONG_PAGE_HEADER_SIZE {
            return Err(Error::corrupt(
                source,
                format!("first WAL page of {} bytes is too short for a long header", page.len()),
            ));
        }

        let header = Self {
            magic: u16::from_ne_bytes([page[0], page[1]]),
            info: u16::from_ne_bytes([page[2], page[3]]),
            tli: u32::from_ne_bytes(array(&page[4..8])),
            pageaddr: u64::from_ne_bytes(array(&page[8..16])),
            rem_len: u32::from_ne_bytes(array(&page[16..20])),
            sysid: u64::from_ne_bytes(array(&page[24..32])),
            seg_size: u32::from_ne_bytes(array(&page[32..36])),
            xlog_blcksz: u32::from_ne_bytes(array(&page[36..40])),
        };

        if header.info & XLP_LONG_HEADER == 0 {
            return Err(Error::corrupt(
                source,
                format!("first WAL page has no long header (xlp_info {:#06x})", header.info),
            ));
        }
        check_segment_size(u64::from(header.seg_size))?;
        Ok(header)
    }

    /// Encodes the header (native byte order).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; LONG_PAGE_HEADER_SIZE] {
        let mut bytes = [0u8; LONG_PAGE_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.magic.to_ne_bytes());
        bytes[2..4].copy_from_slice(&self.info.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.tli.to_ne_bytes());
        bytes[8..16].copy_from_slice(&self.pageaddr.to_ne_bytes());
        bytes[16..20].copy_from_slice(&self.rem_len.to_ne_bytes());
        bytes[24..32].copy_from_slice(&self.sysid.to_ne_bytes());
        bytes[32..36].copy_from_slice(&self.seg_size.to_ne_bytes());
        bytes[36..40].copy_from_slice(&self.xlog_blcksz.to_ne_bytes());
        bytes
    }

    /// Returns the segment size as recorded in the header.
    #[must_use]
    pub const fn segment_size(&self) -> u64 {
        self.seg_size as u64
    }
}

fn array<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut raw = [0u8; N];
    raw.copy_from_slice(src);
    raw
}
