//! Encrypting restore pipe.
//!
//! `pg_tde_restore_encrypt %f %p <restore_command...>` runs the restore
//! command with every `%p` argument replaced by `<tmp>/%f`, a symlink to
//! `/dev/stdout`, and encrypts what the command writes into `%p`.

use std::ffi::{OsStr, OsString};
use std::fs::OpenOptions;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use pgtde::wal::smgr::XLogSmgr;
use pgtde::wal::{is_wal_file_name, parse_wal_file_name, LongPageHeader, XLOG_BLCKSZ};
use tracing::{debug, info};

use crate::config::ToolConfig;
use crate::pipe::{self, read_block, ChildGuard, StreamLink};
use crate::server_key::load_smgr;

/// Restores segment `file_name` into `dest` through `command`.
///
/// If `file_name` is not a WAL segment name, `command` is executed
/// unchanged in place of this process.
///
/// # Errors
///
/// Fails on an invalid segment, a key or I/O problem, or if the command
/// fails.
pub fn run(config: &ToolConfig, file_name: &OsStr, dest: &Path, command: &[OsString]) -> Result<()> {
    let Some(seg_name) = file_name.to_str().filter(|name| is_wal_file_name(name)) else {
        debug!(file_name = %file_name.to_string_lossy(), "not a WAL segment, running command as is");
        return Err(pipe::exec(command));
    };

    let smgr = load_smgr(&config.tde).context("could not initialize WAL encryption")?;
    let link = StreamLink::create(file_name, Path::new("/dev/stdout"))?;
    let command = pipe::substitute(command, dest, link.path());

    let result = restore_through(smgr.as_ref(), seg_name, dest, &command);
    link.remove();
    result
}

fn restore_through(smgr: &dyn XLogSmgr, seg_name: &str, dest: &Path, command: &[OsString]) -> Result<()> {
    let mut child = ChildGuard::spawn(command, Stdio::null(), Stdio::piped())?;
    let stdout = child.take_stdout()?;
    let written = encrypt_segment(smgr, seg_name, dest, stdout)?;
    child.finish()?;
    info!(dest = %dest.display(), bytes = written, "restored WAL segment");
    Ok(())
}

/// Writes the segment read from `input` into `dest` through `smgr` and
/// returns the number of bytes written.
///
/// The segment size is taken from the plaintext long page header of the
/// first page; `dest` is not touched unless it is valid.
///
/// # Errors
///
/// Returns `Error::InvalidSegmentSize` for a bad header and I/O errors of
/// `input` or `dest`.
pub fn encrypt_segment(smgr: &dyn XLogSmgr, seg_name: &str, dest: &Path, mut input: impl Read) -> Result<u64> {
    let mut buf = vec![0u8; XLOG_BLCKSZ];
    let n = read_block(&mut input, &mut buf).context("could not read from restore command")?;
    let header = LongPageHeader::parse(&buf[..n], seg_name).context("could not read the first WAL page")?;
    let segsize = header.segment_size();
    let (tli, segno) = parse_wal_file_name(seg_name, segsize)
        .with_context(|| format!("invalid WAL file name \"{seg_name}\""))?;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(dest)
        .with_context(|| format!("could not open \"{}\"", dest.display()))?;
    let write_err = || format!("could not write \"{}\"", dest.display());

    smgr.seg_write(&file, &buf[..n], 0, tli, segno, segsize).with_context(write_err)?;
    let mut offset = n as u64;
    loop {
        let n = read_block(&mut input, &mut buf).context("could not read from restore command")?;
        if n == 0 {
            break;
        }
        smgr.seg_write(&file, &buf[..n], offset, tli, segno, segsize).with_context(write_err)?;
        offset += n as u64;
    }
    file.sync_all().with_context(write_err)?;
    Ok(offset)
}
