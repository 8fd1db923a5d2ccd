//! Decrypting archive pipe.
//!
//! `pg_tde_archive_decrypt %p <archive_command...>` runs the archive
//! command with every `%p` argument replaced by `<tmp>/<segment>`, a
//! symlink to `/dev/stdin`, and writes the decrypted segment to the
//! command's stdin.

use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use pgtde::error::Error;
use pgtde::wal::smgr::XLogSmgr;
use pgtde::wal::{check_segment_size, is_wal_file_name, parse_wal_file_name, LongPageHeader, XLOG_BLCKSZ};
use tracing::{debug, info};

use crate::config::ToolConfig;
use crate::pipe::{self, ChildGuard, StreamLink};
use crate::server_key::load_smgr;

/// Archives `source` through `command`.
///
/// If the file name of `source` is not a WAL segment name, `command` is
/// executed unchanged in place of this process.
///
/// # Errors
///
/// Fails on an invalid segment, a key or I/O problem, or if the command
/// fails.
pub fn run(config: &ToolConfig, source: &Path, command: &[OsString]) -> Result<()> {
    let Some(seg_name) = source.file_name().filter(|name| name.to_str().is_some_and(is_wal_file_name)) else {
        debug!(source = %source.display(), "not a WAL segment, running command as is");
        return Err(pipe::exec(command));
    };

    let smgr = load_smgr(&config.tde).context("could not initialize WAL encryption")?;
    let link = StreamLink::create(seg_name, Path::new("/dev/stdin"))?;
    let command = pipe::substitute(command, source, link.path());

    let result = archive_through(smgr.as_ref(), source, &command);
    link.remove();
    result
}

fn archive_through(smgr: &dyn XLogSmgr, source: &Path, command: &[OsString]) -> Result<()> {
    let mut child = ChildGuard::spawn(command, Stdio::piped(), Stdio::inherit())?;
    let stdin = child.take_stdin()?;
    let written = decrypt_segment(smgr, source, stdin)?;
    child.finish()?;
    info!(source = %source.display(), bytes = written, "archived WAL segment");
    Ok(())
}

/// Writes the plaintext of segment file `source` to `out` and returns the
/// number of bytes written.
///
/// The segment size is taken from the file size and must match the one in
/// the decrypted long page header.
///
/// # Errors
///
/// Returns `Error::InvalidSegmentSize` for a bad size or mismatch and I/O
/// errors of the file or `out`.
pub fn decrypt_segment(smgr: &dyn XLogSmgr, source: &Path, mut out: impl Write) -> Result<u64> {
    let file = File::open(source).with_context(|| format!("could not open \"{}\"", source.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("could not stat \"{}\"", source.display()))?
        .len();
    let segsize = check_segment_size(size)
        .with_context(|| format!("segment \"{}\" has an unexpected size", source.display()))?;

    let name = source.file_name().and_then(|name| name.to_str()).unwrap_or_default();
    let (tli, segno) = parse_wal_file_name(name, segsize)
        .with_context(|| format!("invalid WAL file name \"{name}\""))?;

    let mut buf = vec![0u8; XLOG_BLCKSZ];
    let n = smgr
        .seg_read(&file, &mut buf, 0, tli, segno, segsize)
        .with_context(|| format!("could not read \"{}\"", source.display()))?;
    let header = LongPageHeader::parse(&buf[..n], source).context("could not read the first WAL page")?;
    if header.segment_size() != segsize {
        return Err(Error::InvalidSegmentSize(header.segment_size()))
            .context("segment size in the WAL page header does not match the file size");
    }
    out.write_all(&buf[..n]).context("could not write to archive command")?;

    let mut offset = n as u64;
    while offset < segsize {
        let n = smgr
            .seg_read(&file, &mut buf, offset, tli, segno, segsize)
            .with_context(|| format!("could not read \"{}\"", source.display()))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("could not write to archive command")?;
        offset += n as u64;
    }
    out.flush().context("could not write to archive command")?;
    Ok(offset)
}
