//! Archive and restore tools driven end to end with `sh`/`cat` as the
//! wrapped command.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use pgtde::prelude::*;
use pgtde::wal::{wal_file_name, LongPageHeader, XLP_LONG_HEADER, XLOG_BLCKSZ};
use pgtde_cli::server_key::{load_smgr, rotate_server_key, set_server_key};
use tempfile::TempDir;

const SEGSIZE: u64 = 1 << 20;
const TLI: u32 = 1;
const SEGNO: u64 = 42;

// Copies $1 to $2 through the shell so that a symlinked path works on either side
const COPY: [&str; 3] = ["sh", "-c", "cat \"$1\" > \"$2\""];

fn plain_segment(seg_size: u32) -> Vec<u8> {
    let mut data: Vec<u8> = (0..SEGSIZE).map(|i| (i * 31 % 251) as u8).collect();
    let header = LongPageHeader {
        magic: 0xD116,
        info: XLP_LONG_HEADER,
        tli: TLI,
        pageaddr: SEGNO * SEGSIZE,
        rem_len: 0,
        sysid: 7_000_000_000,
        seg_size,
        xlog_blcksz: XLOG_BLCKSZ as u32,
    };
    data[..header.to_bytes().len()].copy_from_slice(&header.to_bytes());
    data
}

struct Cluster {
    dir: TempDir,
    config: TdeConfig,
}

impl Cluster {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = TdeConfig::new(dir.path().join("pg_tde"));
        fs::create_dir_all(dir.path().join("wal")).expect("create wal dir");
        Self { dir, config }
    }

    /// Sets up a global file provider and a server key.
    fn with_server_key() -> Self {
        let cluster = Self::new();
        let options = format!(r#"{{"file_name":"{}"}}"#, cluster.dir.path().join("keys").display());
        let record = ProviderRecord::new("global-file", ProviderType::File, options).expect("valid record");
        Registry::new(cluster.config.clone())
            .add(record, GLOBAL_DATA_TDE_OID, false)
            .expect("add provider");
        set_server_key(&cluster.config, "global-file", "server-key").expect("set server key");
        cluster
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn segment_path(&self) -> PathBuf {
        self.dir.path().join("wal").join(wal_file_name(TLI, SEGNO, SEGSIZE))
    }

    fn run(&self, bin: &str, args: &[&Path]) -> Output {
        Command::new(bin)
            .args(args)
            .env("PG_TDE_DATA_DIR", self.config.data_dir())
            .output()
            .expect("run tool")
    }
}

fn copy_command<'a>(from: &'a Path, to: &'a Path) -> Vec<&'a Path> {
    let mut args: Vec<&Path> = COPY.into_iter().map(Path::new).collect();
    args.extend([Path::new("sh"), from, to]);
    args
}

#[test]
fn test_archive_decrypts_segment() {
    let cluster = Cluster::with_server_key();
    let plain = plain_segment(SEGSIZE as u32);
    let source = cluster.segment_path();

    // Write the segment the way the server would
    let smgr = load_smgr(&cluster.config).expect("load smgr");
    let file = File::create(&source).expect("create segment");
    smgr.seg_write(&file, &plain, 0, TLI, SEGNO, SEGSIZE).expect("write segment");
    assert_ne!(fs::read(&source).expect("read segment"), plain);

    let dest = cluster.path("archived");
    let mut args = vec![source.as_path()];
    args.extend(copy_command(&source, &dest));
    let output = cluster.run(env!("CARGO_BIN_EXE_pg_tde_archive_decrypt"), &args);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(fs::read(&dest).expect("read archived"), plain);
}

#[test]
fn test_restore_encrypts_segment() {
    let cluster = Cluster::with_server_key();
    let plain = plain_segment(SEGSIZE as u32);
    let archived = cluster.path("archived");
    fs::write(&archived, &plain).expect("write archived");

    let name = wal_file_name(TLI, SEGNO, SEGSIZE);
    let dest = cluster.segment_path();
    let mut args = vec![Path::new(&name), dest.as_path()];
    args.extend(copy_command(&archived, &dest));
    let output = cluster.run(env!("CARGO_BIN_EXE_pg_tde_restore_encrypt"), &args);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let raw = fs::read(&dest).expect("read restored");
    assert_eq!(raw.len(), plain.len());
    assert_ne!(raw, plain);

    let smgr = load_smgr(&cluster.config).expect("load smgr");
    let mut decrypted = vec![0u8; plain.len()];
    let file = File::open(&dest).expect("open restored");
    smgr.seg_read(&file, &mut decrypted, 0, TLI, SEGNO, SEGSIZE).expect("read restored");
    assert_eq!(decrypted, plain);
}

#[test]
fn test_restore_rejects_invalid_segment_size() {
    let cluster = Cluster::new();
    let archived = cluster.path("archived");
    fs::write(&archived, plain_segment(3 << 20)).expect("write archived");

    let name = wal_file_name(TLI, SEGNO, SEGSIZE);
    let dest = cluster.segment_path();
    let mut args = vec![Path::new(&name), dest.as_path()];
    args.extend(copy_command(&archived, &dest));
    let output = cluster.run(env!("CARGO_BIN_EXE_pg_tde_restore_encrypt"), &args);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid WAL segment size"));
    assert!(!dest.exists());
}

#[test]
fn test_restore_rejects_page_without_long_header() {
    let cluster = Cluster::new();
    let archived = cluster.path("archived");
    let mut plain = plain_segment(SEGSIZE as u32);
    plain[2..4].copy_from_slice(&0u16.to_ne_bytes());
    fs::write(&archived, plain).expect("write archived");

    let name = wal_file_name(TLI, SEGNO, SEGSIZE);
    let dest = cluster.segment_path();
    let mut args = vec![Path::new(&name), dest.as_path()];
    args.extend(copy_command(&archived, &dest));
    let output = cluster.run(env!("CARGO_BIN_EXE_pg_tde_restore_encrypt"), &args);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no long header"), "stderr: {stderr}");
    assert!(!dest.exists());
}

#[test]
fn test_archive_after_server_key_rotation() {
    let cluster = Cluster::with_server_key();
    let plain = plain_segment(SEGSIZE as u32);
    let source = cluster.segment_path();

    let smgr = load_smgr(&cluster.config).expect("load smgr");
    let file = File::create(&source).expect("create segment");
    smgr.seg_write(&file, &plain, 0, TLI, SEGNO, SEGSIZE).expect("write segment");

    // Same provider, new principal key; the internal keys survive
    rotate_server_key(&cluster.config, "global-file", "server-key-2").expect("rotate server key");

    let dest = cluster.path("archived");
    let mut args = vec![source.as_path()];
    args.extend(copy_command(&source, &dest));
    let output = cluster.run(env!("CARGO_BIN_EXE_pg_tde_archive_decrypt"), &args);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(fs::read(&dest).expect("read archived"), plain);
}

#[test]
fn test_archive_rejects_truncated_segment() {
    let cluster = Cluster::new();
    let source = cluster.segment_path();
    fs::write(&source, &plain_segment(SEGSIZE as u32)[..3 * XLOG_BLCKSZ]).expect("write segment");

    let dest = cluster.path("archived");
    let mut args = vec![source.as_path()];
    args.extend(copy_command(&source, &dest));
    let output = cluster.run(env!("CARGO_BIN_EXE_pg_tde_archive_decrypt"), &args);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid WAL segment size"));
}

#[test]
fn test_archive_without_server_key_copies_plaintext() {
    let cluster = Cluster::new();
    let plain = plain_segment(SEGSIZE as u32);
    let source = cluster.segment_path();
    fs::write(&source, &plain).expect("write segment");

    let dest = cluster.path("archived");
    let mut args = vec![source.as_path()];
    args.extend(copy_command(&source, &dest));
    let output = cluster.run(env!("CARGO_BIN_EXE_pg_tde_archive_decrypt"), &args);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(fs::read(&dest).expect("read archived"), plain);
}

#[test]
fn test_non_wal_file_passes_through() {
    let cluster = Cluster::new();
    let source = cluster.path("00000002.history");
    fs::write(&source, b"1\t0/3000000\tno recovery target specified\n").expect("write history");

    let dest = cluster.path("archived.history");
    let mut args = vec![source.as_path()];
    args.extend(copy_command(&source, &dest));
    let output = cluster.run(env!("CARGO_BIN_EXE_pg_tde_archive_decrypt"), &args);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(fs::read(&dest).expect("read copy"), fs::read(&source).expect("read history"));
}

#[test]
fn test_failing_command_exits_with_one() {
    let cluster = Cluster::new();
    let source = cluster.segment_path();
    fs::write(&source, plain_segment(SEGSIZE as u32)).expect("write segment");

    let args = [source.as_path(), Path::new("sh"), Path::new("-c"), Path::new("exit 4")];
    let output = cluster.run(env!("CARGO_BIN_EXE_pg_tde_archive_decrypt"), &args);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_version_and_help_flags() {
    for flag in ["-V", "--version", "-?", "--help"] {
        let output = Command::new(env!("CARGO_BIN_EXE_pg_tde_restore_encrypt"))
            .arg(flag)
            .output()
            .expect("run tool");
        assert!(output.status.success(), "{flag} failed");
        assert!(!output.stdout.is_empty());
    }

    let output = Command::new(env!("CARGO_BIN_EXE_pg_tde_archive_decrypt")).output().expect("run tool");
    assert_eq!(output.status.code(), Some(1));
}
