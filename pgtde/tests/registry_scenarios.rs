//! End-to-end registry scenarios against a real provider directory.

use std::fs;
use std::sync::{Arc, Mutex};

use pgtde::prelude::*;
use pgtde::record::RECORD_SIZE;
use proptest::prelude::*;
use tempfile::TempDir;

const DB: Oid = 5;

fn file_provider(name: &str, file_name: &str) -> ProviderRecord {
    ProviderRecord::new(name, ProviderType::File, format!(r#"{{"file_name":"{file_name}"}}"#))
        .expect("valid record")
}

/// Collects redo records the way the host WAL would.
#[derive(Default)]
struct MemoryLog {
    records: Mutex<Vec<Vec<u8>>>,
}

impl XLogSink for MemoryLog {
    fn log_key_provider_write(&self, redo: &KeyProviderRedo) -> Result<(), Error> {
        self.records.lock().expect("log lock").push(redo.to_bytes());
        Ok(())
    }
}

#[test]
fn test_add_list_modify_delete_cycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let registry = Registry::new(TdeConfig::new(temp_dir.path()));

    // Add
    let id = registry.add(file_provider("kr1", "/tmp/k1"), DB, false).expect("add failed");
    assert_eq!(id.to_signed(), 1);

    // List
    let rows = registry.list(DB).expect("list failed");
    assert_eq!(
        rows,
        vec![ProviderListing {
            id,
            name: "kr1".to_string(),
            type_name: "file".to_string(),
            options: r#"{"file_name":"/tmp/k1"}"#.to_string(),
        }]
    );

    // Modify keeps id and offset
    let modified = registry.modify(file_provider("kr1", "/tmp/k2"), DB, false).expect("modify failed");
    assert_eq!(modified, id);
    let rows = registry.list(DB).expect("list failed");
    assert_eq!(rows[0].options, r#"{"file_name":"/tmp/k2"}"#);

    // Delete leaves a tombstone in place
    registry.delete(id, DB, false).expect("delete failed");
    let path = registry.config().provider_file_path(Scope::Database(DB));
    let bytes = fs::read(&path).expect("read provider file");
    assert_eq!(bytes.len(), RECORD_SIZE);

    let mut raw = [0u8; RECORD_SIZE];
    raw.copy_from_slice(&bytes);
    let tombstone = ProviderRecord::from_bytes(&raw);
    assert!(tombstone.is_tombstone());
    assert_eq!(tombstone.provider_id(), 1);

    assert!(registry.list(DB).expect("list failed").is_empty());
}

#[test]
fn test_global_provider_gets_negative_id() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let registry = Registry::new(TdeConfig::new(temp_dir.path()));

    let id = registry
        .add(file_provider("kr_g", "/tmp/global"), GLOBAL_DATA_TDE_OID, false)
        .expect("add failed");
    assert_eq!(id.to_signed(), -1);
    assert!(id.is_global());

    // Any database resolves a negative id in the global file
    let keyring = registry.get_by_id(id, DB).expect("lookup failed");
    assert_eq!(keyring.name(), "kr_g");
    assert!(registry.list(DB).expect("list failed").is_empty());

    // The same name may exist per database with a positive id
    let local = registry.add(file_provider("kr_g", "/tmp/local"), DB, false).expect("add failed");
    assert_eq!(local.to_signed(), 1);
}

#[test]
fn test_duplicate_name_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let registry = Registry::new(TdeConfig::new(temp_dir.path()));
    let path = registry.config().provider_file_path(Scope::Database(DB));

    registry.add(file_provider("kr1", "/tmp/k1"), DB, false).expect("add failed");
    let size = fs::metadata(&path).expect("stat").len();

    let err = registry.add(file_provider("kr1", "/tmp/other"), DB, false).unwrap_err();
    assert!(matches!(err, Error::Duplicate(name) if name == "kr1"));
    assert_eq!(fs::metadata(&path).expect("stat").len(), size);
}

#[test]
fn test_crash_replay_restores_provider() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let log = Arc::new(MemoryLog::default());
    let registry = Registry::with_xlog(TdeConfig::new(temp_dir.path()), log.clone());

    registry.add(file_provider("kr1", "/tmp/k1"), DB, true).expect("add failed");
    registry.add(file_provider("kr2", "/tmp/k2"), DB, true).expect("add failed");
    let path = registry.config().provider_file_path(Scope::Database(DB));
    let expected = fs::read(&path).expect("read provider file");

    // Lose the second write, then replay the whole log
    fs::write(&path, &expected[..RECORD_SIZE]).expect("truncate");
    let recovered = Registry::new(TdeConfig::new(temp_dir.path()));
    for bytes in log.records.lock().expect("log lock").iter() {
        let redo = KeyProviderRedo::from_bytes(bytes).expect("valid redo record");
        recovered.redo(&redo).expect("redo failed");
    }

    assert_eq!(fs::read(&path).expect("read provider file"), expected);
    let names: Vec<_> = recovered.list(DB).expect("list failed").into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["kr1".to_string(), "kr2".to_string()]);
}

#[test]
fn test_frontend_registry_writes_no_redo() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let log = Arc::new(MemoryLog::default());
    let server = Registry::with_xlog(TdeConfig::new(temp_dir.path()), log.clone());

    server.add(file_provider("kr1", "/tmp/k1"), DB, false).expect("add failed");
    server.delete_by_name("kr1", DB, true).expect("delete failed");

    // Only the delete asked for a redo record
    assert_eq!(log.records.lock().expect("log lock").len(), 1);
}

#[test]
fn test_concurrent_adds_get_unique_ids() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let registry = Arc::new(Registry::new(TdeConfig::new(temp_dir.path())));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                registry
                    .add(file_provider(&format!("kr{i}"), "/tmp/k"), DB, false)
                    .expect("add failed")
                    .to_signed()
            })
        })
        .collect();

    let mut ids: Vec<i32> = handles.into_iter().map(|h| h.join().expect("thread panicked")).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=8).collect::<Vec<_>>());
}

#[test]
fn test_separate_registries_share_the_file_lock() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().to_path_buf();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let path = path.clone();
            std::thread::spawn(move || {
                let registry = Registry::new(TdeConfig::new(&path));
                let mut ids = Vec::new();
                for j in 0..4 {
                    let name = format!("kr{i}-{j}");
                    ids.push(
                        registry
                            .add(file_provider(&name, "/tmp/k"), DB, false)
                            .expect("add failed")
                            .to_signed(),
                    );
                    // interleave readers with the writers of other instances
                    registry.list(DB).expect("list failed");
                }
                ids
            })
        })
        .collect();

    let mut ids: Vec<i32> =
        handles.into_iter().flat_map(|h| h.join().expect("thread panicked")).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=32).collect::<Vec<_>>());

    let registry = Registry::new(TdeConfig::new(&path));
    assert_eq!(registry.list(DB).expect("list failed").len(), 32);
    let file = registry.config().provider_file_path(Scope::Database(DB));
    assert_eq!(fs::metadata(file).expect("metadata").len(), 32 * RECORD_SIZE as u64);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_redo_is_idempotent(slot in 0u64..4, id in 1i32..100, name in "[a-z]{1,20}") {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let registry = Registry::new(TdeConfig::new(temp_dir.path()));
        let path = registry.config().provider_file_path(Scope::Database(DB));
        let redo = KeyProviderRedo {
            database_id: DB,
            offset_in_file: slot * RECORD_SIZE as u64,
            record: file_provider(&name, "/tmp/k").with_provider_id(id),
        };

        registry.redo(&redo).expect("redo failed");
        let once = fs::read(&path).expect("read provider file");
        registry.redo(&redo).expect("redo failed");
        prop_assert_eq!(fs::read(&path).expect("read provider file"), once);
    }
}
