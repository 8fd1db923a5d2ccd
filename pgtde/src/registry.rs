//! Durable registry of key providers.
//!
//! Each scope has one provider file, a plain array of fixed-width
//! [`ProviderRecord`]s. Records are appended by [`Registry::add`],
//! rewritten in place by [`Registry::modify`] and tombstoned by
//! [`Registry::delete`]; they are never physically removed, so the offsets
//! carried by redo records stay valid for the life of the file.
//!
//! Every access holds an advisory lock on the provider file itself: shared
//! for scans, exclusive for writes. The lock is taken on a fresh open of the
//! file per call, so it serializes threads of one process as well as
//! separate processes. Nothing is cached; every call re-reads the file.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;

use fs4::fs_std::FileExt as LockExt;

use tracing::{debug, info, warn};

use crate::config::TdeConfig;
use crate::error::Error;
use crate::options::{Keyring, ProviderOptions, ProviderType};
use crate::record::{ProviderRecord, RECORD_SIZE};
use crate::scope::{Oid, ProviderId, Scope};
use crate::xlog::{KeyProviderRedo, XLogSink};

/// Which records a scan returns. Tombstones never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFilter<'a> {
    /// Every live provider.
    All,
    /// Providers whose name matches, ignoring ASCII case.
    ByName(&'a str),
    /// The provider with this id.
    ById(ProviderId),
    /// Providers of one type.
    ByType(ProviderType),
}

impl ProviderFilter<'_> {
    fn matches(&self, record: &ProviderRecord) -> bool {
        match self {
            Self::All => true,
            Self::ByName(name) => record.name().eq_ignore_ascii_case(name),
            Self::ById(id) => record.provider_id() == id.to_signed(),
            Self::ByType(provider_type) => record.provider_type() == *provider_type,
        }
    }
}

/// One row of a provider listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderListing {
    /// Provider id.
    pub id: ProviderId,
    /// Provider name.
    pub name: String,
    /// User-facing type name (`file`, `vault-v2`, `kmip`).
    pub type_name: String,
    /// Options exactly as stored.
    pub options: String,
}

/// Key provider registry.
///
/// Any number of registries, in any number of processes, may work on the
/// same data directory. A registry built with [`Registry::new`] runs in
/// frontend mode and never emits redo records.
pub struct Registry {
    config: TdeConfig,
    xlog: Option<Arc<dyn XLogSink>>,
}

impl Registry {
    /// Creates a frontend registry that writes no redo records.
    #[must_use]
    pub fn new(config: TdeConfig) -> Self {
        info!(data_dir = %config.data_dir().display(), "initializing TDE key provider info");
        Self { config, xlog: None }
    }

    /// Creates a server registry that logs every write to `xlog` first.
    #[must_use]
    pub fn with_xlog(config: TdeConfig, xlog: Arc<dyn XLogSink>) -> Self {
        info!(data_dir = %config.data_dir().display(), "initializing TDE key provider info");
        Self { config, xlog: Some(xlog) }
    }

    /// Returns the configuration this registry reads.
    #[must_use]
    pub const fn config(&self) -> &TdeConfig {
        &self.config
    }

    /// Adds a provider and returns its newly assigned id.
    ///
    /// The id is one more than the largest id magnitude in the file,
    /// tombstones included, and negative in the global scope.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCall` if the record already carries an id
    /// - `Error::InvalidOptions` if the options do not parse
    /// - `Error::Duplicate` if a live provider has the same name
    /// - `Error::IdOutOfRange` if no id is left
    /// - `Error::Corrupt` or `Error::Io` on file problems
    pub fn add(&self, record: ProviderRecord, db: Oid, write_xlog: bool) -> Result<ProviderId, Error> {
        if record.provider_id() != 0 {
            return Err(Error::InvalidCall(format!(
                "new key provider \"{}\" must not carry an id",
                record.name()
            )));
        }
        check_record(&record)?;

        let scope = Scope::from_oid(db);
        let path = self.config.provider_file_path(scope);
        let file = self.open_for_write(&path)?;
        let records = read_records(&file, &path)?;

        let mut max_number = 0u32;
        for existing in &records {
            max_number = max_number.max(existing.provider_id().unsigned_abs());
            if !existing.is_tombstone() && existing.name() == record.name() {
                return Err(Error::Duplicate(record.name().to_string()));
            }
        }

        let number = max_number.checked_add(1).ok_or(Error::IdOutOfRange)?;
        let id = ProviderId::new(scope, number).ok_or(Error::IdOutOfRange)?;
        let offset = records.len() as u64 * RECORD_SIZE as u64;
        let record = record.with_provider_id(id.to_signed());

        self.persist(&file, &path, scope, offset, &record, write_xlog)?;
        info!(%scope, %id, name = record.name(), "added key provider");
        Ok(id)
    }

    /// Rewrites the options of an existing provider in place.
    ///
    /// The provider is found by exact name. Its id and offset are kept; a
    /// record carrying an id must carry the stored one.
    ///
    /// Only the local parse is checked; remote backends are not contacted.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidOptions` if the new options do not parse
    /// - `Error::NotFound` if no live provider has that name
    /// - `Error::InvalidCall` if the record carries a different id
    /// - `Error::Corrupt` or `Error::Io` on file problems
    pub fn modify(
        &self,
        record: ProviderRecord,
        db: Oid,
        write_xlog: bool,
    ) -> Result<ProviderId, Error> {
        check_record(&record)?;

        let scope = Scope::from_oid(db);
        let path = self.config.provider_file_path(scope);
        let file = self.open_for_write(&path)?;
        let records = read_records(&file, &path)?;
        let (offset, existing) = records
            .iter()
            .enumerate()
            .find(|(_, r)| !r.is_tombstone() && r.name() == record.name())
            .map(|(index, r)| (index as u64 * RECORD_SIZE as u64, r))
            .ok_or_else(|| Error::NotFound(format!("\"{}\"", record.name())))?;

        if record.provider_id() != 0 && record.provider_id() != existing.provider_id() {
            return Err(Error::InvalidCall(format!(
                "provider id mismatch {} is not {}",
                record.provider_id(),
                existing.provider_id()
            )));
        }

        let id = ProviderId::from_signed(existing.provider_id())
            .ok_or_else(|| Error::corrupt(&path, "stored provider has no id"))?;
        let record = record.with_provider_id(existing.provider_id());

        self.persist(&file, &path, scope, offset, &record, write_xlog)?;
        info!(%scope, %id, name = record.name(), "modified key provider");
        Ok(id)
    }

    /// Tombstones the provider with this id.
    ///
    /// The id decides the file: negative ids live in the global file.
    /// Deleting an already deleted provider succeeds without writing.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the id was never assigned in that file
    /// - `Error::Corrupt` or `Error::Io` on file problems
    pub fn delete(&self, id: ProviderId, db: Oid, write_xlog: bool) -> Result<(), Error> {
        let scope = id.scope(db);
        self.tombstone(scope, write_xlog, |record| record.provider_id() == id.to_signed())
            .map(|_| ())
            .map_err(|err| match err {
                Error::NotFound(_) => Error::NotFound(format!("with id {id}")),
                other => other,
            })
    }

    /// Tombstones the live provider with this exact name.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if no live provider has that name
    /// - `Error::Corrupt` or `Error::Io` on file problems
    pub fn delete_by_name(&self, name: &str, db: Oid, write_xlog: bool) -> Result<ProviderId, Error> {
        self.tombstone(Scope::from_oid(db), write_xlog, |record| {
            !record.is_tombstone() && record.name() == name
        })
        .map_err(|err| match err {
            Error::NotFound(_) => Error::NotFound(format!("\"{name}\"")),
            other => other,
        })
    }

    /// Returns the live provider whose name matches, ignoring ASCII case.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if none matches
    /// - `Error::Corrupt` or `Error::Io` on file problems
    pub fn get_by_name(&self, name: &str, db: Oid) -> Result<Keyring, Error> {
        self.scan(ProviderFilter::ByName(name), db)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("\"{name}\"")))
    }

    /// Returns the live provider with this id, looking in the global file
    /// for global ids.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if none matches
    /// - `Error::Corrupt` or `Error::Io` on file problems
    pub fn get_by_id(&self, id: ProviderId, db: Oid) -> Result<Keyring, Error> {
        let scope = id.scope(db);
        self.scan(ProviderFilter::ById(id), scope.oid())?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("with id {id}")))
    }

    /// Loads every live provider of `db` that matches `filter`.
    ///
    /// A missing provider file is an empty registry. Records whose options
    /// no longer parse are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupt` on a partial record and `Error::Io` if the
    /// file cannot be read.
    pub fn scan(&self, filter: ProviderFilter<'_>, db: Oid) -> Result<Vec<Keyring>, Error> {
        let scope = Scope::from_oid(db);
        let path = self.config.provider_file_path(scope);
        let file = match open_locked(&path, OpenOptions::new().read(true), false) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::io(&path, err)),
        };

        let mut providers = Vec::new();
        for record in read_records(&file, &path)? {
            debug!(id = record.provider_id(), name = record.name(), "read key provider record");
            if record.is_tombstone() || !filter.matches(&record) {
                continue;
            }
            match Keyring::load_from_record(&record) {
                Ok(keyring) => providers.push(keyring),
                Err(err) => {
                    warn!(name = record.name(), error = %err, "skipping unusable key provider");
                }
            }
        }
        Ok(providers)
    }

    /// Lists the live providers of `db`.
    ///
    /// # Errors
    ///
    /// Same as [`Registry::scan`].
    pub fn list(&self, db: Oid) -> Result<Vec<ProviderListing>, Error> {
        Ok(self
            .scan(ProviderFilter::All, db)?
            .into_iter()
            .map(|keyring| ProviderListing {
                id: keyring.id(),
                name: keyring.name().to_string(),
                type_name: keyring.provider_type().to_string(),
                options: keyring.raw_options().to_string(),
            })
            .collect())
    }

    /// Replays a logged provider write.
    ///
    /// The record is written at exactly the logged offset with no
    /// uniqueness check, no id assignment and no new redo record, so
    /// replaying the same record twice leaves the same bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be written or synced.
    pub fn redo(&self, redo: &KeyProviderRedo) -> Result<(), Error> {
        let scope = Scope::from_oid(redo.database_id);
        let path = self.config.provider_file_path(scope);
        let file = self.open_for_write(&path)?;
        write_at(&file, &path, redo.offset_in_file, &redo.record)?;
        info!(
            %scope,
            offset = redo.offset_in_file,
            name = redo.record.name(),
            "replayed key provider write"
        );
        Ok(())
    }

    /// Removes the provider file of `db`. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file exists but cannot be removed.
    pub fn cleanup(&self, db: Oid) -> Result<(), Error> {
        let scope = Scope::from_oid(db);
        let path = self.config.provider_file_path(scope);
        let _file = match open_locked(&path, OpenOptions::new().read(true).write(true), true) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(Error::io(&path, err)),
        };

        fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        info!(%scope, "removed key provider file");
        Ok(())
    }

    fn tombstone(
        &self,
        scope: Scope,
        write_xlog: bool,
        target: impl Fn(&ProviderRecord) -> bool,
    ) -> Result<ProviderId, Error> {
        let path = self.config.provider_file_path(scope);
        let file = match open_locked(&path, OpenOptions::new().read(true).write(true), true) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(String::new()))
            }
            Err(err) => return Err(Error::io(&path, err)),
        };
        let records = read_records(&file, &path)?;
        let (index, existing) = records
            .iter()
            .enumerate()
            .find(|(_, r)| target(r))
            .ok_or_else(|| Error::NotFound(String::new()))?;

        let id = ProviderId::from_signed(existing.provider_id())
            .ok_or_else(|| Error::corrupt(&path, "stored provider has no id"))?;
        if existing.is_tombstone() {
            debug!(%scope, %id, "key provider already deleted");
            return Ok(id);
        }

        let offset = index as u64 * RECORD_SIZE as u64;
        self.persist(&file, &path, scope, offset, &existing.tombstone(), write_xlog)?;
        info!(%scope, %id, name = existing.name(), "deleted key provider");
        Ok(id)
    }

    fn open_for_write(&self, path: &Path) -> Result<File, Error> {
        fs::create_dir_all(self.config.data_dir())
            .map_err(|e| Error::io(self.config.data_dir(), e))?;
        open_locked(
            path,
            OpenOptions::new().read(true).write(true).create(true).truncate(false).mode(0o600),
            true,
        )
        .map_err(|e| Error::io(path, e))
    }

    /// Logs the write, then writes and syncs the record.
    fn persist(
        &self,
        file: &File,
        path: &Path,
        scope: Scope,
        offset: u64,
        record: &ProviderRecord,
        write_xlog: bool,
    ) -> Result<(), Error> {
        if write_xlog {
            if let Some(xlog) = &self.xlog {
                xlog.log_key_provider_write(&KeyProviderRedo {
                    database_id: scope.oid(),
                    offset_in_file: offset,
                    record: record.clone(),
                })?;
            }
        }
        write_at(file, path, offset, record)
    }
}

/// Opens `path` and blocks until the advisory lock is held.
///
/// A waiter can wake up holding a file that [`Registry::cleanup`] unlinked
/// meanwhile; it then reopens the path so writes never land in a dead inode.
fn open_locked(path: &Path, options: &OpenOptions, exclusive: bool) -> io::Result<File> {
    loop {
        let file = options.open(path)?;
        if exclusive {
            LockExt::lock_exclusive(&file)?;
        } else {
            LockExt::lock_shared(&file)?;
        }

        let held = file.metadata()?;
        match fs::metadata(path) {
            Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
                return Ok(file)
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        debug!(path = %path.display(), "provider file replaced while waiting for its lock");
    }
}

fn check_record(record: &ProviderRecord) -> Result<(), Error> {
    ProviderOptions::parse(record.provider_type(), record.options()).map(|_| ())
}

fn read_records(file: &File, path: &Path) -> Result<Vec<ProviderRecord>, Error> {
    let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
    if len % RECORD_SIZE as u64 != 0 {
        return Err(Error::corrupt(
            path,
            format!("size {len} is not a multiple of the {RECORD_SIZE}-byte record size"),
        ));
    }

    let count = len / RECORD_SIZE as u64;
    let mut records = Vec::new();
    let mut buf = [0u8; RECORD_SIZE];
    for index in 0..count {
        file.read_exact_at(&mut buf, index * RECORD_SIZE as u64).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::corrupt(path, format!("partial record {index}"))
            } else {
                Error::io(path, e)
            }
        })?;
        records.push(ProviderRecord::from_bytes(&buf));
    }
    Ok(records)
}

fn write_at(file: &File, path: &Path, offset: u64, record: &ProviderRecord) -> Result<(), Error> {
    file.write_all_at(&record.to_bytes(), offset).map_err(|e| Error::io(path, e))?;
    file.sync_all().map_err(|e| Error::io(path, e))
}
