//! # `pgtde`
//!
//! Key provider registry and encrypted WAL storage for transparent data
//! encryption.
//!
//! ## Features
//!
//! - Durable, redo-logged registry of key providers per database
//! - Global providers for cluster-wide objects, routed by signed ids
//! - Typed, validated provider options (file, Vault KV v2, KMIP)
//! - AES-CTR encrypted WAL segments behind a storage manager trait
//! - Internal WAL keys sealed under a principal key
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgtde::prelude::*;
//!
//! let registry = Registry::new(TdeConfig::new("/var/lib/pgsql/data/pg_tde"));
//! let record = ProviderRecord::new("local", ProviderType::File, r#"{"file_name":"/etc/tde/keys"}"#)?;
//! let id = registry.add(record, GLOBAL_DATA_TDE_OID, false)?;
//! assert!(id.is_global());
//!
//! for row in registry.list(GLOBAL_DATA_TDE_OID)? {
//!     println!("{} {} {}", row.id, row.name, row.type_name);
//! }
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod key_provider;
pub mod options;
pub mod record;
pub mod registry;
pub mod scope;
pub mod wal;
pub mod xlog;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::config::TdeConfig;
    pub use crate::error::{Error, KeyProviderError};
    pub use crate::key_provider::{KeyInfo, KeyringProvider};
    pub use crate::options::{Keyring, ProviderOptions, ProviderType};
    pub use crate::record::ProviderRecord;
    pub use crate::registry::{ProviderFilter, ProviderListing, Registry};
    pub use crate::scope::{Oid, ProviderId, Scope, GLOBAL_DATA_TDE_OID};
    pub use crate::wal::smgr::{StandardSmgr, TdeSmgr, XLogSmgr};
    pub use crate::xlog::{KeyProviderRedo, XLogSink};
}
