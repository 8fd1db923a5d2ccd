//! Global versus per-database key provider scope.
//!
//! Cluster-wide objects (WAL, shared catalogs) take their keys from the
//! providers of a reserved synthetic database. On disk those providers
//! carry negative ids so that a bare id routes to the right file:
//! `id < 0` means the global file, anything else the per-database file.
//! In memory the scope is explicit and the sign only appears at the
//! persistence boundary.

use std::fmt;
use std::num::NonZeroU32;

/// Object identifier of a database.
pub type Oid = u32;

/// Reserved database oid holding the global key providers.
pub const GLOBAL_DATA_TDE_OID: Oid = 1664;

/// Which provider file a key provider lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Cluster-wide providers.
    Global,
    /// Providers of a single database.
    Database(Oid),
}

impl Scope {
    /// Maps a database oid to its scope; the reserved oid is global.
    #[must_use]
    pub const fn from_oid(oid: Oid) -> Self {
        if oid == GLOBAL_DATA_TDE_OID {
            Self::Global
        } else {
            Self::Database(oid)
        }
    }

    /// Returns the oid used to name the provider file.
    #[must_use]
    pub const fn oid(self) -> Oid {
        match self {
            Self::Global => GLOBAL_DATA_TDE_OID,
            Self::Database(oid) => oid,
        }
    }

    /// Checks if this is the global scope.
    #[must_use]
    pub const fn is_global(self) -> bool {
        matches!(self, Self::Global)
    }

    /// File name of the provider file for this scope.
    #[must_use]
    pub fn provider_file_name(self) -> String {
        format!("pg_tde_{}_keyring", self.oid())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Database(oid) => write!(f, "database {oid}"),
        }
    }
}

/// Identifier of a key provider, unique in magnitude within its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId {
    global: bool,
    number: NonZeroU32,
}

impl ProviderId {
    /// Largest provider number that still fits the signed on-disk field.
    #[allow(clippy::cast_sign_loss)]
    pub const MAX_NUMBER: u32 = i32::MAX as u32;

    /// Creates the id `number` in `scope`.
    ///
    /// Returns `None` for zero (reserved as "unassigned") and for numbers
    /// that do not fit the on-disk field.
    #[must_use]
    pub fn new(scope: Scope, number: u32) -> Option<Self> {
        if number > Self::MAX_NUMBER {
            return None;
        }
        NonZeroU32::new(number).map(|number| Self { global: scope.is_global(), number })
    }

    /// Decodes the signed on-disk representation. Zero yields `None`.
    #[must_use]
    pub fn from_signed(raw: i32) -> Option<Self> {
        let number = NonZeroU32::new(raw.unsigned_abs())?;
        if number.get() > Self::MAX_NUMBER {
            return None;
        }
        Some(Self { global: raw < 0, number })
    }

    /// Encodes the id for persistence: negative for global providers.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn to_signed(self) -> i32 {
        // number is bounded by MAX_NUMBER
        let magnitude = self.number.get() as i32;
        if self.global {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Returns the id magnitude.
    #[must_use]
    pub const fn number(self) -> u32 {
        self.number.get()
    }

    /// Checks if the id belongs to a global provider.
    #[must_use]
    pub const fn is_global(self) -> bool {
        self.global
    }

    /// Resolves the provider file to consult when `db` asks for this id.
    #[must_use]
    pub const fn scope(self, db: Oid) -> Scope {
        if self.global {
            Scope::Global
        } else {
            Scope::from_oid(db)
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_signed())
    }
}
