//! Command-line tools around `pgtde`.
//!
//! - `pg_tde_archive_decrypt %p <archive_command...>` feeds the decrypted
//!   segment to an archive command.
//! - `pg_tde_restore_encrypt %f %p <restore_command...>` encrypts what a
//!   restore command produces.
//! - `pg_tde_keys` administers key providers offline.
//!
//! The wrapped commands expect a file name, so the tools hand them a
//! symlink to `/dev/stdin` or `/dev/stdout` inside a private temporary
//! directory and splice the data through a pipe.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod config;
pub mod keyring;
pub mod pipe;
pub mod restore;
pub mod server_key;
