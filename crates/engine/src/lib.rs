//! # Engine — the UndertowKV storage core
//!
//! The central crate tying the [`writebuffer`], `bloom` and [`run`] crates
//! into an embedded, ordered key/value store organized as an LSM-tree.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌─────────────────────────────────────────────────────┐
//! │                       TABLE                         │
//! │                                                     │
//! │ insert/delete/mupsert → WriteBuffer                 │
//! │              |                                      │
//! │              |  (capacity reached?)                 │
//! │              v                                      │
//! │           flush → new level-0 run                   │
//! │              |                                      │
//! │              |  (level full?)                       │
//! │              v                                      │
//! │     incremental merge → run on next level,          │
//! │     advanced stepwise by update credits             │
//! │                                                     │
//! │ lookup → WriteBuffer → runs, newest to oldest       │
//! │          (bloom → compact index → page fetch)       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Levels
//!
//! ```text
//! ┌────────────────────────────┐  ← freshest, probed first
//! │ WRITE BUFFER               │
//! ├────────────────────────────┤  ← flushes land here
//! │ level 0: up to N runs      │
//! ├────────────────────────────┤  ← merge outputs cascade down
//! │ level 1: up to N runs      │
//! │ ...                        │
//! └────────────────────────────┘
//! ```
//!
//! ## Sharing
//!
//! Runs are immutable and reference-counted: [`Table::duplicate`] and
//! [`Table::create_snapshot`] are O(1) in data, sharing every resident run.
//! A run's four files are unlinked when its last reference drops. Snapshots
//! live in the [`Session`]'s registry under validated names and reopen as
//! independent tables.
//!
//! ## Concurrency
//!
//! A table's state sits behind a single mutex; operations lock, step, and
//! unlock, releasing the lock around disk I/O by cloning the run references
//! they need. Updates on one table are linearizable with its lookups.

mod config;
mod error;
mod read;
mod session;
mod table;

pub use config::{CachePolicy, Config};
pub use error::{Error, Result};
pub use session::{Session, SnapshotName};
pub use table::Table;

pub use run::{BloomFilterAlloc, LookupResult};
pub use writebuffer::{concat_resolve, BlobSpan, Entry, Key, Resolve, Value, WriteBuffer};

/// Maximum allowed key size in bytes (32 KiB).
pub const MAX_KEY_SIZE: usize = 32 * 1024;
/// Maximum allowed value and blob size in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

#[cfg(test)]
mod tests;
