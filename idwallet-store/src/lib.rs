//! Encrypted record-store driver surface for the idwallet core.
//!
//! A wallet's long-lived data (issued credentials, key-table entries,
//! protocol salts) lives in an encrypted record store. The production
//! driver is platform-specific and lives outside this workspace; this
//! crate defines the surface the core depends on:
//!
//! - store identity and on-disk naming (`{product}-wallet-{version}`),
//! - the [`KeyWrapScheme`] tag that is part of a store's identity,
//! - the [`StoreDriver`] / [`StoreSession`] traits,
//! - an in-memory driver ([`MemoryStoreDriver`]) used by tests and
//!   software-only deployments.
//!
//! A store's key-wrap scheme is fixed at provisioning time. Rotating the
//! wallet key means provisioning a store under a bumped version and
//! migrating into it; in-place re-encryption is not supported.

#![deny(clippy::all)]

mod driver;
mod error;
mod memory;
mod types;

pub use driver::{StoreDriver, StoreSession};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStoreDriver;
pub use types::{KeyEntry, KeyWrapScheme, PassKey, Record, StoreId, TagFilter};
