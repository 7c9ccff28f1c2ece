//! Secure wallet-key lifecycle and credential-key binding core.
//!
//! This crate is the trusted core of a digital-identity wallet. It owns:
//!
//! - the secure-unlock state machine that gates all wallet access
//!   behind PIN or biometric proof ([`unlock`]),
//! - the key-derivation and AEAD primitives that wrap the wallet key
//!   and derive PIN-bound keys ([`crypto`]),
//! - the migration engine that re-keys an encrypted record store from
//!   a legacy key-wrap scheme to a new one ([`migration`]),
//! - the credential-key binding resolver that allocates software- or
//!   hardware-backed signing keys at issuance time ([`binding`]),
//! - the PIN-derived ephemeral key protocol for authenticated-channel
//!   PID issuance ([`pid`]).
//!
//! Platform facilities (OS secret store, secure element, encrypted
//! record store) are abstracted behind traits; in-memory
//! implementations back the tests and software-only flows.
//!
//! The wallet key only ever exists in process memory and inside the
//! OS-managed secret store. It is never written in clear form to the
//! record store or any other non-volatile location.

#![deny(clippy::all)]

pub mod binding;
pub mod crypto;
pub mod jwk;
pub mod keystore;
pub mod migration;
pub mod pid;
pub mod secure_element;
pub mod unlock;
pub mod wallet_key;

pub use idwallet_store as store;
