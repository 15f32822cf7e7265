//! solana-mirror-sync library target.
//!
//! Exposes the ledger client, mirror stores and sync core so relay layers and
//! live-event handlers can be built on the same notification bus and store.
//! The binary `main.rs` depends on this library target.

pub mod config;
pub mod ledger;
pub mod store;
pub mod sync;
