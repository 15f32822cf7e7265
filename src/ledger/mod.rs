//! Ledger integration module
//!
//! This module provides the client and types for talking to the Solana JSON-RPC endpoint that is
//! the authority for mirrored state: the program log subscription, signature status queries, and
//! account fetches, plus the Anchor codec used to decode events and accounts.

/// JSON-RPC and websocket client for the ledger
mod client;
/// Anchor discriminators and Borsh layouts
pub mod codec;
/// Type definitions for ledger data structures
mod types;

pub use client::SolanaRpcClient;
pub use codec::{EventKind, ProgramEvent};
pub use types::*;
