//! Local mirror store
//!
//! Repository trait for the query-optimized replica of ledger state, together with an
//! in-memory implementation and a JSON file implementation.

mod file;
mod memory;
mod types;

pub use file::FileMirrorStore;
pub use memory::InMemoryMirrorStore;
pub use types::*;
