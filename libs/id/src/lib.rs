//! # batchd-id
//!
//! Identity types for the batchd scheduler.
//!
//! ## Design Principles
//!
//! - Jobs, nodes and reservations live in arenas and are addressed by
//!   generational handles; a freed slot is an explicit tombstone
//! - A handle to a freed slot never resolves, even after the slot is reused
//! - Handles have a canonical string form with strict parsing
//! - Handles are typed so a job handle can never index the node table
//!
//! ## Formats
//!
//! Arena handles use `{prefix}:{index}.{generation}`:
//! - `job:12.3`
//! - `node:0.1`
//!
//! Externally visible identifiers (events, cycles) are ULID based and use
//! `{prefix}_{ulid}`, e.g. `evt_01HV4Z2WQXKJNM8GPQY6VBKC3D`.

mod arena;
mod error;
mod macros;
mod types;

pub use arena::{Arena, Handle};
pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
