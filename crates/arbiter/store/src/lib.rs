//! Arbiter unified storage abstractions.
//!
//! This crate defines the persistence boundary for the pipeline runtime:
//! - task records with atomic claim-if-unclaimed writes (the single
//!   cross-occurrence coordination primitive)
//! - thought records for pipeline passes
//! - gap-free, ordered append for audit entries
//!
//! Design stance:
//! - a transactional backend (PostgreSQL) is the source of truth in
//!   production; the in-memory adapter is the deterministic reference
//!   implementation shared by tests.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StoreError, StoreResult};
pub use traits::{ArbiterStore, AuditStore, TaskStore, ThoughtStore};
