//! SQLite storage layer for the memory write gateway.
//!
//! This crate provides:
//! - Connection management with WAL mode and migrations
//! - The `memory_write_outbox` table and its lease protocol
//! - The `memory_write_audit` table and the two-phase audit commit
//! - Scan queries for the reconciliation passes
//!
//! Every outbox mutation carries an ownership predicate
//! (`status = 'pending' AND locked_by = ?`), so a call that returns `false`
//! means the caller lost its lease and must abandon the record.

mod db;
mod error;
mod migrations;
mod models;

pub use db::Database;
pub use error::{DatabaseError, DatabaseResult};
pub use migrations::CURRENT_VERSION;
pub use models::*;
