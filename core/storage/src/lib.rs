//! Relational storage for Rollcall.
//!
//! This module provides a transactional interface over the six check-in
//! entities (users, events, sessions, registrations, check-ins and offline
//! devices) and two backends: SQLite for deployments and an in-memory store
//! for tests and development.
//!
//! # Design Principles
//! - All-or-nothing: every write goes through a [`Transaction`]
//! - Unique constraints are enforced by the store, never by callers
//! - A lost unique-constraint race surfaces as `Error::Conflict`

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{with_transaction, Store, Transaction};
