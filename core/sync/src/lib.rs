//! Rollcall sync core.
//!
//! This module provides:
//! - The offline sync reconciler that merges device uploads into the store
//! - The wire protocol of sync requests and per-record results
//! - The online desk for connected registration and check-in
//!
//! # Guarantees
//! - Every record commits or fails on its own, including records that
//!   do not parse
//! - Check-in confirmations never delay the response
//! - Retried uploads resolve to the rows created the first time
//! - Fallback ids are assigned once and never rewritten

pub mod online;
pub mod protocol;
pub mod reconciler;
mod resolve;

#[cfg(test)]
mod testing;

pub use online::OnlineDesk;
pub use protocol::{
    BatchEntry, CheckInRecord, CheckInResult, NewRegistration, OnlineCheckIn, RecordStatus,
    RegistrationResult, SyncRequest, SyncResponse, UserRef,
};
pub use reconciler::{ReconcileConfig, Reconciler};
pub use resolve::PLAINTEXT_TEMPLATE_WARNING;
