//! In-memory implementations of the engine's collaborators.
//!
//! # Overview
//!
//! The multicast engine is written against contracts: a shared state table
//! ([`crate::Table`]) and a reliable bulk multicast ([`crate::Transport`]).
//! This module provides process-local implementations of both, suitable for
//! tests and simulation: every member of a simulated deployment registers
//! with the shared [`Sst`] and [`Bulk`] and runs a full engine over them.
//!
//! # Details
//!
//! [`Sst`] keeps one row per member behind a shared lock. A member's
//! [`Replica`] publishes whole rows atomically and fans out an update event
//! to every member's feed, which satisfies the table contract (tear-free
//! reads, publish order per writer) trivially.
//!
//! [`Bulk`] routes posted buffers to every group member exactly once and in
//! post order, surfacing the two-phase receive contract (an incoming event
//! followed by a completion, with no incoming event on the poster itself).
//! Group creation can be poisoned to exercise construction failures.

mod sst;
pub use sst::{Replica, Sst};
mod transport;
pub use transport::{Bulk, Port};
