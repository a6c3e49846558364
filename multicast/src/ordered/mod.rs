//! Totally-ordered, virtually synchronous multicast within the shards of a
//! process group.
//!
//! # Overview
//!
//! The core of the module is the [`Engine`], one per member per epoch. It is
//! responsible for:
//! - Admitting application sends against the send window and buffer pool
//! - Posting pending messages to the bulk transport, round-robin across
//!   subgroups
//! - Tracking receipt of every shard sender's messages and publishing the
//!   monotonic counter family (`num_received`, `seq_num`, `stable_num`,
//!   `delivered_num`, `persisted_num`) on the shared state table
//! - Delivering messages to the application in total order, exactly once
//! - Handing in-flight state to the next epoch's engine at a view change
//!
//! # Details
//!
//! Messages from a shard of `k` members are totally ordered by sequence
//! number `index * k + rank`, which interleaves the senders' FIFO streams.
//! A message becomes *locally stable* once received, *stable* once the shard
//! minimum of `seq_num` reaches it, and is *delivered* once the shard
//! minimum of `stable_num` does; delivery always releases the smallest
//! undelivered sequence number, so every member observes the same order.
//! A sender that has nothing to say can claim-and-skip slots ("pause turns")
//! so the total order does not wait on it.
//!
//! The [`Mailbox`] is used to make requests to the [`Engine`]: reserving and
//! committing sends (a two-phase producer interface with back-pressure),
//! flushing the ragged edge before a view change, and wedging. Wedging an
//! engine makes its task return a [`Handoff`], which the next epoch's
//! engine consumes to re-enqueue this node's unsent and undelivered
//! messages with fresh indices.

mod config;
pub use config::Config;
mod engine;
pub use engine::Engine;
mod handoff;
pub use handoff::Handoff;
mod ingress;
pub use ingress::Mailbox;
mod metrics;

#[cfg(test)]
pub mod mocks;
