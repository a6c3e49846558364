//! Virtually synchronous, totally-ordered atomic multicast for a process
//! group organized into subgroups and shards.
//!
//! # Overview
//!
//! Each shard of each subgroup runs an instance of the per-shard multicast
//! state machine implemented by [`ordered::Engine`]: sender admission,
//! receive bookkeeping, stability computation, in-order delivery,
//! window/credit control, and view-change handoff of in-flight messages.
//! The engine sits above a reliable bulk transport (which delivers a posted
//! buffer to every shard member exactly once) and a shared state table
//! (a replicated row store, one row per member, mutated only by its owner),
//! and below application-level replicated objects.
//!
//! The external collaborators are expressed as contracts: [`Table`] for the
//! shared state table, [`Transport`] for the bulk multicast, [`Layout`] for
//! the membership service's shard function, [`Application`] for delivery
//! upcalls, and [`Writer`] for the optional persistence sink. In-memory
//! implementations of the table and transport suitable for tests and
//! simulation live in [`simulated`].

use bytes::Bytes;
use futures::channel::mpsc;
use std::future::Future;

mod layout;
pub mod ordered;
pub mod simulated;
pub mod types;

use types::{
    Algorithm, Delivery, Error, GroupId, Index, NodeId, Rank, Row, SubgroupId, WriteRequest,
    Written,
};

/// Feed of member indices whose rows changed, emitted by the shared state
/// table. Replaces the table's predicate-dispatch threads: the engine
/// re-evaluates its recurrent predicates on every event.
pub type UpdateFeed = mpsc::UnboundedReceiver<u32>;

/// Feed of bulk-transport delivery events for one member.
pub type DeliveryFeed = mpsc::UnboundedReceiver<Delivery>;

/// The shared state table: a replicated row store with one row per member.
///
/// Rows are single-writer, many-reader. Updates by one member are observed
/// by others in publish order of that member's row; the engine relies on
/// this to pair counter advances with their stability implications.
pub trait Table: Send + 'static {
    /// Publish the local row to the named peers.
    ///
    /// Non-blocking fire-and-forget: the write is applied atomically (peers
    /// never observe a torn row) and ordered after every prior `put` by this
    /// member.
    fn put(&mut self, peers: &[u32], row: &Row) -> impl Future<Output = ()> + Send;

    /// Latest observed snapshot of a member's row.
    fn row(&self, member: u32) -> Row;

    /// Barrier across the group, used once at row initialization.
    fn sync(&mut self) -> impl Future<Output = ()> + Send;
}

/// The reliable bulk multicast: delivers a posted buffer to every group
/// member exactly once, surfacing [`Delivery`] events on each member's feed.
pub trait Transport: Send + 'static {
    /// Form a group over the given (ordered) members.
    ///
    /// Every member of the group is expected to create it under the same
    /// identifier.
    fn create_group(
        &mut self,
        group: GroupId,
        members: &[NodeId],
        block_size: usize,
        algorithm: Algorithm,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Post a buffer to a group. Non-blocking: completion is reported
    /// through the delivery feeds.
    fn send(&mut self, group: GroupId, message: Bytes) -> impl Future<Output = Result<(), Error>> + Send;

    /// Tear down a group. Destroying an identifier that was never created
    /// is a no-op.
    fn destroy_group(&mut self, group: GroupId) -> impl Future<Output = ()> + Send;
}

/// The membership service's shard function: a pure function of the member
/// list describing how each subgroup divides into shards.
pub trait Layout: Clone + Send + Sync + 'static {
    /// Number of subgroups laid out over a group of the given size.
    fn subgroups(&self, members: usize) -> u32;

    /// Shards of a subgroup, each an ordered list of members.
    fn shards(&self, members: &[NodeId], subgroup: SubgroupId) -> Vec<Vec<NodeId>>;
}

/// Delivery upcalls injected at construction.
///
/// All three are registered before the first message can be delivered and
/// never change for the lifetime of the engine.
pub trait Application: Clone + Send + 'static {
    /// A raw message reached global stability and is released in total order.
    fn deliver(
        &mut self,
        subgroup: SubgroupId,
        sender_rank: Rank,
        index: Index,
        payload: Bytes,
    ) -> impl Future<Output = ()> + Send;

    /// A cooked message reached global stability; dispatched to the RPC
    /// layer with the sender's node identifier.
    fn deliver_cooked(&mut self, sender: NodeId, payload: Bytes) -> impl Future<Output = ()> + Send;

    /// A delivered message was durably persisted by the writer.
    fn persisted(
        &mut self,
        subgroup: SubgroupId,
        sender_rank: Rank,
        index: Index,
        payload: Bytes,
    ) -> impl Future<Output = ()> + Send;
}

/// The persistence sink. Owns the on-disk format; reports durability
/// asynchronously through the completion feed of [`Persistence`].
pub trait Writer: Send + 'static {
    /// Queue a delivered message for durable storage.
    fn write(&mut self, request: WriteRequest) -> impl Future<Output = ()> + Send;
}

/// A persistence writer paired with its completion feed.
///
/// Moved across epochs by the view-change handoff so in-flight writes
/// complete against the engine that inherited their buffers.
pub struct Persistence<W: Writer> {
    pub writer: W,
    pub completions: mpsc::UnboundedReceiver<Written>,
}

/// Sink for [`Written`] completions, handed to a [`Writer`] at construction.
pub type CompletionSender = mpsc::UnboundedSender<Written>;
