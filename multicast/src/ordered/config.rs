use crate::{
    types::{Algorithm, Epoch, NodeId},
    Application, Layout, Persistence, Writer,
};
use std::time::Duration;

/// Configuration for the [`Engine`](super::Engine), assembled by the view
/// manager for each epoch.
pub struct Config<L: Layout, A: Application, W: Writer> {
    /// This node's identifier.
    pub node_id: NodeId,

    /// Ordered member list of the epoch. A member's position is its row
    /// index in the shared state table.
    pub members: Vec<NodeId>,

    /// Epoch identifier, published as `vid` on the local row.
    pub epoch: Epoch,

    /// The membership service's shard function.
    pub layout: L,

    /// Delivery upcalls. Registered once, before the first delivery.
    pub application: A,

    /// Members the membership service had already marked failed when this
    /// epoch was constructed. If any are set, bulk groups are not formed and
    /// the engine stays unusable until the next view change.
    pub already_failed: Vec<bool>,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    /// Number of outstanding messages a sender may have before admission
    /// blocks on the slowest shard peer. Must be at least one.
    pub window_size: usize,

    /// The largest payload the application may send, in bytes.
    pub max_payload_size: usize,

    /// Block size handed to the bulk transport; the maximum message size is
    /// rounded up to a multiple of it.
    pub block_size: usize,

    /// Period of the liveness bit toggle on the local row.
    pub heartbeat: Duration,

    /// Fan-out schedule used by the bulk transport.
    pub algorithm: Algorithm,

    /// Optional persistence sink. Superseded by the handoff's writer when an
    /// engine is constructed from a previous epoch that carried one.
    pub persistence: Option<Persistence<W>>,
}
