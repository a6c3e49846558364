//! Test doubles for the engine's injected collaborators.

use crate::{
    types::{Index, NodeId, Rank, SubgroupId, WriteRequest, Written},
    Application, CompletionSender, Layout, Persistence, Writer,
};
use bytes::Bytes;
use futures::channel::mpsc;
use std::sync::{Arc, Mutex};

/// A delivery upcall observed by a [`Recorder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upcall {
    Raw {
        subgroup: SubgroupId,
        sender_rank: Rank,
        index: Index,
        payload: Bytes,
    },
    Cooked {
        sender: NodeId,
        payload: Bytes,
    },
    Persisted {
        subgroup: SubgroupId,
        sender_rank: Rank,
        index: Index,
        payload: Bytes,
    },
}

/// Records every upcall, in order, for later assertion.
#[derive(Clone, Default)]
pub struct Recorder {
    upcalls: Arc<Mutex<Vec<Upcall>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upcalls(&self) -> Vec<Upcall> {
        self.upcalls.lock().unwrap().clone()
    }

    /// Global-stability deliveries, in order.
    pub fn raw(&self) -> Vec<(SubgroupId, Rank, Index, Bytes)> {
        self.upcalls()
            .into_iter()
            .filter_map(|upcall| match upcall {
                Upcall::Raw {
                    subgroup,
                    sender_rank,
                    index,
                    payload,
                } => Some((subgroup, sender_rank, index, payload)),
                _ => None,
            })
            .collect()
    }

    /// RPC deliveries, in order.
    pub fn cooked(&self) -> Vec<(NodeId, Bytes)> {
        self.upcalls()
            .into_iter()
            .filter_map(|upcall| match upcall {
                Upcall::Cooked { sender, payload } => Some((sender, payload)),
                _ => None,
            })
            .collect()
    }

    /// Local-persistence upcalls, in order.
    pub fn persisted(&self) -> Vec<(SubgroupId, Rank, Index, Bytes)> {
        self.upcalls()
            .into_iter()
            .filter_map(|upcall| match upcall {
                Upcall::Persisted {
                    subgroup,
                    sender_rank,
                    index,
                    payload,
                } => Some((subgroup, sender_rank, index, payload)),
                _ => None,
            })
            .collect()
    }
}

impl Application for Recorder {
    async fn deliver(&mut self, subgroup: SubgroupId, sender_rank: Rank, index: Index, payload: Bytes) {
        self.upcalls.lock().unwrap().push(Upcall::Raw {
            subgroup,
            sender_rank,
            index,
            payload,
        });
    }

    async fn deliver_cooked(&mut self, sender: NodeId, payload: Bytes) {
        self.upcalls
            .lock()
            .unwrap()
            .push(Upcall::Cooked { sender, payload });
    }

    async fn persisted(&mut self, subgroup: SubgroupId, sender_rank: Rank, index: Index, payload: Bytes) {
        self.upcalls.lock().unwrap().push(Upcall::Persisted {
            subgroup,
            sender_rank,
            index,
            payload,
        });
    }
}

/// A persistence writer that records requests; durability is reported either
/// immediately or by the test through the returned completion sender.
pub struct MemoryWriter {
    log: Arc<Mutex<Vec<WriteRequest>>>,
    auto: Option<CompletionSender>,
}

impl MemoryWriter {
    /// A writer that reports durability as soon as a request lands.
    pub fn auto() -> (Persistence<Self>, Arc<Mutex<Vec<WriteRequest>>>) {
        let (sender, receiver) = mpsc::unbounded();
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Persistence {
                writer: Self {
                    log: log.clone(),
                    auto: Some(sender),
                },
                completions: receiver,
            },
            log,
        )
    }

    /// A writer whose completions the test drives by hand.
    pub fn manual() -> (
        Persistence<Self>,
        Arc<Mutex<Vec<WriteRequest>>>,
        CompletionSender,
    ) {
        let (sender, receiver) = mpsc::unbounded();
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Persistence {
                writer: Self {
                    log: log.clone(),
                    auto: None,
                },
                completions: receiver,
            },
            log,
            sender,
        )
    }
}

impl Writer for MemoryWriter {
    async fn write(&mut self, request: WriteRequest) {
        if let Some(completions) = &self.auto {
            let _ = completions.unbounded_send(Written {
                epoch: request.epoch,
                subgroup: request.subgroup,
                seq: request.seq,
            });
        }
        self.log.lock().unwrap().push(request);
    }
}

/// A fixed subgroup/shard assignment, restricted to the members present in
/// the epoch (so the same layout yields shrunken shards after a failure).
#[derive(Clone)]
pub struct StaticLayout {
    shards: Arc<Vec<Vec<Vec<NodeId>>>>,
}

impl StaticLayout {
    pub fn new(shards: Vec<Vec<Vec<NodeId>>>) -> Self {
        Self {
            shards: Arc::new(shards),
        }
    }

    /// One subgroup with one shard spanning the given members.
    pub fn single(members: Vec<NodeId>) -> Self {
        Self::new(vec![vec![members]])
    }
}

impl Layout for StaticLayout {
    fn subgroups(&self, _: usize) -> u32 {
        self.shards.len() as u32
    }

    fn shards(&self, members: &[NodeId], subgroup: SubgroupId) -> Vec<Vec<NodeId>> {
        self.shards[subgroup as usize]
            .iter()
            .map(|shard| {
                shard
                    .iter()
                    .copied()
                    .filter(|member| members.contains(member))
                    .collect()
            })
            .collect()
    }
}
