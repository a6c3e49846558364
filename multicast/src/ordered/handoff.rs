//! In-flight message state carried from a wedged engine into its successor.

use crate::{
    types::{Epoch, GroupId, Header, Index, Rank, SeqNum, SubgroupId},
    Persistence, Writer,
};
use bytes::Bytes;
use commonware_codec::{FixedSize, ReadExt};
use std::collections::{BTreeMap, VecDeque};

/// A fixed-capacity buffer drawn from a subgroup's free list. Buffers are
/// moved, never copied: the free list, the send queues, the receive slots,
/// and the persistence parking lot exchange exclusive ownership.
pub(crate) struct MessageBuffer {
    pub data: Vec<u8>,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
        }
    }
}

/// A message in flight through the state machine. Placeholders (slots skipped
/// via pause turns) have `size == 0` and no buffer.
pub(crate) struct Message {
    /// Shard-local rank of the sender.
    pub sender_rank: Rank,

    /// Per-sender message index.
    pub index: Index,

    /// Total frame size (header plus payload); zero for placeholders.
    pub size: usize,

    pub buffer: Option<MessageBuffer>,
}

impl Message {
    pub fn placeholder(sender_rank: Rank, index: Index) -> Self {
        Self {
            sender_rank,
            index,
            size: 0,
            buffer: None,
        }
    }

    /// Decodes the header stamped on this message's buffer.
    pub fn header(&self) -> Option<Header> {
        let buffer = self.buffer.as_ref()?;
        Header::read(&mut &buffer.data[..]).ok()
    }

    /// Copy of the full frame, for posting to the bulk transport.
    pub fn frame(&self) -> Bytes {
        match &self.buffer {
            Some(buffer) => Bytes::copy_from_slice(&buffer.data[..self.size]),
            None => Bytes::new(),
        }
    }

    /// Copy of the payload past the header.
    pub fn payload(&self) -> Bytes {
        match &self.buffer {
            Some(buffer) if self.size > Header::SIZE => {
                Bytes::copy_from_slice(&buffer.data[Header::SIZE..self.size])
            }
            _ => Bytes::new(),
        }
    }
}

/// Residual state of a wedged engine, consumed by the next epoch's
/// constructor. Producing a `Handoff` is destructive: the old engine's task
/// returns it and can never run again.
pub struct Handoff<W: Writer> {
    /// The wedged epoch's group-id offset.
    pub(crate) group_offset: GroupId,

    /// The wedged epoch's member count; the successor offsets its group ids
    /// past this so the two epochs' identifiers never collide.
    pub(crate) member_count: usize,

    /// This node's shard rank per subgroup in the wedged epoch, used to tell
    /// its own undelivered messages from its peers'.
    pub(crate) ranks: BTreeMap<SubgroupId, Rank>,

    pub(crate) free_buffers: BTreeMap<SubgroupId, Vec<MessageBuffer>>,
    pub(crate) current_receives: BTreeMap<(SubgroupId, SeqNum), Message>,
    pub(crate) locally_stable: BTreeMap<SubgroupId, BTreeMap<SeqNum, Message>>,
    pub(crate) current_sends: BTreeMap<SubgroupId, Message>,
    pub(crate) pending_sends: BTreeMap<SubgroupId, VecDeque<Message>>,
    pub(crate) next_sends: BTreeMap<SubgroupId, Message>,

    /// Delivered messages still awaiting their persistence completion, moved
    /// intact (old epoch, old sequence keys).
    pub(crate) non_persistent: BTreeMap<SubgroupId, BTreeMap<SeqNum, (Epoch, Message)>>,

    /// The persistence writer and its completion feed, if configured.
    pub(crate) persistence: Option<Persistence<W>>,
}
