//! Types shared across the multicast engine and its collaborators.

use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};

/// Identifier of a node, assigned by the membership service.
pub type NodeId = u32;

/// Identifier of an epoch (the `vid` published on every row).
///
/// An epoch is a maximal interval between membership changes; every engine
/// serves exactly one.
pub type Epoch = u64;

/// Index of a subgroup within an epoch's layout.
pub type SubgroupId = u32;

/// Shard-local index of a sender.
pub type Rank = u32;

/// Per-sender message index. Starts at zero and increases by one per claimed
/// slot (including slots skipped via pause turns).
pub type Index = i64;

/// Shard-global sequence number: `index * shard_size + rank`.
///
/// Counters derived from sequence numbers initialize to -1 ("nothing yet").
pub type SeqNum = i64;

/// Identifier of a bulk-transport group.
pub type GroupId = u32;

/// Computes the sequence number of a sender's `index`-th message in a shard
/// of `shard_size` members.
///
/// The interleaving yields a total order consistent with FIFO per sender.
pub const fn sequence(index: Index, shard_size: usize, rank: Rank) -> SeqNum {
    index * shard_size as i64 + rank as i64
}

/// Error that may be encountered when interacting with the multicast engine.
///
/// Admission errors are back-pressure: the caller is expected to retry once
/// the window drains, and the engine never logs them at error severity.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Admission (back-pressure)
    /// The engine has been wedged and accepts no further sends
    #[error("engine is wedged")]
    Wedged,
    /// Bulk-transport groups were not formed for this epoch
    #[error("bulk groups not formed")]
    GroupsUnformed,
    /// A shard peer's delivered (or persisted) counter lags by more than the window
    #[error("send window full for subgroup {0}")]
    WindowFull(SubgroupId),
    /// The subgroup's free buffer list is empty
    #[error("no free message buffers for subgroup {0}")]
    PoolExhausted(SubgroupId),

    // Producer contract
    /// The requested message exceeds the maximum message size
    #[error("message of {0} bytes exceeds maximum of {1}")]
    MessageTooLarge(usize, usize),
    /// This node is not a member of the named subgroup
    #[error("not a member of subgroup {0}")]
    UnknownSubgroup(SubgroupId),
    /// `send` was called without a matching reservation
    #[error("no reservation outstanding for subgroup {0}")]
    NoReservation(SubgroupId),
    /// The payload does not match the reserved size
    #[error("payload of {0} bytes does not match reservation of {1}")]
    PayloadSizeMismatch(usize, usize),

    // Collaborators
    /// The bulk transport refused to form a group
    #[error("bulk transport rejected group {0}")]
    GroupCreation(GroupId),
    /// The bulk transport failed to post a message
    #[error("bulk transport send failed on group {0}")]
    TransportSend(GroupId),
}

impl Error {
    /// Whether this error is back-pressure the caller may retry.
    pub const fn is_backpressure(&self) -> bool {
        matches!(
            self,
            Self::Wedged | Self::GroupsUnformed | Self::WindowFull(_) | Self::PoolExhausted(_)
        )
    }
}

/// Fan-out schedule used by the bulk transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    BinomialSend,
    ChainSend,
    SequentialSend,
    TreeSend,
}

/// Fixed-size prefix stamped on every message buffer.
///
/// `pause_sending_turns` lets a sender claim but skip slots so total order
/// can be established without transmitting empty messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// Number of per-sender slots the sender is skipping after this message.
    pub pause_sending_turns: u32,

    /// Whether delivery dispatches to the RPC upcall instead of the
    /// global-stability upcall.
    pub cooked: bool,
}

impl Write for Header {
    fn write(&self, writer: &mut impl BufMut) {
        (Self::SIZE as u32).write(writer);
        self.pause_sending_turns.write(writer);
        self.cooked.write(writer);
    }
}

impl Read for Header {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let header_size = u32::read(reader)?;
        if header_size != Self::SIZE as u32 {
            return Err(CodecError::Invalid("multicast::Header", "header size mismatch"));
        }
        let pause_sending_turns = u32::read(reader)?;
        let cooked = bool::read(reader)?;
        Ok(Self {
            pause_sending_turns,
            cooked,
        })
    }
}

impl FixedSize for Header {
    const SIZE: usize = u32::SIZE + u32::SIZE + bool::SIZE;
}

/// One member's row of the shared state table.
///
/// Rows are single-writer, many-reader: only the owning member mutates its
/// row, and publishes it atomically via [`crate::Table::put`]. All counters
/// initialize to -1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    /// Epoch identifier.
    pub vid: Epoch,

    /// Per-sender-slot highest locally received message index. The layout
    /// concatenates, across all subgroups in the epoch, `max_shard_members`
    /// slots per subgroup.
    pub num_received: Vec<SeqNum>,

    /// Per subgroup: highest sequence number for which this member has
    /// received every message at or below it from every shard sender.
    pub seq_num: Vec<SeqNum>,

    /// Per subgroup: minimum of `seq_num` across shard members observed so far.
    pub stable_num: Vec<SeqNum>,

    /// Per subgroup: highest sequence number delivered to the application.
    pub delivered_num: Vec<SeqNum>,

    /// Per subgroup: highest sequence number durably persisted.
    pub persisted_num: Vec<SeqNum>,

    /// Liveness bit toggled by the heartbeat loop.
    pub heartbeat: bool,
}

impl Row {
    /// Creates a fresh row for an epoch with `subgroups` subgroups and
    /// `slots` receive slots, with every counter at -1.
    pub fn new(vid: Epoch, subgroups: usize, slots: usize) -> Self {
        Self {
            vid,
            num_received: vec![-1; slots],
            seq_num: vec![-1; subgroups],
            stable_num: vec![-1; subgroups],
            delivered_num: vec![-1; subgroups],
            persisted_num: vec![-1; subgroups],
            heartbeat: false,
        }
    }
}

/// Events surfaced on a member's bulk-transport delivery feed.
///
/// The transport delivers each posted buffer to every group member exactly
/// once, in post order per group. An [`Delivery::Incoming`] event (the
/// receive-destination phase) always precedes its [`Delivery::Complete`];
/// the poster of a message observes only the completion.
#[derive(Clone, Debug)]
pub enum Delivery {
    /// A transfer began: the engine must reserve a destination buffer for
    /// `length` bytes.
    Incoming { group: GroupId, length: usize },

    /// A transfer finished.
    Complete { group: GroupId, payload: Bytes },
}

/// A message handed to the persistence writer after delivery.
#[derive(Clone, Debug)]
pub struct WriteRequest {
    pub epoch: Epoch,
    pub subgroup: SubgroupId,
    /// Shard-global sequence number, echoed back in the completion.
    pub seq: SeqNum,
    /// Node identifier of the original sender.
    pub sender: NodeId,
    pub sender_rank: Rank,
    pub index: Index,
    pub cooked: bool,
    pub payload: Bytes,
}

/// Completion reported by the persistence writer once a message is durable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Written {
    pub epoch: Epoch,
    pub subgroup: SubgroupId,
    pub seq: SeqNum,
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt, Encode};

    #[test]
    fn test_sequence_interleaving() {
        // Shard of three: sender 0 occupies 0, 3, 6, ...
        assert_eq!(sequence(0, 3, 0), 0);
        assert_eq!(sequence(1, 3, 0), 3);
        assert_eq!(sequence(2, 3, 0), 6);
        // ...while sender 2 occupies 2, 5, 8, ...
        assert_eq!(sequence(0, 3, 2), 2);
        assert_eq!(sequence(1, 3, 2), 5);
        // Negative indices are used for window arithmetic.
        assert_eq!(sequence(-2, 2, 1), -3);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            pause_sending_turns: 2,
            cooked: true,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), Header::SIZE);
        let decoded = Header::decode(encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_rejects_size_mismatch() {
        let mut encoded = Header::default().encode().to_vec();
        encoded[0] ^= 0xFF;
        assert!(Header::decode(encoded.as_ref()).is_err());
    }

    #[test]
    fn test_row_initialization() {
        let row = Row::new(7, 2, 5);
        assert_eq!(row.vid, 7);
        assert_eq!(row.num_received, vec![-1; 5]);
        assert_eq!(row.seq_num, vec![-1; 2]);
        assert_eq!(row.stable_num, vec![-1; 2]);
        assert_eq!(row.delivered_num, vec![-1; 2]);
        assert_eq!(row.persisted_num, vec![-1; 2]);
        assert!(!row.heartbeat);
    }
}
