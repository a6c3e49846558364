use super::{
    handoff::{Handoff, Message, MessageBuffer},
    ingress::{Command, Mailbox},
    metrics, Config,
};
use crate::{
    layout::Placement,
    types::{
        sequence, Algorithm, Delivery, Epoch, Error, GroupId, Header, Index, NodeId, Rank, Row,
        SeqNum, SubgroupId, WriteRequest, Written,
    },
    Application, DeliveryFeed, Layout, Persistence, Table, Transport, UpdateFeed, Writer,
};
use bytes::Bytes;
use commonware_codec::{FixedSize, Write};
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use futures::{channel::mpsc, StreamExt};
use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};
use tracing::{debug, error, trace, warn};

/// Re-stamps a message inherited from a previous epoch with this epoch's
/// sender rank and the next per-sender index (consuming the pause turns its
/// header carries, exactly as a fresh reservation would).
fn convert(
    mut message: Message,
    rank: Rank,
    future_indices: &mut BTreeMap<SubgroupId, Index>,
    subgroup: SubgroupId,
) -> Message {
    let index = future_indices.get_mut(&subgroup).unwrap();
    message.sender_rank = rank;
    message.index = *index;
    let pause = message
        .header()
        .map(|header| header.pause_sending_turns)
        .unwrap_or(0);
    *index += 1 + pause as i64;
    message
}

/// The per-shard multicast state machine for one epoch.
///
/// It is responsible for:
/// - Admitting application sends against the window and buffer pool
/// - Posting pending messages to the bulk transport, round-robin across
///   subgroups, one at a time
/// - Receive bookkeeping and publication of the monotonic counter family
///   (`num_received`, `seq_num`, `stable_num`, `delivered_num`,
///   `persisted_num`) on the shared state table
/// - Delivering messages to the application in total order, exactly once
/// - Handing in-flight messages to its successor at a view change
pub struct Engine<E: Clock + Spawner + RuntimeMetrics, A: Application, W: Writer> {
    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    context: E,
    application: A,

    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    epoch: Epoch,
    members: Vec<NodeId>,
    member_index: u32,
    window_size: usize,
    max_msg_size: usize,
    block_size: usize,
    heartbeat: Duration,
    algorithm: Algorithm,
    already_failed: bool,
    placement: Placement,
    group_offset: GroupId,

    ////////////////////////////////////////
    // Messaging
    ////////////////////////////////////////
    mailbox_receiver: mpsc::Receiver<Command>,

    ////////////////////////////////////////
    // Persistence
    ////////////////////////////////////////
    writer: Option<W>,
    completions: mpsc::UnboundedReceiver<Written>,
    /// Keeps the dummy completion feed open when no writer is configured.
    _completions_keepalive: Option<mpsc::UnboundedSender<Written>>,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    /// The local row, mirrored here and published on change.
    row: Row,
    groups_formed: bool,
    sender_failed: bool,
    wedged: bool,
    free_buffers: BTreeMap<SubgroupId, Vec<MessageBuffer>>,
    next_sends: BTreeMap<SubgroupId, Message>,
    pending_sends: BTreeMap<SubgroupId, VecDeque<Message>>,
    current_sends: BTreeMap<SubgroupId, Message>,
    current_receives: BTreeMap<(SubgroupId, SeqNum), Message>,
    locally_stable: BTreeMap<SubgroupId, BTreeMap<SeqNum, Message>>,
    non_persistent: BTreeMap<SubgroupId, BTreeMap<SeqNum, (Epoch, Message)>>,
    future_indices: BTreeMap<SubgroupId, Index>,
    /// Send credit per subgroup: the smallest own index not yet delivered
    /// (and, with persistence, persisted) on every shard peer. Admission and
    /// dispatch gate on it.
    next_to_deliver: BTreeMap<SubgroupId, Index>,
    last_dispatched: usize,

    ////////////////////////////////////////
    // Metrics
    ////////////////////////////////////////
    metrics: metrics::Metrics,
}

impl<E: Clock + Spawner + RuntimeMetrics, A: Application + Sync, W: Writer + Sync> Engine<E, A, W> {
    /// Creates an engine for a fresh epoch. Returns the engine and a mailbox
    /// for sending commands to it.
    pub fn new<L: Layout>(context: E, cfg: Config<L, A, W>) -> (Self, Mailbox) {
        Self::build(context, cfg, None)
    }

    /// Creates an engine for a new epoch from the residue of the previous
    /// one: buffers are reclaimed, this node's undelivered and unsent
    /// messages are re-enqueued with fresh indices, and parked persistence
    /// state is carried across. The group-id range is offset past the old
    /// epoch's so transport identifiers never collide during teardown.
    pub fn inherit<L: Layout>(
        context: E,
        cfg: Config<L, A, W>,
        previous: Handoff<W>,
    ) -> (Self, Mailbox) {
        Self::build(context, cfg, Some(previous))
    }

    fn build<L: Layout>(
        context: E,
        cfg: Config<L, A, W>,
        previous: Option<Handoff<W>>,
    ) -> (Self, Mailbox) {
        assert!(cfg.window_size >= 1, "window must admit at least one message");
        let member_index = cfg
            .members
            .iter()
            .position(|member| *member == cfg.node_id)
            .expect("local node missing from member list") as u32;
        let group_offset = previous
            .as_ref()
            .map(|handoff| handoff.group_offset + handoff.member_count as GroupId)
            .unwrap_or(0);
        let placement = Placement::new(&cfg.layout, &cfg.members, cfg.node_id, group_offset);
        let max_msg_size = Self::max_message_size(cfg.max_payload_size, cfg.block_size);

        let mut free_buffers: BTreeMap<SubgroupId, Vec<MessageBuffer>> = BTreeMap::new();
        let mut pending_sends: BTreeMap<SubgroupId, VecDeque<Message>> = BTreeMap::new();
        let mut next_sends: BTreeMap<SubgroupId, Message> = BTreeMap::new();
        let mut locally_stable: BTreeMap<SubgroupId, BTreeMap<SeqNum, Message>> = BTreeMap::new();
        let mut non_persistent: BTreeMap<SubgroupId, BTreeMap<SeqNum, (Epoch, Message)>> =
            BTreeMap::new();
        let mut future_indices: BTreeMap<SubgroupId, Index> = BTreeMap::new();
        let mut next_to_deliver: BTreeMap<SubgroupId, Index> = BTreeMap::new();
        for subgroup in placement.local.keys() {
            free_buffers.insert(*subgroup, Vec::new());
            pending_sends.insert(*subgroup, VecDeque::new());
            locally_stable.insert(*subgroup, BTreeMap::new());
            future_indices.insert(*subgroup, 0);
            next_to_deliver.insert(*subgroup, 0);
        }

        let mut persistence = cfg.persistence;
        if let Some(mut handoff) = previous {
            // The writer follows the handoff: in-flight writes must complete
            // against the engine that inherited their buffers.
            if handoff.persistence.is_some() {
                persistence = handoff.persistence.take();
            }

            // Reclaim the old free lists and any transfers interrupted
            // mid-flight.
            for (subgroup, pool) in std::mem::take(&mut handoff.free_buffers) {
                if let Some(target) = free_buffers.get_mut(&subgroup) {
                    target.extend(pool);
                }
            }
            for ((subgroup, _), message) in std::mem::take(&mut handoff.current_receives) {
                if let (Some(pool), Some(buffer)) = (free_buffers.get_mut(&subgroup), message.buffer)
                {
                    pool.push(buffer);
                }
            }

            // Locally-stable but undelivered messages are assumed failed: if
            // this node was the sender, re-attempt; otherwise discard (the
            // sender, if alive, retransmits). Ascending sequence order keeps
            // FIFO per sender. Placeholders are dropped: a re-enqueued
            // message's header re-applies its pause turns.
            for (subgroup, stable) in std::mem::take(&mut handoff.locally_stable) {
                let old_rank = handoff.ranks.get(&subgroup).copied();
                for (_, message) in stable {
                    if message.size == 0 {
                        continue;
                    }
                    match (placement.local.get(&subgroup), old_rank) {
                        (Some(local), Some(rank)) if message.sender_rank == rank => {
                            let message =
                                convert(message, local.rank, &mut future_indices, subgroup);
                            pending_sends.get_mut(&subgroup).unwrap().push_back(message);
                        }
                        _ => {
                            if let (Some(pool), Some(buffer)) =
                                (free_buffers.get_mut(&subgroup), message.buffer)
                            {
                                pool.push(buffer);
                            }
                        }
                    }
                }
            }

            // In-progress and queued sends are re-attempted; an outstanding
            // reservation is carried forward.
            for (subgroup, local) in &placement.local {
                let rank = local.rank;
                if let Some(message) = handoff.current_sends.remove(subgroup) {
                    let message = convert(message, rank, &mut future_indices, *subgroup);
                    pending_sends.get_mut(subgroup).unwrap().push_back(message);
                }
                if let Some(queue) = handoff.pending_sends.remove(subgroup) {
                    for message in queue {
                        let message = convert(message, rank, &mut future_indices, *subgroup);
                        pending_sends.get_mut(subgroup).unwrap().push_back(message);
                    }
                }
                if let Some(message) = handoff.next_sends.remove(subgroup) {
                    let message = convert(message, rank, &mut future_indices, *subgroup);
                    next_sends.insert(*subgroup, message);
                }
            }

            // Parked persistence state moves intact, old epoch tags and
            // sequence keys included.
            non_persistent = std::mem::take(&mut handoff.non_persistent);
        }

        // Size each pool for this epoch's shards.
        for (subgroup, local) in &placement.local {
            let pool = free_buffers.get_mut(subgroup).unwrap();
            let target = cfg.window_size * local.members.len();
            while pool.len() < target {
                pool.push(MessageBuffer::new(max_msg_size));
            }
        }

        let (writer, completions, keepalive) = match persistence {
            Some(persistence) => (Some(persistence.writer), persistence.completions, None),
            None => {
                let (sender, receiver) = mpsc::unbounded();
                (None, receiver, Some(sender))
            }
        };

        let (mailbox_sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let mailbox = Mailbox::new(mailbox_sender);
        let metrics = metrics::Metrics::init(context.clone());

        let row = Row::new(cfg.epoch, placement.subgroups, placement.slots);
        let already_failed = cfg.already_failed.iter().any(|failed| *failed);

        let engine = Self {
            context,
            application: cfg.application,
            epoch: cfg.epoch,
            members: cfg.members,
            member_index,
            window_size: cfg.window_size,
            max_msg_size,
            block_size: cfg.block_size,
            heartbeat: cfg.heartbeat,
            algorithm: cfg.algorithm,
            already_failed,
            placement,
            group_offset,
            mailbox_receiver,
            writer,
            completions,
            _completions_keepalive: keepalive,
            row,
            groups_formed: false,
            sender_failed: false,
            wedged: false,
            free_buffers,
            next_sends,
            pending_sends,
            current_sends: BTreeMap::new(),
            current_receives: BTreeMap::new(),
            locally_stable,
            non_persistent,
            future_indices,
            next_to_deliver,
            last_dispatched: 0,
            metrics,
        };

        (engine, mailbox)
    }

    /// Maximum message size: the largest payload plus the header, rounded up
    /// to a multiple of the bulk-transport block size.
    fn max_message_size(max_payload_size: usize, block_size: usize) -> usize {
        (max_payload_size + Header::SIZE).div_ceil(block_size) * block_size
    }

    /// Starts the engine over its collaborators: the shared state table with
    /// its update feed, and the bulk transport with this member's delivery
    /// feed. The returned handle resolves to the engine's [`Handoff`] once
    /// it has been wedged.
    pub fn start(
        mut self,
        sst: (impl Table, UpdateFeed),
        transport: (impl Transport, DeliveryFeed),
    ) -> Handle<Handoff<W>> {
        self.context.spawn_ref()(self.run(sst, transport))
    }

    async fn run(
        mut self,
        sst: (impl Table, UpdateFeed),
        transport: (impl Transport, DeliveryFeed),
    ) -> Handoff<W> {
        let (mut table, mut updates) = sst;
        let (mut transport, mut deliveries) = transport;

        self.groups_formed = !self.already_failed && self.create_groups(&mut transport).await;
        if !self.groups_formed {
            warn!(
                epoch = self.epoch,
                "bulk groups not formed; engine unusable until the next view"
            );
        }

        // Publish the fresh row and wait for every member to do the same.
        let everyone = self.everyone();
        table.put(&everyone, &self.row).await;
        table.sync().await;
        debug!(
            epoch = self.epoch,
            member = self.member_index,
            "row initialized"
        );

        let mut shutdown = self.context.stopped();
        let mut heartbeat_deadline = self.context.current() + self.heartbeat;

        while !self.wedged {
            self.metrics.pending.set(
                self.pending_sends
                    .values()
                    .map(VecDeque::len)
                    .sum::<usize>() as i64,
            );
            self.metrics.backlog.set(
                self.locally_stable
                    .values()
                    .map(BTreeMap::len)
                    .sum::<usize>() as i64,
            );

            select! {
                // Handle runtime shutdown
                _ = &mut shutdown => {
                    debug!("shutdown");
                    self.wedge(&mut transport).await;
                },

                // Handle mailbox commands
                command = self.mailbox_receiver.next() => {
                    match command {
                        Some(command) => {
                            self.handle_command(command, &mut transport).await;
                        }
                        None => {
                            // Every mailbox was dropped; treat as a wedge.
                            self.wedge(&mut transport).await;
                        }
                    }
                },

                // Handle bulk-transport deliveries
                delivery = deliveries.next() => {
                    let Some(delivery) = delivery else {
                        error!("delivery feed closed");
                        self.wedge(&mut transport).await;
                        continue;
                    };
                    self.handle_delivery(delivery, &mut table).await;
                },

                // Re-evaluate the recurrent predicates on any row change
                update = updates.next() => {
                    let Some(member) = update else {
                        error!("update feed closed");
                        self.wedge(&mut transport).await;
                        continue;
                    };
                    trace!(member, "row update");
                    self.evaluate(&mut table).await;
                },

                // Handle persistence completions
                completion = self.completions.next() => {
                    match completion {
                        Some(written) => self.handle_written(written, &mut table).await,
                        None => {
                            self.abandon_persistence();
                            // The window predicate no longer waits on
                            // persistence; re-grant credit now.
                            self.evaluate(&mut table).await;
                        }
                    }
                },

                // Toggle the liveness bit
                _ = self.context.sleep_until(heartbeat_deadline) => {
                    heartbeat_deadline = self.context.current() + self.heartbeat;
                    self.row.heartbeat = !self.row.heartbeat;
                    let everyone = self.everyone();
                    table.put(&everyone, &self.row).await;
                },
            }

            self.dispatch(&mut transport).await;
        }

        self.into_handoff()
    }

    ////////////////////////////////////////
    // Handling
    ////////////////////////////////////////

    async fn handle_command(&mut self, command: Command, transport: &mut impl Transport) {
        match command {
            Command::Reserve {
                subgroup,
                payload_size,
                pause_turns,
                cooked,
                responder,
            } => {
                trace!(subgroup, "mailbox: reserve");
                let result = self.reserve(subgroup, payload_size, pause_turns, cooked);
                if let Err(err) = &result {
                    if err.is_backpressure() {
                        self.metrics.rejected.inc();
                    }
                }
                let _ = responder.send(result);
            }
            Command::Send {
                subgroup,
                payload,
                responder,
            } => {
                trace!(subgroup, "mailbox: send");
                let _ = responder.send(self.commit(subgroup, payload));
            }
            Command::DeliverUpto {
                subgroup,
                max_indices,
                responder,
            } => {
                debug!(subgroup, "mailbox: deliver up to");
                self.deliver_upto(subgroup, max_indices).await;
                let _ = responder.send(());
            }
            Command::Wedge { responder } => {
                self.wedge(transport).await;
                let _ = responder.send(());
            }
        }
    }

    /// Admission for the next send slot of `subgroup`. Refusals are typed
    /// back-pressure errors the caller retries.
    fn reserve(
        &mut self,
        subgroup: SubgroupId,
        payload_size: usize,
        pause_turns: u32,
        cooked: bool,
    ) -> Result<(), Error> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        if !self.groups_formed {
            return Err(Error::GroupsUnformed);
        }
        if !self.placement.local.contains_key(&subgroup) {
            return Err(Error::UnknownSubgroup(subgroup));
        }
        let msg_size = Header::SIZE + payload_size;
        if msg_size > self.max_msg_size {
            warn!(
                subgroup,
                size = msg_size,
                max = self.max_msg_size,
                "requested message exceeds maximum size"
            );
            return Err(Error::MessageTooLarge(msg_size, self.max_msg_size));
        }

        // A repeated reservation replaces the previous one and reclaims its
        // index, so the slot admitted below is the one the superseded
        // reservation held. The rollback itself happens only once admission
        // succeeds; a refused overwrite leaves the first reservation alone.
        let superseded = self.next_sends.get(&subgroup).map(|previous| {
            1 + previous
                .header()
                .map(|header| header.pause_sending_turns)
                .unwrap_or(0) as i64
        });
        let index = self.future_indices[&subgroup] - superseded.unwrap_or(0);

        // Window: the claimed slot must be within the credit granted by the
        // window predicate.
        let rank = self.placement.local[&subgroup].rank;
        if index - self.next_to_deliver[&subgroup] >= self.window_size as i64 {
            return Err(Error::WindowFull(subgroup));
        }
        if self.free_buffers[&subgroup].is_empty() && superseded.is_none() {
            return Err(Error::PoolExhausted(subgroup));
        }

        // Admitted: roll back the superseded reservation, if any.
        if let Some(previous) = self.next_sends.remove(&subgroup) {
            debug!(subgroup, index = previous.index, "reservation overwritten");
            if let Some(buffer) = previous.buffer {
                self.free_buffers.get_mut(&subgroup).unwrap().push(buffer);
            }
        }
        let pool = self.free_buffers.get_mut(&subgroup).unwrap();
        let mut buffer = pool.pop().unwrap(); // checked above

        // Stamp the header and park the reservation.
        let header = Header {
            pause_sending_turns: pause_turns,
            cooked,
        };
        let mut prefix = &mut buffer.data[..Header::SIZE];
        header.write(&mut prefix);
        self.next_sends.insert(
            subgroup,
            Message {
                sender_rank: rank,
                index,
                size: msg_size,
                buffer: Some(buffer),
            },
        );
        *self.future_indices.get_mut(&subgroup).unwrap() = index + 1 + pause_turns as i64;
        trace!(subgroup, index, "reserved send slot");
        Ok(())
    }

    /// Commits the outstanding reservation with its payload.
    fn commit(&mut self, subgroup: SubgroupId, payload: Bytes) -> Result<(), Error> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        if !self.groups_formed {
            return Err(Error::GroupsUnformed);
        }
        let Some(message) = self.next_sends.get_mut(&subgroup) else {
            return Err(Error::NoReservation(subgroup));
        };
        let expected = message.size - Header::SIZE;
        if payload.len() != expected {
            return Err(Error::PayloadSizeMismatch(payload.len(), expected));
        }
        let buffer = message.buffer.as_mut().unwrap(); // reservations always carry a buffer
        buffer.data[Header::SIZE..Header::SIZE + expected].copy_from_slice(&payload);
        let message = self.next_sends.remove(&subgroup).unwrap();
        trace!(subgroup, index = message.index, "send committed");
        self.pending_sends
            .get_mut(&subgroup)
            .unwrap()
            .push_back(message);
        Ok(())
    }

    /// Posts every dispatchable pending message, round-robin across
    /// subgroups starting past the last one served, one at a time.
    async fn dispatch(&mut self, transport: &mut impl Transport) {
        if self.wedged || self.sender_failed || !self.groups_formed {
            return;
        }
        let subgroups: Vec<SubgroupId> = self.placement.local.keys().copied().collect();
        if subgroups.is_empty() {
            return;
        }
        loop {
            let mut chosen = None;
            for step in 1..=subgroups.len() {
                let position = (self.last_dispatched + step) % subgroups.len();
                if self.dispatchable(subgroups[position]) {
                    chosen = Some(position);
                    break;
                }
            }
            let Some(position) = chosen else {
                break;
            };
            self.last_dispatched = position;
            let subgroup = subgroups[position];
            let message = self
                .pending_sends
                .get_mut(&subgroup)
                .unwrap()
                .pop_front()
                .unwrap();
            let frame = message.frame();
            let group = self.placement.send_groups[&subgroup];
            debug!(subgroup, index = message.index, "posting message");
            debug_assert!(!self.current_sends.contains_key(&subgroup));
            self.current_sends.insert(subgroup, message);
            if let Err(err) = transport.send(group, frame).await {
                // Fatal for the send path; the engine is replaced at the
                // next view change.
                error!(?err, subgroup, "bulk transport send failed");
                self.sender_failed = true;
                return;
            }
            self.metrics.sent.inc();
        }
    }

    /// Whether the head of a subgroup's pending queue may be posted.
    fn dispatchable(&self, subgroup: SubgroupId) -> bool {
        let local = &self.placement.local[&subgroup];
        let Some(message) = self.pending_sends[&subgroup].front() else {
            return false;
        };
        // FIFO: our own receipt of the previous message must have landed.
        let own_slot = local.received_offset + local.rank as usize;
        if self.row.num_received[own_slot] < message.index - 1 {
            return false;
        }
        // Window credit granted by the window predicate.
        message.index - self.next_to_deliver[&subgroup] < self.window_size as i64
    }

    async fn handle_delivery(&mut self, delivery: Delivery, table: &mut impl Table) {
        match delivery {
            Delivery::Incoming { group, length } => self.handle_incoming(group, length),
            Delivery::Complete { group, payload } => {
                self.handle_complete(group, payload, table).await
            }
        }
    }

    /// The receive-destination phase: reserve a buffer for an incoming
    /// transfer. Never invoked for own-sent messages.
    fn handle_incoming(&mut self, group: GroupId, length: usize) {
        let Some(&(subgroup, sender)) = self.placement.routes.get(&group) else {
            warn!(group, "delivery for unknown group");
            return;
        };
        let local = &self.placement.local[&subgroup];
        let (received_offset, shard_size) = (local.received_offset, local.members.len());
        // Transfers on one group are sequential, so the next incoming
        // message is always the sender's next unreceived index.
        let index = self.row.num_received[received_offset + sender as usize] + 1;
        let seq = sequence(index, shard_size, sender);
        let Some(buffer) = self
            .free_buffers
            .get_mut(&subgroup)
            .and_then(|pool| pool.pop())
        else {
            // The window guarantees a receiver-side buffer per in-flight
            // message; running dry means a peer ignored its window.
            error!(subgroup, sender, "no free buffer for incoming message");
            return;
        };
        self.current_receives.insert(
            (subgroup, seq),
            Message {
                sender_rank: sender,
                index,
                size: length,
                buffer: Some(buffer),
            },
        );
    }

    /// The receive-complete phase: account the message, absorb pause turns,
    /// and publish the advanced counters in one atomic row write.
    async fn handle_complete(&mut self, group: GroupId, payload: Bytes, table: &mut impl Table) {
        let Some(&(subgroup, sender)) = self.placement.routes.get(&group) else {
            warn!(group, "completion for unknown group");
            return;
        };
        let (received_offset, shard_size, rank) = {
            let local = &self.placement.local[&subgroup];
            (local.received_offset, local.members.len(), local.rank)
        };
        let slot = received_offset + sender as usize;
        let index = self.row.num_received[slot] + 1;
        let seq = sequence(index, shard_size, sender);

        let message = if sender == rank {
            // Own message: the buffer never left current_sends.
            let Some(message) = self.current_sends.remove(&subgroup) else {
                error!(subgroup, "own completion without a posted message");
                return;
            };
            message
        } else {
            let Some(mut message) = self.current_receives.remove(&(subgroup, seq)) else {
                error!(subgroup, seq, "completion without a destination");
                return;
            };
            // The transfer lands in the reserved buffer.
            let buffer = message.buffer.as_mut().unwrap(); // receive slots always carry a buffer
            buffer.data[..payload.len()].copy_from_slice(&payload);
            message.size = payload.len();
            message
        };
        debug!(subgroup, sender, index, "received message");

        let header = message.header().unwrap_or_default();
        self.row.num_received[slot] = index;
        self.locally_stable
            .get_mut(&subgroup)
            .unwrap()
            .insert(seq, message);
        self.metrics.received.inc();

        // A placeholder per slot the sender is skipping, so total order can
        // be established without transmitting empty messages.
        let mut skipped_index = index;
        let mut skipped_seq = seq;
        for _ in 0..header.pause_sending_turns {
            skipped_index += 1;
            skipped_seq += shard_size as i64;
            self.row.num_received[slot] = skipped_index;
            self.locally_stable
                .get_mut(&subgroup)
                .unwrap()
                .insert(skipped_seq, Message::placeholder(sender, skipped_index));
            self.metrics.placeholders.inc();
        }

        // The largest sequence number below which every shard sender is
        // fully accounted for.
        let received = &self.row.num_received[received_offset..received_offset + shard_size];
        let (argmin, min) = received
            .iter()
            .enumerate()
            .min_by_key(|(_, value)| **value)
            .map(|(position, value)| (position, *value))
            .unwrap();
        let new_seq_num = (min + 1) * shard_size as i64 + argmin as i64 - 1;
        let sg = subgroup as usize;
        if new_seq_num > self.row.seq_num[sg] {
            debug!(subgroup, seq_num = new_seq_num, "advancing seq_num");
            self.row.seq_num[sg] = new_seq_num;
        }
        // One atomic row publish pairs the counter advance with its
        // stability implication.
        table
            .put(&self.placement.local[&subgroup].table_indices, &self.row)
            .await;
        self.evaluate(table).await;
    }

    ////////////////////////////////////////
    // Recurrent predicates
    ////////////////////////////////////////

    /// Re-evaluates stability, delivery, and window credit for every
    /// subgroup this node belongs to.
    async fn evaluate(&mut self, table: &mut impl Table) {
        let subgroups: Vec<SubgroupId> = self.placement.local.keys().copied().collect();
        for subgroup in subgroups {
            self.evaluate_stability(subgroup, table).await;
            self.evaluate_delivery(subgroup, table).await;
            self.evaluate_credit(subgroup, table);
        }
    }

    /// `stable_num` is the minimum of `seq_num` across the shard.
    async fn evaluate_stability(&mut self, subgroup: SubgroupId, table: &mut impl Table) {
        let sg = subgroup as usize;
        let min_seq = self.placement.local[&subgroup]
            .table_indices
            .iter()
            .map(|peer| table.row(*peer).seq_num[sg])
            .min()
            .unwrap();
        if min_seq > self.row.stable_num[sg] {
            debug!(subgroup, stable = min_seq, "advancing stable_num");
            self.row.stable_num[sg] = min_seq;
            table
                .put(&self.placement.local[&subgroup].table_indices, &self.row)
                .await;
        }
    }

    /// Delivers every locally-stable message at or below the shard's minimum
    /// `stable_num`, smallest sequence number first.
    async fn evaluate_delivery(&mut self, subgroup: SubgroupId, table: &mut impl Table) {
        let sg = subgroup as usize;
        let min_stable = self.placement.local[&subgroup]
            .table_indices
            .iter()
            .map(|peer| table.row(*peer).stable_num[sg])
            .min()
            .unwrap();
        loop {
            let entry = {
                let stable = self.locally_stable.get_mut(&subgroup).unwrap();
                match stable.first_key_value() {
                    Some((&seq, _)) if seq <= min_stable => stable.pop_first(),
                    _ => None,
                }
            };
            let Some((seq, message)) = entry else {
                break;
            };
            self.deliver(subgroup, seq, message).await;
            self.row.delivered_num[sg] = seq;
            table
                .put(&self.placement.local[&subgroup].table_indices, &self.row)
                .await;
        }
    }

    /// Window credit: advances `next_to_deliver` while every shard peer has
    /// delivered (and, with persistence, persisted) our message at that
    /// slot. Admission and dispatch gate on the granted credit, so this is
    /// the one place peer rows decide the window; it is decoupled from
    /// delivery so a slow persister cannot stall delivery itself.
    fn evaluate_credit(&mut self, subgroup: SubgroupId, table: &impl Table) {
        let local = &self.placement.local[&subgroup];
        let (rank, shard_size) = (local.rank, local.members.len());
        let sg = subgroup as usize;
        let mut next = self.next_to_deliver[&subgroup];
        loop {
            let target = sequence(next, shard_size, rank);
            let granted = local.table_indices.iter().all(|peer| {
                let row = table.row(*peer);
                row.delivered_num[sg] >= target
                    && (self.writer.is_none() || row.persisted_num[sg] >= target)
            });
            if !granted {
                break;
            }
            next += 1;
        }
        self.next_to_deliver.insert(subgroup, next);
    }

    ////////////////////////////////////////
    // Delivery
    ////////////////////////////////////////

    /// Releases one message to the application. Raw messages invoke the
    /// global-stability upcall, cooked messages the RPC upcall, and
    /// placeholders nothing at all; with persistence enabled the buffer is
    /// parked until the writer reports it durable.
    async fn deliver(&mut self, subgroup: SubgroupId, seq: SeqNum, mut message: Message) {
        if message.size == 0 {
            trace!(subgroup, seq, "skipping placeholder");
            return;
        }
        let header = message.header().unwrap_or_default();
        let payload = message.payload();
        let sender = self.placement.local[&subgroup].members[message.sender_rank as usize];
        debug!(
            subgroup,
            seq,
            sender = message.sender_rank,
            index = message.index,
            "delivering message"
        );
        if header.cooked {
            self.application
                .deliver_cooked(sender, payload.clone())
                .await;
        } else {
            self.application
                .deliver(subgroup, message.sender_rank, message.index, payload.clone())
                .await;
        }
        self.metrics.delivered.get_or_create(&subgroup.into()).inc();

        if self.writer.is_some() {
            let request = WriteRequest {
                epoch: self.epoch,
                subgroup,
                seq,
                sender,
                sender_rank: message.sender_rank,
                index: message.index,
                cooked: header.cooked,
                payload,
            };
            self.non_persistent
                .entry(subgroup)
                .or_default()
                .insert(seq, (self.epoch, message));
            self.writer.as_mut().unwrap().write(request).await; // checked above
        } else if let Some(buffer) = message.buffer.take() {
            self.free_buffers.get_mut(&subgroup).unwrap().push(buffer);
        }
    }

    /// Flushes remaining locally-stable messages up to per-sender bounds
    /// without advancing `delivered_num`; terminal for the epoch.
    async fn deliver_upto(&mut self, subgroup: SubgroupId, max_indices: Vec<Index>) {
        let Some(local) = self.placement.local.get(&subgroup) else {
            warn!(subgroup, "deliver up to unknown subgroup");
            return;
        };
        let shard_size = local.members.len();
        if max_indices.len() != shard_size {
            warn!(subgroup, "per-sender bounds do not match shard size");
            return;
        }
        let sg = subgroup as usize;
        let mut max_seq = self.row.delivered_num[sg];
        for (sender, index) in max_indices.iter().enumerate() {
            max_seq = max_seq.max(sequence(*index, shard_size, sender as Rank));
        }
        let mut seq = self.row.delivered_num[sg];
        while seq <= max_seq {
            let message = self.locally_stable.get_mut(&subgroup).unwrap().remove(&seq);
            if let Some(message) = message {
                self.deliver(subgroup, seq, message).await;
            }
            seq += 1;
        }
    }

    ////////////////////////////////////////
    // Persistence
    ////////////////////////////////////////

    /// A delivered message became durable: fire the local-persistence
    /// upcall, reclaim the buffer, and (for this epoch's messages) advance
    /// `persisted_num`.
    async fn handle_written(&mut self, written: Written, table: &mut impl Table) {
        let entry = self
            .non_persistent
            .get_mut(&written.subgroup)
            .and_then(|parked| parked.remove(&written.seq));
        let Some((epoch, mut message)) = entry else {
            warn!(
                subgroup = written.subgroup,
                seq = written.seq,
                "completion for unknown message"
            );
            return;
        };
        let payload = message.payload();
        self.application
            .persisted(written.subgroup, message.sender_rank, message.index, payload)
            .await;
        if let Some(buffer) = message.buffer.take() {
            self.free_buffers
                .entry(written.subgroup)
                .or_default()
                .push(buffer);
        }
        self.metrics.persisted.inc();

        if epoch != self.epoch {
            // Inherited from a previous epoch: its numbering is meaningless
            // under this epoch's shards.
            debug!(
                epoch,
                seq = written.seq,
                "persisted message from a previous epoch"
            );
            return;
        }
        let sg = written.subgroup as usize;
        if written.seq > self.row.persisted_num[sg] {
            self.row.persisted_num[sg] = written.seq;
            if let Some(local) = self.placement.local.get(&written.subgroup) {
                table.put(&local.table_indices, &self.row).await;
            }
            // Our own persistence progress is part of the window predicate's
            // input.
            self.evaluate(table).await;
        }
    }

    /// The completion feed closed: the writer can never again report a
    /// message durable. Surface the failure, stop gating the window on
    /// `persisted_num`, and reclaim the parked buffers; the engine keeps
    /// delivering without persistence until it is replaced at the next view.
    fn abandon_persistence(&mut self) {
        if self.writer.take().is_some() {
            let abandoned: usize = self.non_persistent.values().map(BTreeMap::len).sum();
            error!(abandoned, "persistence writer failed; dropping persistence");
        }
        for (subgroup, parked) in std::mem::take(&mut self.non_persistent) {
            for (_, (_, mut message)) in parked {
                if let Some(buffer) = message.buffer.take() {
                    self.free_buffers.entry(subgroup).or_default().push(buffer);
                }
            }
        }
        // Park a fresh feed so this arm stays quiet.
        let (sender, receiver) = mpsc::unbounded();
        self.completions = receiver;
        self._completions_keepalive = Some(sender);
    }

    ////////////////////////////////////////
    // Lifecycle
    ////////////////////////////////////////

    async fn create_groups(&self, transport: &mut impl Transport) -> bool {
        for group in &self.placement.groups {
            if let Err(err) = transport
                .create_group(group.id, &group.members, self.block_size, self.algorithm)
                .await
            {
                warn!(
                    ?err,
                    group = group.id,
                    subgroup = group.subgroup,
                    "bulk group creation failed"
                );
                return false;
            }
        }
        true
    }

    /// One-shot and idempotent: stops admission, tears down the bulk groups
    /// this engine created, and makes the run loop return the handoff.
    async fn wedge(&mut self, transport: &mut impl Transport) {
        if self.wedged {
            return;
        }
        debug!(epoch = self.epoch, "wedging");
        self.wedged = true;
        for group in &self.placement.groups {
            transport.destroy_group(group.id).await;
        }
    }

    fn into_handoff(self) -> Handoff<W> {
        let ranks = self
            .placement
            .local
            .iter()
            .map(|(subgroup, local)| (*subgroup, local.rank))
            .collect();
        let persistence = self.writer.map(|writer| Persistence {
            writer,
            completions: self.completions,
        });
        Handoff {
            group_offset: self.group_offset,
            member_count: self.members.len(),
            ranks,
            free_buffers: self.free_buffers,
            current_receives: self.current_receives,
            locally_stable: self.locally_stable,
            current_sends: self.current_sends,
            pending_sends: self.pending_sends,
            next_sends: self.next_sends,
            non_persistent: self.non_persistent,
            persistence,
        }
    }

    fn everyone(&self) -> Vec<u32> {
        (0..self.members.len() as u32).collect()
    }
}
