use crate::types::{Error, Index, SubgroupId};
use bytes::Bytes;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// Commands that can be sent to the [`Mailbox`](super::Mailbox).
pub enum Command {
    /// Reserve the next per-sender slot of a subgroup.
    Reserve {
        subgroup: SubgroupId,
        payload_size: usize,
        pause_turns: u32,
        cooked: bool,
        responder: oneshot::Sender<Result<(), Error>>,
    },

    /// Commit the outstanding reservation with its payload.
    Send {
        subgroup: SubgroupId,
        payload: Bytes,
        responder: oneshot::Sender<Result<(), Error>>,
    },

    /// Flush remaining locally-stable messages up to a per-sender bound.
    DeliverUpto {
        subgroup: SubgroupId,
        max_indices: Vec<Index>,
        responder: oneshot::Sender<()>,
    },

    /// Wedge the engine: stop admitting sends, tear down bulk groups, and
    /// make the engine task return its [`Handoff`](super::Handoff).
    Wedge { responder: oneshot::Sender<()> },
}

/// Ingress mailbox for [`Engine`](super::Engine).
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Command>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Command>) -> Self {
        Self { sender }
    }

    /// Reserve the next send slot of `subgroup` for a payload of
    /// `payload_size` bytes, skipping `pause_turns` further slots.
    ///
    /// Back-pressure surfaces as an [`Error`] the caller retries
    /// (see [`Error::is_backpressure`]). A second reservation before
    /// [`Mailbox::send`] replaces the first.
    pub async fn reserve(
        &mut self,
        subgroup: SubgroupId,
        payload_size: usize,
        pause_turns: u32,
        cooked: bool,
    ) -> Result<(), Error> {
        let (responder, receiver) = oneshot::channel();
        if self
            .sender
            .send(Command::Reserve {
                subgroup,
                payload_size,
                pause_turns,
                cooked,
                responder,
            })
            .await
            .is_err()
        {
            // The engine already terminated.
            return Err(Error::Wedged);
        }
        receiver.await.unwrap_or(Err(Error::Wedged))
    }

    /// Commit the outstanding reservation. The payload length must match the
    /// reserved size; the bytes are copied into the reserved buffer and the
    /// message joins the pending queue.
    pub async fn send(&mut self, subgroup: SubgroupId, payload: Bytes) -> Result<(), Error> {
        let (responder, receiver) = oneshot::channel();
        if self
            .sender
            .send(Command::Send {
                subgroup,
                payload,
                responder,
            })
            .await
            .is_err()
        {
            return Err(Error::Wedged);
        }
        receiver.await.unwrap_or(Err(Error::Wedged))
    }

    /// Deliver every remaining locally-stable message of `subgroup` whose
    /// sequence number is within the per-sender bounds, in sequence order.
    ///
    /// Used by the view manager to flush the ragged edge immediately before
    /// wedging; deliveries made this way do not advance `delivered_num`.
    pub async fn deliver_upto(&mut self, subgroup: SubgroupId, max_indices: Vec<Index>) {
        let (responder, receiver) = oneshot::channel();
        if self
            .sender
            .send(Command::DeliverUpto {
                subgroup,
                max_indices,
                responder,
            })
            .await
            .is_err()
        {
            return;
        }
        let _ = receiver.await;
    }

    /// Wedge the engine. Idempotent: wedging a wedged (or already
    /// terminated) engine is a no-op.
    pub async fn wedge(&mut self) {
        let (responder, receiver) = oneshot::channel();
        if self
            .sender
            .send(Command::Wedge { responder })
            .await
            .is_err()
        {
            return;
        }
        let _ = receiver.await;
    }
}
