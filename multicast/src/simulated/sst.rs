use crate::{types::Row, Table, UpdateFeed};
use futures::channel::{mpsc, oneshot};
use std::sync::{Arc, Mutex};

struct Inner {
    rows: Vec<Row>,
    feeds: Vec<Option<mpsc::UnboundedSender<u32>>>,
    waiting: Vec<oneshot::Sender<()>>,
}

/// An in-memory shared state table for a fixed set of members.
#[derive(Clone)]
pub struct Sst {
    inner: Arc<Mutex<Inner>>,
    members: usize,
}

impl Sst {
    /// Creates a table of `members` rows shaped for `subgroups` subgroups
    /// and `slots` receive slots, every counter at -1.
    pub fn new(members: usize, subgroups: usize, slots: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rows: (0..members).map(|_| Row::new(0, subgroups, slots)).collect(),
                feeds: (0..members).map(|_| None).collect(),
                waiting: Vec::new(),
            })),
            members,
        }
    }

    /// Registers a member, returning its table handle and update feed.
    pub fn register(&self, member: u32) -> (Replica, UpdateFeed) {
        let (sender, receiver) = mpsc::unbounded();
        self.inner.lock().unwrap().feeds[member as usize] = Some(sender);
        (
            Replica {
                inner: self.inner.clone(),
                member,
                members: self.members,
            },
            receiver,
        )
    }

    /// Snapshot of a member's row, for assertions.
    pub fn row(&self, member: u32) -> Row {
        self.inner.lock().unwrap().rows[member as usize].clone()
    }
}

/// One member's handle to the [`Sst`].
pub struct Replica {
    inner: Arc<Mutex<Inner>>,
    member: u32,
    members: usize,
}

impl Table for Replica {
    async fn put(&mut self, _peers: &[u32], row: &Row) {
        let mut inner = self.inner.lock().unwrap();
        inner.rows[self.member as usize] = row.clone();
        // Fan the update out to everyone; visibility to a superset of the
        // named peers is harmless.
        let member = self.member;
        for feed in inner.feeds.iter().flatten() {
            let _ = feed.unbounded_send(member);
        }
    }

    fn row(&self, member: u32) -> Row {
        self.inner.lock().unwrap().rows[member as usize].clone()
    }

    async fn sync(&mut self) {
        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            let (sender, receiver) = oneshot::channel();
            inner.waiting.push(sender);
            if inner.waiting.len() == self.members {
                for waiter in inner.waiting.drain(..) {
                    let _ = waiter.send(());
                }
            }
            receiver
        };
        let _ = receiver.await;
    }
}
