use crate::{
    types::{Algorithm, Delivery, Error, GroupId, NodeId},
    DeliveryFeed, Transport,
};
use bytes::Bytes;
use futures::channel::mpsc;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};
use tracing::warn;

struct Inner {
    feeds: HashMap<NodeId, mpsc::UnboundedSender<Delivery>>,
    groups: HashMap<GroupId, Vec<NodeId>>,
    poisoned: HashSet<GroupId>,
}

/// An in-memory bulk multicast: delivers every posted buffer to every group
/// member exactly once, in post order per group.
#[derive(Clone)]
pub struct Bulk {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Bulk {
    fn default() -> Self {
        Self::new()
    }
}

impl Bulk {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                feeds: HashMap::new(),
                groups: HashMap::new(),
                poisoned: HashSet::new(),
            })),
        }
    }

    /// Registers a member, returning its transport handle and delivery feed.
    pub fn register(&self, node: NodeId) -> (Port, DeliveryFeed) {
        let (sender, receiver) = mpsc::unbounded();
        self.inner.lock().unwrap().feeds.insert(node, sender);
        (
            Port {
                inner: self.inner.clone(),
                node,
            },
            receiver,
        )
    }

    /// Makes creation of `group` fail, to exercise construction failures.
    pub fn poison(&self, group: GroupId) {
        self.inner.lock().unwrap().poisoned.insert(group);
    }
}

/// One member's handle to the [`Bulk`] transport.
pub struct Port {
    inner: Arc<Mutex<Inner>>,
    node: NodeId,
}

impl Transport for Port {
    async fn create_group(
        &mut self,
        group: GroupId,
        members: &[NodeId],
        _block_size: usize,
        _algorithm: Algorithm,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.poisoned.contains(&group) {
            return Err(Error::GroupCreation(group));
        }
        match inner.groups.get(&group) {
            Some(existing) if existing != members => {
                warn!(group, "group created with conflicting membership");
                Err(Error::GroupCreation(group))
            }
            Some(_) => Ok(()),
            None => {
                inner.groups.insert(group, members.to_vec());
                Ok(())
            }
        }
    }

    async fn send(&mut self, group: GroupId, message: Bytes) -> Result<(), Error> {
        let inner = self.inner.lock().unwrap();
        let Some(members) = inner.groups.get(&group) else {
            return Err(Error::TransportSend(group));
        };
        for member in members {
            let Some(feed) = inner.feeds.get(member) else {
                continue;
            };
            // The poster observes only the completion; everyone else sees
            // the receive-destination phase first.
            if *member != self.node {
                let _ = feed.unbounded_send(Delivery::Incoming {
                    group,
                    length: message.len(),
                });
            }
            let _ = feed.unbounded_send(Delivery::Complete {
                group,
                payload: message.clone(),
            });
        }
        Ok(())
    }

    async fn destroy_group(&mut self, group: GroupId) {
        // Destroying an unknown (or already destroyed) group is a no-op.
        self.inner.lock().unwrap().groups.remove(&group);
    }
}
