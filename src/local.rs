//! In-process transport resolving contacts to nodes of the same process.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::common::{Contact, Id};
use crate::node::{Node, NodeInner};
use crate::rpc::ConsumerId;
use crate::{Error, Result};

#[derive(Debug, Default)]
/// A simulated network of nodes living in one process.
///
/// Messages sent to a local contact are delivered synchronously, on the sending
/// thread, to whichever node registered the contact's id.
pub struct LocalNetwork {
    nodes: RwLock<HashMap<Id, Weak<NodeInner>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // === Getters ===

    /// Number of nodes still reachable on this network.
    pub fn len(&self) -> usize {
        self.nodes
            .read()
            .values()
            .filter(|node| node.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the node registered under `id`, if it is still alive.
    pub fn node(&self, id: &Id) -> Option<Node> {
        self.nodes
            .read()
            .get(id)
            .and_then(Weak::upgrade)
            .map(Node::from_inner)
    }

    // === Public Methods ===

    /// Makes the node with `id` unreachable, as if it went offline.
    ///
    /// Returns `true` if such a node was registered.
    pub fn disconnect(&self, id: &Id) -> bool {
        self.nodes.write().remove(id).is_some()
    }

    pub(crate) fn register(&self, id: Id, node: &Arc<NodeInner>) {
        let mut nodes = self.nodes.write();

        nodes.retain(|_, node| node.strong_count() > 0);
        nodes.insert(id, Arc::downgrade(node));
    }

    pub(crate) fn send(
        &self,
        target: &Contact,
        source: &Contact,
        consumer_id: ConsumerId,
        message: &[u8],
    ) -> Result<()> {
        let node = self
            .node(target.id())
            .ok_or(Error::Unreachable(*target.id()))?;

        node.deliver(source, consumer_id, message)
    }

    pub(crate) fn ping(&self, target: &Contact, source: &Contact) -> Option<Duration> {
        let start = Instant::now();
        let node = self.node(target.id())?;

        if let Err(error) = node.deliver_ping(source) {
            debug!(context = "local_ping", ?error, "Ping rejected");
        }

        Some(start.elapsed())
    }
}
