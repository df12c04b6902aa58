use std::net::SocketAddr;

use crate::common::{Id, NetworkId};

use super::Node;

/// Information and statistics about a node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    network_id: NetworkId,
    local_addr: Option<SocketAddr>,
    contacts: usize,
    pending_tokens: usize,
    consumers: usize,
    running: bool,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn network_id(&self) -> &NetworkId {
        &self.network_id
    }

    /// Local UDP socket address that this node is listening on, `None` for
    /// in-process nodes.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of contacts in the routing table.
    pub fn contacts(&self) -> usize {
        self.contacts
    }

    /// Requests still waiting for a response.
    pub fn pending_tokens(&self) -> usize {
        self.pending_tokens
    }

    /// Number of registered message consumers, builtins included.
    pub fn consumers(&self) -> usize {
        self.consumers
    }

    /// Returns `false` once the node has been shut down.
    pub fn running(&self) -> bool {
        self.running
    }
}

impl From<&Node> for Info {
    fn from(node: &Node) -> Self {
        Self {
            id: *node.id(),
            network_id: *node.network_id(),
            local_addr: node.local_addr(),
            contacts: node.contact_count(),
            pending_tokens: node.callback().pending(),
            consumers: node.consumer_count(),
            running: node.is_running(),
        }
    }
}
