//! Prefix bucket with liveness checked eviction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::RwLock;
use tracing::debug;

use crate::common::{Contact, Id};
use crate::rpc::config::Config;

/// Kbuckets are similar to LRU caches that check and evict unresponsive contacts,
/// without dropping any responsive contacts in the process.
///
/// Every contact in a bucket shares exactly [KBucket::common_bits] leading bits
/// with the local id.
pub struct KBucket {
    local: Contact,
    common_bits: usize,
    config: Arc<Config>,
    state: RwLock<BucketState>,
}

struct BucketState {
    /// Contacts by use, most recently used first.
    recent: LruCache<Id, Contact>,
    /// Ids by insertion, newest at the front.
    inserted: VecDeque<Id>,
    last_refresh: Option<Instant>,
}

impl BucketState {
    fn insert(&mut self, contact: Contact) {
        self.inserted.push_front(*contact.id());
        self.recent.put(*contact.id(), contact);
    }

    fn remove(&mut self, id: &Id) -> bool {
        if self.recent.pop(id).is_none() {
            return false;
        }
        self.inserted.retain(|inserted| inserted != id);

        true
    }
}

impl KBucket {
    pub fn new(local: Contact, common_bits: usize, config: Arc<Config>) -> Self {
        KBucket {
            local,
            common_bits,
            config,
            state: RwLock::new(BucketState {
                recent: LruCache::unbounded(),
                inserted: VecDeque::new(),
                last_refresh: None,
            }),
        }
    }

    // === Getters ===

    /// Number of leading bits every contact of this bucket shares with the local id.
    pub fn common_bits(&self) -> usize {
        self.common_bits
    }

    pub fn len(&self) -> usize {
        self.state.read().recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slots left before an update has to trim the bucket.
    pub fn remaining_space(&self) -> usize {
        self.config.bucket_size().saturating_sub(self.len())
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.state.read().recent.contains(id)
    }

    /// Snapshot of the current members, most recently used first.
    pub fn contacts(&self) -> Vec<Contact> {
        self.state
            .read()
            .recent
            .iter()
            .map(|(_, contact)| contact.clone())
            .collect()
    }

    // === Public Methods ===

    /// Marks `contact` as the most recently used, inserting it if there is room,
    /// or if a trim evicted enough dead contacts to make room.
    ///
    /// Returns `true` if `contact` is in the bucket after the call.
    pub fn update(&self, contact: &Contact) -> bool {
        if contact.id() == self.local.id() {
            return false;
        }

        if self.try_insert(contact) {
            return true;
        }

        self.trim();

        self.try_insert(contact)
    }

    /// Removes the contact with this `id`, returns `true` if it was present.
    pub fn remove(&self, id: &Id) -> bool {
        self.state.write().remove(id)
    }

    /// Looks up a random id sharing this bucket's prefix and pings every contact
    /// found, if `force` is set or the refresh period elapsed.
    ///
    /// Returns `true` if a refresh took place.
    pub fn refresh<F>(&self, force: bool, lookup: &F) -> bool
    where
        F: Fn(&Id) -> Vec<Contact>,
    {
        {
            let mut state = self.state.write();

            let due = force
                || state
                    .last_refresh
                    .map_or(true, |at| at.elapsed() >= self.config.bucket_refresh_period());

            if !due {
                return false;
            }

            state.last_refresh = Some(Instant::now());
        }

        let target = self.local.id().random_with_prefix(self.common_bits);
        let found = lookup(&target);

        debug!(
            context = "refresh",
            bucket = self.common_bits,
            found = found.len(),
            "Refreshing bucket"
        );

        let timeout = self.config.ping_timeout();
        for contact in &found {
            contact.ping(&self.local, timeout);
        }

        true
    }

    // === Private Methods ===

    fn try_insert(&self, contact: &Contact) -> bool {
        let mut state = self.state.write();

        if state.recent.contains(contact.id()) {
            // Latest contact wins, it may carry a newer address.
            state.recent.put(*contact.id(), contact.clone());
            return true;
        }

        if state.recent.len() < self.config.bucket_size() {
            state.insert(contact.clone());
            return true;
        }

        false
    }

    /// Pings contacts from the least recently used up, evicting the unresponsive
    /// ones until there is room for one more contact. Then, if the capacity was
    /// lowered, evicts the newest insertions until the bucket fits again.
    fn trim(&self) {
        let capacity = self.config.bucket_size();

        let candidates: Vec<Contact> = {
            let state = self.state.read();
            state
                .recent
                .iter()
                .rev()
                .map(|(_, contact)| contact.clone())
                .collect()
        };

        let needed = (candidates.len() + 1).saturating_sub(capacity);
        let timeout = self.config.ping_timeout();

        let mut dead = Vec::with_capacity(needed);

        if needed > 0 {
            for contact in candidates {
                if contact.ping(&self.local, timeout).is_none() {
                    dead.push(*contact.id());

                    if dead.len() >= needed {
                        break;
                    }
                }
            }
        }

        let mut state = self.state.write();

        for id in &dead {
            if state.remove(id) {
                debug!(context = "trim", bucket = self.common_bits, ?id, "Evicted dead contact");
            }
        }

        while state.recent.len() > capacity {
            let Some(newest) = state.inserted.pop_front() else {
                break;
            };
            state.recent.pop(&newest);
        }
    }
}

#[cfg(test)]
mod test {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::Node;
    use crate::local::LocalNetwork;

    fn bucket_with_capacity(network: &Arc<LocalNetwork>, capacity: usize) -> (Node, KBucket) {
        let node = Node::builder().local(network).unwrap();
        node.config()
            .set_bucket_size(NonZeroUsize::new(capacity).unwrap());

        let bucket = KBucket::new(node.local_contact().clone(), 0, node.config().clone());

        (node, bucket)
    }

    #[test]
    fn never_holds_local_id() {
        let network = LocalNetwork::new();
        let (node, bucket) = bucket_with_capacity(&network, 4);

        assert!(!bucket.update(node.local_contact()));
        assert!(bucket.is_empty());
    }

    #[test]
    fn existing_contact_is_promoted() {
        let network = LocalNetwork::new();
        let (_node, bucket) = bucket_with_capacity(&network, 4);

        let peers: Vec<Node> = (0..3)
            .map(|_| Node::builder().local(&network).unwrap())
            .collect();

        for peer in &peers {
            assert!(bucket.update(peer.local_contact()));
        }
        assert_eq!(bucket.contacts()[0], *peers[2].local_contact());

        assert!(bucket.update(peers[0].local_contact()));

        assert_eq!(bucket.len(), 3);
        assert_eq!(bucket.contacts()[0], *peers[0].local_contact());
        assert_eq!(bucket.remaining_space(), 1);
    }

    #[test]
    fn full_bucket_of_live_contacts_rejects_newcomer() {
        let network = LocalNetwork::new();
        let (_node, bucket) = bucket_with_capacity(&network, 2);

        let peers: Vec<Node> = (0..3)
            .map(|_| Node::builder().local(&network).unwrap())
            .collect();

        assert!(bucket.update(peers[0].local_contact()));
        assert!(bucket.update(peers[1].local_contact()));
        assert!(!bucket.update(peers[2].local_contact()));

        assert_eq!(bucket.len(), 2);
        assert!(!bucket.contains(peers[2].id()));
    }

    #[test]
    fn dead_contact_makes_room() {
        let network = LocalNetwork::new();
        let (_node, bucket) = bucket_with_capacity(&network, 2);

        let alive = Node::builder().local(&network).unwrap();
        let dead = Node::builder().local(&network).unwrap();
        let newcomer = Node::builder().local(&network).unwrap();

        bucket.update(dead.local_contact());
        bucket.update(alive.local_contact());

        network.disconnect(dead.id());

        assert!(bucket.update(newcomer.local_contact()));
        assert!(!bucket.contains(dead.id()));
        assert!(bucket.contains(alive.id()));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn lowered_capacity_evicts_newest() {
        let network = LocalNetwork::new();
        let (node, bucket) = bucket_with_capacity(&network, 4);

        let peers: Vec<Node> = (0..4)
            .map(|_| Node::builder().local(&network).unwrap())
            .collect();
        for peer in &peers {
            bucket.update(peer.local_contact());
        }

        node.config().set_bucket_size(NonZeroUsize::new(2).unwrap());

        let newcomer = Node::builder().local(&network).unwrap();
        assert!(!bucket.update(newcomer.local_contact()));

        assert_eq!(bucket.len(), 2);
        assert!(bucket.contains(peers[0].id()));
        assert!(bucket.contains(peers[1].id()));
    }

    #[test]
    fn refresh_respects_period() {
        let network = LocalNetwork::new();
        let (_node, bucket) = bucket_with_capacity(&network, 4);

        let lookup = |_: &Id| Vec::new();

        assert!(bucket.refresh(false, &lookup));
        assert!(!bucket.refresh(false, &lookup));
        assert!(bucket.refresh(true, &lookup));
    }

    #[test]
    fn refresh_target_shares_bucket_prefix() {
        let network = LocalNetwork::new();
        let node = Node::builder().local(&network).unwrap();
        let bucket = KBucket::new(node.local_contact().clone(), 37, node.config().clone());

        let lookup = |target: &Id| {
            assert_eq!(target.common_prefix_length(node.id()), 37);
            Vec::new()
        };

        assert!(bucket.refresh(true, &lookup));
    }
}
