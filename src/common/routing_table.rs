//! Kademlia routing table, one [KBucket] per common prefix length.

use std::ops::Range;
use std::sync::Arc;

use crate::common::{Contact, Id, KBucket, NetworkId, ID_BITS};
use crate::rpc::config::Config;
use crate::{Error, Result};

/// Kademlia routing table.
///
/// Bucket `i` holds the contacts sharing exactly `i` leading bits with the local id,
/// so higher indices are closer to the local node.
pub struct RoutingTable {
    local: Contact,
    config: Arc<Config>,
    buckets: Box<[KBucket]>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] for the `local` contact.
    pub fn new(local: Contact, config: Arc<Config>) -> Self {
        let buckets = (0..ID_BITS)
            .map(|common_bits| KBucket::new(local.clone(), common_bits, config.clone()))
            .collect();

        RoutingTable {
            local,
            config,
            buckets,
        }
    }

    // === Getters ===

    /// Returns the local contact, where distances are measured from.
    pub fn local(&self) -> &Contact {
        &self.local
    }

    pub fn network_id(&self) -> &NetworkId {
        self.local.network_id()
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Returns the bucket of contacts sharing `index` leading bits with the local id.
    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(index)
    }

    /// Returns the number of contacts in this routing table.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.index_of(id)
            .is_some_and(|index| self.buckets[index].contains(id))
    }

    /// Snapshot of every contact, closest buckets first.
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .rev()
            .flat_map(KBucket::contacts)
            .collect()
    }

    // === Public Methods ===

    /// Routes `contact` to its bucket.
    ///
    /// Returns `true` if the contact is in the table after the update. Updates for
    /// the local id are ignored and, if routing table updates are disabled, so is
    /// everything else.
    pub fn update(&self, contact: &Contact) -> Result<bool> {
        if !self.config.update_routing_table() {
            return Ok(false);
        }

        let Some(index) = self.index_of(contact.id()) else {
            return Ok(false);
        };

        if contact.network_id() != self.network_id() {
            return Err(Error::NetworkMismatch {
                expected: *self.network_id(),
                found: *contact.network_id(),
            });
        }

        Ok(self.buckets[index].update(contact))
    }

    /// Remove a contact from this routing table.
    pub fn remove(&self, id: &Id) -> bool {
        self.index_of(id)
            .is_some_and(|index| self.buckets[index].remove(id))
    }

    /// Lazily iterates every contact, in non-decreasing distance to `target`.
    pub fn closest_nodes(&self, target: &Id) -> ClosestNodes<'_> {
        let middle = target.common_prefix_length(self.local.id());

        let bands: Vec<Range<usize>> = if middle == ID_BITS {
            (0..ID_BITS).rev().map(|i| i..i + 1).collect()
        } else {
            // Every bucket above `middle` differs from `target` at bit `middle`,
            // making them one band of equal leading distance.
            [middle..middle + 1, middle + 1..ID_BITS]
                .into_iter()
                .chain((0..middle).rev().map(|i| i..i + 1))
                .collect()
        };

        ClosestNodes {
            table: self,
            target: *target,
            bands: bands.into_iter(),
            current: Vec::new().into_iter(),
        }
    }

    /// Refresh every bucket.
    pub fn refresh<F>(&self, force: bool, lookup: &F)
    where
        F: Fn(&Id) -> Vec<Contact>,
    {
        for bucket in self.buckets.iter() {
            bucket.refresh(force, lookup);
        }
    }

    /// Refresh the farthest populated bucket and every bucket farther than it.
    ///
    /// Buckets closer than the closest populated one are skipped, nothing can be
    /// learned about them without first learning about closer contacts.
    pub fn refresh_far_buckets<F>(&self, force: bool, lookup: &F)
    where
        F: Fn(&Id) -> Vec<Contact>,
    {
        let mut populated = false;

        for bucket in self.buckets.iter().rev() {
            populated = populated || !bucket.is_empty();

            if populated {
                bucket.refresh(force, lookup);
            }
        }
    }

    // === Private Methods ===

    /// Bucket index of `id`, `None` for the local id.
    fn index_of(&self, id: &Id) -> Option<usize> {
        let index = id.common_prefix_length(self.local.id());

        (index < ID_BITS).then_some(index)
    }
}

/// Iterator returned by [RoutingTable::closest_nodes].
///
/// Buckets are read one distance band at a time, so contacts updated while
/// iterating may or may not be seen.
pub struct ClosestNodes<'a> {
    table: &'a RoutingTable,
    target: Id,
    bands: std::vec::IntoIter<Range<usize>>,
    current: std::vec::IntoIter<Contact>,
}

impl Iterator for ClosestNodes<'_> {
    type Item = Contact;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(contact) = self.current.next() {
                return Some(contact);
            }

            let band = self.bands.next()?;

            let mut contacts: Vec<Contact> = self.table.buckets[band]
                .iter()
                .flat_map(KBucket::contacts)
                .collect();

            contacts.sort_by_cached_key(|contact| contact.id().distance(&self.target));

            self.current = contacts.into_iter();
        }
    }
}
