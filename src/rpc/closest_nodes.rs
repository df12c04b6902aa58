//! Iterative lookup of the contacts closest to a target.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::common::{Contact, Id, MinMaxHeap, RoutingTable};
use crate::rpc::callback::{Callback, CALLBACK_ID};
use crate::rpc::messages::{ClosestRequest, ClosestResponse};
use crate::rpc::{ConsumerId, Dependency, MessageConsumer, WaitToken};
use crate::{Error, Result};

/// Builtin consumer answering closest contacts requests.
pub const CLOSEST_NODES_ID: ConsumerId =
    ConsumerId::from_u128(0x6bf85253_e9ee_4ea2_ae31_1d509978ea36);

/// Answers closest nodes requests from the local routing table, and walks the
/// network to find the contacts closest to a target.
pub struct GetClosestNodes {
    table: Arc<RoutingTable>,
    callback: Arc<Callback>,
}

impl GetClosestNodes {
    pub fn new(table: Arc<RoutingTable>, callback: Arc<Callback>) -> Self {
        GetClosestNodes { table, callback }
    }

    // === Public Methods ===

    /// Asks `remote` for at most `limit` of its contacts closest to `target`.
    ///
    /// Returns [Error::Timeout] if no answer arrived within `timeout`.
    pub fn remote_get_closest(
        &self,
        remote: &Contact,
        target: &Id,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<Contact>> {
        let mut token = self.callback.allocate_token();

        let result = self.query(&mut token, remote, target, limit, timeout);
        self.callback.free_token(&token);

        let response = result?;

        response.contacts(self.table.local())
    }

    /// Walks the network towards `target`, see [Self::closest_contacts_until].
    pub fn closest_contacts(&self, target: &Id) -> ClosestResults {
        self.closest_contacts_until(target, |_| false)
    }

    /// Walks the network towards `target`, one round at a time.
    ///
    /// Every round asks the frontier contacts not asked yet for their closest
    /// contacts to `target`, folds new ones into the routing table and keeps the
    /// closest [lookup_concurrency](crate::rpc::Config::lookup_concurrency) in the
    /// frontier. The walk stops when a round discovers nothing new, when the
    /// target itself is found, or when a discovered contact satisfies `terminate`.
    pub fn closest_contacts_until<F>(&self, target: &Id, terminate: F) -> ClosestResults
    where
        F: Fn(&Contact) -> bool,
    {
        let config = self.table.config();
        let concurrency = config.lookup_concurrency();
        let timeout = config.lookup_timeout();

        let distance_to = *target;
        let mut frontier = MinMaxHeap::with_items(
            move |a: &Contact, b: &Contact| {
                a.id()
                    .distance(&distance_to)
                    .cmp(&b.id().distance(&distance_to))
            },
            self.table.closest_nodes(target).take(concurrency),
        );

        let mut contacted = HashSet::from([*self.table.local().id()]);
        let mut iterations = 0;

        loop {
            iterations += 1;

            let queried: Vec<Contact> = frontier
                .iter()
                .filter(|contact| !contacted.contains(contact.id()))
                .cloned()
                .collect();

            let answers: Vec<Vec<Contact>> = queried
                .par_iter()
                .map(
                    |peer| match self.remote_get_closest(peer, target, concurrency, timeout) {
                        Ok(contacts) => contacts,
                        Err(error) => {
                            debug!(context = "lookup", peer = ?peer.id(), ?error, "Peer failed to answer");
                            Vec::new()
                        }
                    },
                )
                .collect();

            let mut unique = HashSet::new();
            let discoveries: Vec<Contact> = answers
                .into_iter()
                .flatten()
                .filter(|contact| {
                    contact.network_id() == self.table.network_id()
                        && !contacted.contains(contact.id())
                        && !frontier.contains(contact)
                        && unique.insert(*contact.id())
                })
                .collect();

            for contact in &discoveries {
                if let Err(error) = self.table.update(contact) {
                    warn!(context = "lookup", ?error, "Failed to update routing table");
                }
            }

            contacted.extend(frontier.iter().map(|contact| *contact.id()));

            let terminated = discoveries.iter().any(&terminate);
            let stagnated = discoveries.is_empty();

            frontier.add_many(discoveries);
            while frontier.len() > concurrency {
                frontier.pop_max();
            }

            let found = frontier
                .peek_min()
                .is_some_and(|closest| closest.id() == target);

            if terminated || stagnated || found {
                break;
            }
        }

        debug!(
            context = "lookup",
            ?target,
            iterations,
            closest = ?frontier.peek_min().map(|contact| *contact.id()),
            "Lookup done"
        );

        ClosestResults {
            frontier,
            iterations,
        }
    }

    // === Private Methods ===

    fn query(
        &self,
        token: &mut WaitToken,
        remote: &Contact,
        target: &Id,
        limit: usize,
        timeout: Duration,
    ) -> Result<ClosestResponse> {
        let request = ClosestRequest::new(token.id(), target, limit);

        remote.send(self.table.local(), CLOSEST_NODES_ID, &request.to_bytes()?)?;

        if !token.wait(timeout) {
            return Err(Error::Timeout);
        }

        match token.response() {
            Some(bytes) => ClosestResponse::from_bytes(bytes),
            None => Err(Error::Timeout),
        }
    }
}

impl MessageConsumer for GetClosestNodes {
    fn consumer_id(&self) -> ConsumerId {
        CLOSEST_NODES_ID
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::required(CALLBACK_ID)]
    }

    fn deliver(&self, source: &Contact, message: &[u8]) -> Result<()> {
        let request = ClosestRequest::from_bytes(message)?;
        let target = request.target()?;

        let closest: Vec<Contact> = self
            .table
            .closest_nodes(&target)
            .take(request.limit as usize)
            .collect();

        let response = ClosestResponse::new(&closest).to_bytes()?;

        self.callback
            .send_response(self.table.local(), source, request.token, &response)
    }
}

#[derive(Debug)]
/// Result of an iterative lookup, iterating the final frontier closest first.
pub struct ClosestResults {
    frontier: MinMaxHeap<Contact>,
    iterations: usize,
}

impl ClosestResults {
    /// Number of rounds the lookup took.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Closest contact found, if any.
    pub fn closest(&self) -> Option<&Contact> {
        self.frontier.peek_min()
    }

    pub fn len(&self) -> usize {
        self.frontier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frontier.is_empty()
    }
}

impl Iterator for ClosestResults {
    type Item = Contact;

    fn next(&mut self) -> Option<Self::Item> {
        self.frontier.pop_min()
    }
}
