//! Node owning a routing table and the consumers its messages are dispatched to.

mod info;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::common::{Contact, Endpoint, Id, NetworkId, RoutingTable};
use crate::local::LocalNetwork;
use crate::rpc::{
    Callback, ClosestResults, Config, ConsumerId, GetClosestNodes, Links, MessageConsumer,
    Registered,
};
use crate::socket::{self, UdpLink};
use crate::{Error, Result};

pub use info::Info;

#[derive(Clone)]
/// A routing table node, reachable in-process or over UDP.
///
/// Cloning is cheap, every clone is a handle to the same node.
pub struct Node(Arc<NodeInner>);

pub(crate) struct NodeInner {
    table: Arc<RoutingTable>,
    callback: Arc<Callback>,
    closest: Arc<GetClosestNodes>,
    consumers: RwLock<HashMap<ConsumerId, Registered>>,
    link: Option<Arc<UdpLink>>,
    running: AtomicBool,
}

#[derive(Debug, Default, Clone)]
/// Node builder, finished by [NodeBuilder::local] or [NodeBuilder::udp].
pub struct NodeBuilder {
    id: Option<Id>,
    network_id: NetworkId,
    config: Option<Arc<Config>>,
}

impl NodeBuilder {
    /// Set this node's id, defaults to [Id::random].
    pub fn id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the logical network this node belongs to.
    ///
    /// Defaults to the all zero [NetworkId].
    pub fn network_id(mut self, network_id: NetworkId) -> Self {
        self.network_id = network_id;
        self
    }

    /// Share a [Config] with this node, defaults to a fresh [Config::default].
    pub fn config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    /// Create a node living in the in-process `network`.
    pub fn local(self, network: &Arc<LocalNetwork>) -> Result<Node> {
        let id = self.id.unwrap_or_else(Id::random);
        let local = Contact::new(id, self.network_id, Endpoint::Local(network.clone()));

        let node = Node::new(local, self.config.unwrap_or_default(), Arc::new(Callback::new()), None)?;
        network.register(id, &node.0);

        Ok(node)
    }

    /// Create a node listening on a UDP socket bound to `address`.
    ///
    /// Binding to an unspecified ip is the expected setup, peers then learn this
    /// node's ip from the packets it sends.
    pub fn udp(self, address: SocketAddr) -> Result<Node> {
        let id = self.id.unwrap_or_else(Id::random);
        let callback = Arc::new(Callback::new());

        let link = UdpLink::bind(address, callback.clone())?;
        let local = Contact::new(
            id,
            self.network_id,
            Endpoint::Udp {
                address: link.local_addr(),
                link: link.clone(),
            },
        );

        let node = Node::new(local, self.config.unwrap_or_default(), callback, Some(link.clone()))?;
        socket::start(&node.0, &link)?;

        debug!(context = "node", ?id, address = ?link.local_addr(), "Listening");

        Ok(node)
    }
}

impl Node {
    /// Returns a builder to configure and create a [Node].
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    fn new(
        local: Contact,
        config: Arc<Config>,
        callback: Arc<Callback>,
        link: Option<Arc<UdpLink>>,
    ) -> Result<Node> {
        let table = Arc::new(RoutingTable::new(local, config));
        let closest = Arc::new(GetClosestNodes::new(table.clone(), callback.clone()));

        let node = Node(Arc::new(NodeInner {
            table,
            callback: callback.clone(),
            closest: closest.clone(),
            consumers: RwLock::new(HashMap::new()),
            link,
            running: AtomicBool::new(true),
        }));

        node.register_consumer(callback)?;
        node.register_consumer(closest)?;

        Ok(node)
    }

    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Node {
        Node(inner)
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        self.0.table.local().id()
    }

    pub fn network_id(&self) -> &NetworkId {
        self.0.table.network_id()
    }

    /// The contact other nodes reach this node through.
    pub fn local_contact(&self) -> &Contact {
        self.0.table.local()
    }

    /// Local UDP socket address, `None` for in-process nodes.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.0.link.as_ref().map(|link| link.local_addr())
    }

    pub fn config(&self) -> &Arc<Config> {
        self.0.table.config()
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.0.table
    }

    /// Number of contacts in the routing table.
    pub fn contact_count(&self) -> usize {
        self.0.table.len()
    }

    /// The builtin response correlator.
    pub fn callback(&self) -> &Arc<Callback> {
        &self.0.callback
    }

    /// The builtin closest nodes consumer.
    pub fn get_closest_nodes(&self) -> &Arc<GetClosestNodes> {
        &self.0.closest
    }

    pub fn consumer_count(&self) -> usize {
        self.0.consumers.read().len()
    }

    /// Returns the consumer registered under `consumer_id`, if it is a `C`.
    pub fn consumer<C: MessageConsumer + 'static>(&self, consumer_id: ConsumerId) -> Option<Arc<C>> {
        self.registered(consumer_id)?.downcast()
    }

    /// A contact for the UDP node `id` listening at `address`, reached through
    /// this node's socket. Returns `None` for in-process nodes.
    pub fn udp_contact(&self, id: Id, address: SocketAddr) -> Option<Contact> {
        let link = self.0.link.as_ref()?;

        Some(Contact::new(
            id,
            *self.network_id(),
            Endpoint::Udp {
                address,
                link: link.clone(),
            },
        ))
    }

    /// Returns `false` once [Self::shutdown] was called.
    pub fn is_running(&self) -> bool {
        self.0.running.load(Ordering::Relaxed)
    }

    /// Information and statistics about this node.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Registers `consumer`, after resolving its dependencies.
    ///
    /// Missing dependencies with a default are created and registered first. A
    /// missing required dependency without a default fails the registration,
    /// `consumer` is then left unregistered and any consumer it would have
    /// replaced stays in place.
    ///
    /// A consumer registered under an existing id replaces the previous one.
    pub fn register_consumer<C: MessageConsumer + 'static>(&self, consumer: Arc<C>) -> Result<()> {
        self.register(Registered::new(consumer))
    }

    /// Removes the consumer registered under `consumer_id`, returns `true` if there was one.
    pub fn remove_consumer(&self, consumer_id: ConsumerId) -> bool {
        let removed = self.0.consumers.write().remove(&consumer_id);

        match removed {
            Some(registered) => {
                registered.consumer().on_unregistered();
                true
            }
            None => false,
        }
    }

    /// Updates the routing table with `source`, then hands `message` to the
    /// consumer registered under `consumer_id`.
    pub fn deliver(&self, source: &Contact, consumer_id: ConsumerId, message: &[u8]) -> Result<()> {
        self.0.table.update(source)?;

        self.dispatch(source, consumer_id, message)
    }

    /// Updates the routing table with the pinging `source`.
    pub fn deliver_ping(&self, source: &Contact) -> Result<()> {
        self.0.table.update(source)?;

        Ok(())
    }

    /// Joins the network through `seeds`.
    ///
    /// Live seeds are added to the routing table, then a lookup for this node's
    /// own id fills the closest buckets, and a forced refresh of far buckets
    /// spreads knowledge of the rest of the network.
    pub fn bootstrap(&self, seeds: &[Contact]) -> Result<()> {
        for seed in seeds {
            match self.ping(seed) {
                Some(rtt) => {
                    debug!(context = "bootstrap", seed = ?seed.id(), ?rtt, "Seed is alive");
                    self.0.table.update(seed)?;
                }
                None => {
                    debug!(context = "bootstrap", seed = ?seed.id(), "Seed did not answer");
                }
            }
        }

        for contact in self.closest_contacts(self.id()) {
            if let Err(error) = self.0.table.update(&contact) {
                warn!(context = "bootstrap", ?error, "Failed to update routing table");
            }
        }

        self.refresh_far_buckets(true);

        if self.0.table.is_empty() {
            error!(context = "bootstrap", "Routing table is empty after bootstrap");
        } else {
            debug!(context = "bootstrap", contacts = self.contact_count(), "Bootstrapped");
        }

        Ok(())
    }

    /// Pings `contact`, returns the round trip time if it answered within the
    /// configured [ping timeout](Config::ping_timeout).
    pub fn ping(&self, contact: &Contact) -> Option<Duration> {
        contact.ping(self.local_contact(), self.config().ping_timeout())
    }

    /// Sends `message` to the consumer `consumer_id` of `contact`.
    pub fn send(&self, contact: &Contact, consumer_id: ConsumerId, message: &[u8]) -> Result<()> {
        contact.send(self.local_contact(), consumer_id, message)
    }

    /// Walks the network for the contacts closest to `target`.
    pub fn closest_contacts(&self, target: &Id) -> ClosestResults {
        self.0.closest.closest_contacts(target)
    }

    /// Refresh every bucket that is due, or all of them if `force` is set.
    pub fn refresh(&self, force: bool) {
        self.0.table.refresh(force, &|target: &Id| self.lookup(target));
    }

    /// Refresh the buckets farther than the closest populated one.
    pub fn refresh_far_buckets(&self, force: bool) {
        self.0
            .table
            .refresh_far_buckets(force, &|target: &Id| self.lookup(target));
    }

    /// Stops the background threads of a UDP node.
    ///
    /// In-process nodes keep answering until dropped or disconnected.
    pub fn shutdown(&self) {
        if self.0.running.swap(false, Ordering::Relaxed) {
            debug!(context = "node", id = ?self.id(), "Shutting down");
        }
    }

    // === Private Methods ===

    /// Hands `message` to its consumer without touching the routing table.
    pub(crate) fn dispatch(
        &self,
        source: &Contact,
        consumer_id: ConsumerId,
        message: &[u8],
    ) -> Result<()> {
        let registered = self
            .registered(consumer_id)
            .ok_or(Error::UnknownConsumer(consumer_id))?;

        registered.consumer().deliver(source, message)
    }

    fn registered(&self, consumer_id: ConsumerId) -> Option<Registered> {
        self.0.consumers.read().get(&consumer_id).cloned()
    }

    fn register(&self, registered: Registered) -> Result<()> {
        let consumer = registered.consumer().clone();
        let consumer_id = consumer.consumer_id();

        // Registered before its dependencies are resolved, so a dependency cycle
        // finds it instead of creating it again.
        let replaced = self.0.consumers.write().insert(consumer_id, registered);

        let resolved = match self.resolve(&*consumer) {
            Ok(resolved) => resolved,
            Err(error) => {
                let mut consumers = self.0.consumers.write();
                match replaced {
                    Some(previous) => consumers.insert(consumer_id, previous),
                    None => consumers.remove(&consumer_id),
                };

                return Err(error);
            }
        };

        if let Some(replaced) = replaced {
            replaced.consumer().on_unregistered();
        }

        consumer.on_registered(&Links::new(resolved));

        Ok(())
    }

    /// Finds or creates every dependency of `consumer`.
    fn resolve(&self, consumer: &dyn MessageConsumer) -> Result<Vec<Registered>> {
        let mut resolved = Vec::new();

        for dependency in consumer.dependencies() {
            if let Some(found) = self.registered(dependency.consumer_id) {
                resolved.push(found);
                continue;
            }

            match dependency.default {
                Some(default) => {
                    let created = default();
                    self.register(created.clone())?;
                    resolved.push(created);
                }
                None if dependency.optional => {}
                None => {
                    return Err(Error::MissingDependency {
                        consumer: consumer.consumer_id(),
                        dependency: dependency.consumer_id,
                    })
                }
            }
        }

        Ok(resolved)
    }

    fn lookup(&self, target: &Id) -> Vec<Contact> {
        self.0.closest.closest_contacts(target).collect()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", self.id())
            .field("network_id", self.network_id())
            .field("local_addr", &self.local_addr())
            .field("contacts", &self.contact_count())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::rpc::callback::CALLBACK_ID;
    use crate::rpc::closest_nodes::CLOSEST_NODES_ID;
    use crate::rpc::{ConsumerFactory, Dependency};

    const ECHO_ID: ConsumerId = ConsumerId::from_u128(1);
    const NEEDY_ID: ConsumerId = ConsumerId::from_u128(2);
    const MISSING_ID: ConsumerId = ConsumerId::from_u128(3);

    #[derive(Default)]
    struct Echo {
        received: AtomicUsize,
        unregistered: AtomicBool,
    }

    impl MessageConsumer for Echo {
        fn consumer_id(&self) -> ConsumerId {
            ECHO_ID
        }

        fn deliver(&self, _source: &Contact, _message: &[u8]) -> Result<()> {
            self.received.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn on_unregistered(&self) {
            self.unregistered.store(true, Ordering::Relaxed);
        }
    }

    struct Needy {
        dependency: Dependency,
        links: AtomicUsize,
    }

    impl MessageConsumer for Needy {
        fn consumer_id(&self) -> ConsumerId {
            NEEDY_ID
        }

        fn dependencies(&self) -> Vec<Dependency> {
            vec![self.dependency.clone()]
        }

        fn deliver(&self, _source: &Contact, _message: &[u8]) -> Result<()> {
            Ok(())
        }

        fn on_registered(&self, links: &Links) {
            self.links.store(links.len(), Ordering::Relaxed);
        }
    }

    fn needy(dependency: Dependency) -> Arc<Needy> {
        Arc::new(Needy {
            dependency,
            links: AtomicUsize::new(0),
        })
    }

    fn default_echo() -> Registered {
        Registered::new(Arc::new(Echo::default()))
    }

    #[test]
    fn builtins_are_registered() {
        let network = LocalNetwork::new();
        let node = Node::builder().local(&network).unwrap();

        assert_eq!(node.consumer_count(), 2);
        assert!(node.consumer::<Callback>(CALLBACK_ID).is_some());
        assert!(node.consumer::<GetClosestNodes>(CLOSEST_NODES_ID).is_some());
        assert!(node.consumer::<Callback>(CLOSEST_NODES_ID).is_none());
    }

    #[test]
    fn deliver_updates_table_then_dispatches() {
        let network = LocalNetwork::new();
        let a = Node::builder().local(&network).unwrap();
        let b = Node::builder().local(&network).unwrap();

        let echo = Arc::new(Echo::default());
        b.register_consumer(echo.clone()).unwrap();

        a.send(b.local_contact(), ECHO_ID, b"hi").unwrap();

        assert_eq!(echo.received.load(Ordering::Relaxed), 1);
        assert!(b.routing_table().contains(a.id()));
    }

    #[test]
    fn unknown_consumer_is_an_error() {
        let network = LocalNetwork::new();
        let a = Node::builder().local(&network).unwrap();
        let b = Node::builder().local(&network).unwrap();

        assert!(matches!(
            a.send(b.local_contact(), ECHO_ID, b"hi"),
            Err(Error::UnknownConsumer(ECHO_ID))
        ));
    }

    #[test]
    fn missing_required_dependency_fails() {
        let network = LocalNetwork::new();
        let node = Node::builder().local(&network).unwrap();

        let result = node.register_consumer(needy(Dependency::required(MISSING_ID)));

        assert!(matches!(
            result,
            Err(Error::MissingDependency {
                consumer: NEEDY_ID,
                dependency: MISSING_ID
            })
        ));
        assert!(node.consumer::<Needy>(NEEDY_ID).is_none());
    }

    #[test]
    fn missing_optional_dependency_is_skipped() {
        let network = LocalNetwork::new();
        let node = Node::builder().local(&network).unwrap();

        let consumer = needy(Dependency::optional(MISSING_ID));
        node.register_consumer(consumer.clone()).unwrap();

        assert_eq!(consumer.links.load(Ordering::Relaxed), 0);
        assert!(node.consumer::<Needy>(NEEDY_ID).is_some());
    }

    #[test]
    fn default_dependency_is_created() {
        let network = LocalNetwork::new();
        let node = Node::builder().local(&network).unwrap();

        let consumer = needy(Dependency::required(ECHO_ID).with_default(default_echo));
        node.register_consumer(consumer.clone()).unwrap();

        assert_eq!(consumer.links.load(Ordering::Relaxed), 1);
        assert!(node.consumer::<Echo>(ECHO_ID).is_some());
        assert_eq!(node.consumer_count(), 4);
    }

    const RING_A_ID: ConsumerId = ConsumerId::from_u128(4);
    const RING_B_ID: ConsumerId = ConsumerId::from_u128(5);

    /// Requires its peer, creating it from `default` when missing.
    struct Ring {
        id: ConsumerId,
        peer: ConsumerId,
        default: ConsumerFactory,
        links: AtomicUsize,
    }

    impl Ring {
        fn new(id: ConsumerId, peer: ConsumerId, default: ConsumerFactory) -> Arc<Self> {
            Arc::new(Ring {
                id,
                peer,
                default,
                links: AtomicUsize::new(0),
            })
        }
    }

    impl MessageConsumer for Ring {
        fn consumer_id(&self) -> ConsumerId {
            self.id
        }

        fn dependencies(&self) -> Vec<Dependency> {
            vec![Dependency::required(self.peer).with_default(self.default)]
        }

        fn deliver(&self, _source: &Contact, _message: &[u8]) -> Result<()> {
            Ok(())
        }

        fn on_registered(&self, links: &Links) {
            self.links.store(links.len(), Ordering::Relaxed);
        }
    }

    fn ring_a() -> Registered {
        Registered::new(Ring::new(RING_A_ID, RING_B_ID, ring_b))
    }

    fn ring_b() -> Registered {
        Registered::new(Ring::new(RING_B_ID, RING_A_ID, ring_a))
    }

    #[test]
    fn mutual_default_dependencies_resolve() {
        let network = LocalNetwork::new();
        let node = Node::builder().local(&network).unwrap();

        let a = Ring::new(RING_A_ID, RING_B_ID, ring_b);
        node.register_consumer(a.clone()).unwrap();

        assert_eq!(node.consumer_count(), 4);
        assert_eq!(a.links.load(Ordering::Relaxed), 1);

        let b = node.consumer::<Ring>(RING_B_ID).unwrap();
        assert_eq!(b.links.load(Ordering::Relaxed), 1);

        // b linked to the registered a, not to a fresh default.
        let linked = node.consumer::<Ring>(RING_A_ID).unwrap();
        assert!(Arc::ptr_eq(&linked, &a));
    }

    #[test]
    fn failed_registration_keeps_previous_consumer() {
        let network = LocalNetwork::new();
        let node = Node::builder().local(&network).unwrap();

        let first = needy(Dependency::optional(MISSING_ID));
        node.register_consumer(first.clone()).unwrap();

        assert!(node
            .register_consumer(needy(Dependency::required(MISSING_ID)))
            .is_err());

        let kept = node.consumer::<Needy>(NEEDY_ID).unwrap();
        assert!(Arc::ptr_eq(&kept, &first));
        assert_eq!(node.consumer_count(), 3);
    }

    #[test]
    fn refresh_queries_known_peers() {
        let network = LocalNetwork::new();
        let node = Node::builder().local(&network).unwrap();
        let peer = Node::builder().local(&network).unwrap();

        node.routing_table().update(peer.local_contact()).unwrap();
        assert!(!peer.routing_table().contains(node.id()));

        node.refresh(true);

        assert!(peer.routing_table().contains(node.id()));
        assert_eq!(node.callback().pending(), 0);
    }

    #[test]
    fn existing_dependency_is_linked() {
        let network = LocalNetwork::new();
        let node = Node::builder().local(&network).unwrap();

        let consumer = needy(Dependency::required(CALLBACK_ID));
        node.register_consumer(consumer.clone()).unwrap();

        assert_eq!(consumer.links.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn remove_consumer_notifies() {
        let network = LocalNetwork::new();
        let node = Node::builder().local(&network).unwrap();

        let echo = Arc::new(Echo::default());
        node.register_consumer(echo.clone()).unwrap();

        assert!(node.remove_consumer(ECHO_ID));
        assert!(!node.remove_consumer(ECHO_ID));
        assert!(echo.unregistered.load(Ordering::Relaxed));
    }

    #[test]
    fn info_snapshot() {
        let network = LocalNetwork::new();
        let node = Node::builder()
            .network_id(NetworkId::from_u128(9))
            .local(&network)
            .unwrap();

        let info = node.info();

        assert_eq!(info.id(), node.id());
        assert_eq!(info.network_id(), &NetworkId::from_u128(9));
        assert_eq!(info.local_addr(), None);
        assert_eq!(info.contacts(), 0);
        assert_eq!(info.consumers(), 2);
        assert!(info.running());
    }
}
