//! UDP transport: packet codec, the shared send socket, and the threads
//! running a UDP node.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BufMut;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::common::wire::{get_bytes, get_i64, get_u8, put_bytes};
use crate::common::Contact;
use crate::node::{Node, NodeInner};
use crate::rpc::callback::{Callback, CALLBACK_ID};
use crate::rpc::{ConsumerId, TokenId};
use crate::{Error, Result};

/// Largest UDP payload, anything bigger can not be sent in one datagram.
pub const MAX_PACKET_SIZE: usize = 65_507;
/// How long the receive thread blocks before checking whether the node shut down.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Period of the maintenance thread refreshing far buckets.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Jobs queued for the dispatch thread before incoming packets are dropped.
pub const JOB_QUEUE_SIZE: usize = 1024;

/// Payload answering a ping.
pub const PING_ACK: [u8; 4] = [1, 3, 3, 7];

const PING_FLAG: u8 = 0;
const DATA_FLAG: u8 = 1;

#[derive(Debug)]
/// A decoded UDP packet.
pub(crate) enum Packet {
    Ping {
        sender: Contact,
        token: TokenId,
    },
    Data {
        sender: Contact,
        consumer_id: ConsumerId,
        message: Vec<u8>,
    },
}

impl Packet {
    pub fn encode_ping(sender: &Contact, token: TokenId) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.put_u8(PING_FLAG);
        sender.encode(&mut buf);
        buf.put_i64(token);

        buf
    }

    pub fn encode_data(sender: &Contact, consumer_id: ConsumerId, message: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(message.len() + 128);

        buf.put_u8(DATA_FLAG);
        sender.encode(&mut buf);
        put_bytes(&mut buf, consumer_id.as_bytes());
        put_bytes(&mut buf, message);

        buf
    }

    /// Decodes a packet received from `from`, with contacts reachable the same way
    /// as `template`.
    ///
    /// A sender advertising an unspecified ip is assumed to be at the ip the
    /// packet came from.
    pub fn decode(bytes: &[u8], template: &Contact, from: SocketAddr) -> Result<Packet> {
        let mut buf = bytes;

        let flag = get_u8(&mut buf)?;
        if flag != PING_FLAG && flag != DATA_FLAG {
            return Err(Error::UnknownPacketFlag(flag));
        }

        let mut sender = Contact::decode(&mut buf, template)?;

        if let Some(advertised) = sender.address() {
            if advertised.ip().is_unspecified() {
                sender = sender.with_address(SocketAddr::new(from.ip(), advertised.port()));
            }
        }

        if flag == PING_FLAG {
            let token = get_i64(&mut buf)?;

            return Ok(Packet::Ping { sender, token });
        }

        let consumer_id: [u8; 16] = get_bytes(&mut buf)?
            .try_into()
            .map_err(|_| Error::MalformedPacket("consumer id length"))?;
        let message = get_bytes(&mut buf)?.to_vec();

        Ok(Packet::Data {
            sender,
            consumer_id: ConsumerId(consumer_id),
            message,
        })
    }
}

#[derive(Debug)]
/// The sending half of a UDP node, shared by every contact reached through it.
pub struct UdpLink {
    socket: Mutex<UdpSocket>,
    local_addr: SocketAddr,
    callback: Arc<Callback>,
    bytes_sent: AtomicU64,
}

impl UdpLink {
    pub(crate) fn bind(address: SocketAddr, callback: Arc<Callback>) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(address)?;
        let local_addr = socket.local_addr()?;

        Ok(Arc::new(UdpLink {
            socket: Mutex::new(socket),
            local_addr,
            callback,
            bytes_sent: AtomicU64::new(0),
        }))
    }

    // === Getters ===

    /// Returns the address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Total bytes sent through this socket.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    // === Public Methods ===

    /// Sends `message` to the consumer `consumer_id` of the node at `address`.
    pub fn send(
        &self,
        source: &Contact,
        address: SocketAddr,
        consumer_id: ConsumerId,
        message: &[u8],
    ) -> Result<()> {
        let packet = Packet::encode_data(source, consumer_id, message);

        self.send_to(&packet, address)
    }

    /// Pings the node at `address`, returns the round trip time if it answered
    /// within `timeout`.
    pub fn ping(&self, source: &Contact, address: SocketAddr, timeout: Duration) -> Option<Duration> {
        let mut token = self.callback.allocate_token();
        let start = Instant::now();

        let answered = match self.send_to(&Packet::encode_ping(source, token.id()), address) {
            Ok(()) => token.wait(timeout),
            Err(error) => {
                debug!(context = "socket_ping", ?error, ?address, "Failed to send ping");
                false
            }
        };

        self.callback.free_token(&token);

        answered.then(|| start.elapsed())
    }

    // === Private Methods ===

    /// A second handle to the socket, blocking reads for at most [READ_TIMEOUT].
    fn receiver(&self) -> Result<UdpSocket> {
        let socket = self.socket.lock().try_clone()?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        Ok(socket)
    }

    fn send_to(&self, packet: &[u8], address: SocketAddr) -> Result<()> {
        if packet.len() > MAX_PACKET_SIZE {
            return Err(Error::MalformedPacket("packet too large"));
        }

        trace!(context = "socket_sending", ?address, len = packet.len());

        let sent = self.socket.lock().send_to(packet, address)?;
        self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);

        Ok(())
    }
}

/// Work handed from the receive thread to the dispatch thread.
enum Job {
    Ping {
        sender: Contact,
        token: TokenId,
    },
    Update(Contact),
    Deliver {
        sender: Contact,
        consumer_id: ConsumerId,
        message: Vec<u8>,
    },
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::Ping { .. } => "ping",
            Job::Update(_) => "update",
            Job::Deliver { .. } => "deliver",
        }
    }
}

/// Spawns the receive, dispatch and maintenance threads of a UDP node.
///
/// The threads exit once the node is shut down or dropped.
pub(crate) fn start(node: &Arc<NodeInner>, link: &UdpLink) -> Result<()> {
    let socket = link.receiver()?;
    let (sender, receiver) = flume::bounded(JOB_QUEUE_SIZE);

    let weak = Arc::downgrade(node);
    thread::Builder::new()
        .name("drt-receive".to_string())
        .spawn(move || receive_loop(socket, weak, sender))?;

    let weak = Arc::downgrade(node);
    thread::Builder::new()
        .name("drt-dispatch".to_string())
        .spawn(move || dispatch_loop(weak, receiver))?;

    let weak = Arc::downgrade(node);
    thread::Builder::new()
        .name("drt-maintenance".to_string())
        .spawn(move || maintenance_loop(weak))?;

    Ok(())
}

fn running(node: &Weak<NodeInner>) -> Option<Node> {
    node.upgrade()
        .map(Node::from_inner)
        .filter(Node::is_running)
}

fn receive_loop(socket: UdpSocket, node: Weak<NodeInner>, jobs: Sender<Job>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        if running(&node).is_none() {
            break;
        }

        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(error) => {
                debug!(context = "socket_error", ?error, "recv_from failed unexpectedly");
                continue;
            }
        };

        let Some(node) = running(&node) else {
            break;
        };

        trace!(context = "socket_receiving", ?from, len);

        let job = match Packet::decode(&buf[..len], node.local_contact(), from) {
            Ok(Packet::Ping { sender, token }) => Job::Ping { sender, token },
            Ok(Packet::Data {
                sender,
                consumer_id,
                message,
            }) if consumer_id == CALLBACK_ID => {
                // Responses are released right away, whoever waits for them may be
                // the dispatch thread itself.
                if let Err(error) = node.dispatch(&sender, consumer_id, &message) {
                    debug!(context = "socket_response", ?error, ?from, "Dropped response");
                }
                Job::Update(sender)
            }
            Ok(Packet::Data {
                sender,
                consumer_id,
                message,
            }) => Job::Deliver {
                sender,
                consumer_id,
                message,
            },
            Err(error) => {
                debug!(context = "socket_validation", ?error, ?from, "Dropped packet");
                continue;
            }
        };

        if !enqueue(&jobs, job) {
            break;
        }
    }

    trace!(context = "socket", "Receive thread stopped");
}

/// Queues `job`, dropping it if the dispatch thread is too far behind.
///
/// Returns `false` once the dispatch thread is gone.
fn enqueue(jobs: &Sender<Job>, job: Job) -> bool {
    match jobs.try_send(job) {
        Ok(()) => true,
        Err(TrySendError::Full(job)) => {
            debug!(context = "socket_validation", job = job.kind(), "Job queue full, dropped packet");
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

fn dispatch_loop(node: Weak<NodeInner>, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        let Some(node) = running(&node) else {
            break;
        };

        match job {
            Job::Ping { sender, token } => {
                // Acknowledge before the table update, which may block on pings of its own.
                if let Err(error) =
                    node.callback()
                        .send_response(node.local_contact(), &sender, token, &PING_ACK)
                {
                    debug!(context = "socket_ping", ?error, "Failed to acknowledge ping");
                }

                if let Err(error) = node.deliver_ping(&sender) {
                    warn!(context = "routing_table", ?error, "Failed to update routing table");
                }
            }
            Job::Update(sender) => {
                if let Err(error) = node.routing_table().update(&sender) {
                    warn!(context = "routing_table", ?error, "Failed to update routing table");
                }
            }
            Job::Deliver {
                sender,
                consumer_id,
                message,
            } => {
                if let Err(error) = node.deliver(&sender, consumer_id, &message) {
                    debug!(context = "dispatch", ?error, ?consumer_id, "Failed to deliver message");
                }
            }
        }
    }

    trace!(context = "socket", "Dispatch thread stopped");
}

fn maintenance_loop(node: Weak<NodeInner>) {
    loop {
        thread::sleep(MAINTENANCE_INTERVAL);

        let Some(node) = running(&node) else {
            break;
        };

        node.refresh_far_buckets(false);
    }

    trace!(context = "socket", "Maintenance thread stopped");
}

#[cfg(test)]
mod test {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    fn udp_node() -> Node {
        Node::builder()
            .udp(SocketAddr::from(([127, 0, 0, 1], 0)))
            .unwrap()
    }

    /// `to`, as reached through the socket of `from`.
    fn contact_of(from: &Node, to: &Node) -> Contact {
        from.udp_contact(*to.id(), to.local_addr().unwrap()).unwrap()
    }

    #[test]
    fn ping_packet_layout() {
        let node = udp_node();
        let packet = Packet::encode_ping(node.local_contact(), 0x0102);

        assert_eq!(packet[0], PING_FLAG);
        assert_eq!(&packet[packet.len() - 8..], &[0, 0, 0, 0, 0, 0, 1, 2]);

        let from = node.local_addr().unwrap();
        match Packet::decode(&packet, node.local_contact(), from).unwrap() {
            Packet::Ping { sender, token } => {
                assert_eq!(&sender, node.local_contact());
                assert_eq!(sender.address(), Some(from));
                assert_eq!(token, 0x0102);
            }
            Packet::Data { .. } => panic!("expected a ping"),
        }

        node.shutdown();
    }

    #[test]
    fn data_packet_round_trip() {
        let node = udp_node();
        let consumer_id = ConsumerId::from_u128(7);

        let packet = Packet::encode_data(node.local_contact(), consumer_id, b"hello");

        let from = node.local_addr().unwrap();
        match Packet::decode(&packet, node.local_contact(), from).unwrap() {
            Packet::Data {
                consumer_id: decoded,
                message,
                ..
            } => {
                assert_eq!(decoded, consumer_id);
                assert_eq!(message, b"hello");
            }
            Packet::Ping { .. } => panic!("expected data"),
        }

        node.shutdown();
    }

    #[test]
    fn unspecified_sender_ip_is_the_source_ip() {
        let node = udp_node();

        let advertised = node
            .local_contact()
            .with_address(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 4000)));
        let packet = Packet::encode_ping(&advertised, 1);

        let from = SocketAddr::from(([10, 0, 0, 9], 5555));
        match Packet::decode(&packet, node.local_contact(), from).unwrap() {
            Packet::Ping { sender, .. } => {
                assert_eq!(sender.address(), Some(SocketAddr::from(([10, 0, 0, 9], 4000))));
            }
            Packet::Data { .. } => panic!("expected a ping"),
        }

        node.shutdown();
    }

    #[test]
    fn rejects_unknown_flag_and_truncation() {
        let node = udp_node();
        let from = node.local_addr().unwrap();

        assert!(matches!(
            Packet::decode(&[9, 0, 0], node.local_contact(), from),
            Err(Error::UnknownPacketFlag(9))
        ));

        let packet = Packet::encode_data(node.local_contact(), CALLBACK_ID, b"payload");
        assert!(matches!(
            Packet::decode(&packet[..packet.len() - 3], node.local_contact(), from),
            Err(Error::MalformedPacket(_))
        ));

        assert!(Packet::decode(&[], node.local_contact(), from).is_err());

        node.shutdown();
    }

    #[test]
    fn garbage_does_not_stop_the_receive_loop() {
        let a = udp_node();
        let b = udp_node();
        let target = b.local_addr().unwrap();

        let garbage = UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        garbage.send_to(&[9, 0, 0], target).unwrap();

        let packet = Packet::encode_data(a.local_contact(), CALLBACK_ID, b"payload");
        garbage.send_to(&packet[..packet.len() - 3], target).unwrap();
        garbage.send_to(&[], target).unwrap();

        assert!(a.ping(&contact_of(&a, &b)).is_some());

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn full_job_queue_drops_jobs() {
        let node = udp_node();
        let (sender, receiver) = flume::bounded(1);

        assert!(enqueue(&sender, Job::Update(node.local_contact().clone())));
        assert!(enqueue(&sender, Job::Update(node.local_contact().clone())));
        assert_eq!(receiver.len(), 1);

        drop(receiver);
        assert!(!enqueue(&sender, Job::Update(node.local_contact().clone())));

        node.shutdown();
    }

    #[test]
    fn oversized_packets_are_refused() {
        let node = udp_node();
        let peer = udp_node();

        let result = node.send(
            &contact_of(&node, &peer),
            CALLBACK_ID,
            &vec![0u8; MAX_PACKET_SIZE],
        );
        assert!(matches!(result, Err(Error::MalformedPacket(_))));

        node.shutdown();
        peer.shutdown();
    }

    #[test]
    fn loopback_ping() {
        let a = udp_node();
        let b = udp_node();

        let rtt = a.ping(&contact_of(&a, &b));
        assert!(rtt.is_some());

        // The pinged node learns about the pinger.
        let deadline = Instant::now() + Duration::from_secs(2);
        while !b.routing_table().contains(a.id()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(b.routing_table().contains(a.id()));
        assert_eq!(a.callback().pending(), 0);

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn ping_after_shutdown_times_out() {
        let a = udp_node();
        let b = udp_node();
        a.config().set_ping_timeout(Duration::from_millis(200));

        let contact = contact_of(&a, &b);
        b.shutdown();
        thread::sleep(READ_TIMEOUT * 3);

        assert!(a.ping(&contact).is_none());
        assert_eq!(a.callback().pending(), 0);

        a.shutdown();
    }
}
