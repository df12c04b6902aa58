//! Struct and implementation of the Contact entry in the routing table
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use super::wire::{get_bytes, get_i32, put_bytes};
use crate::common::Id;
use crate::local::LocalNetwork;
use crate::rpc::ConsumerId;
use crate::socket::UdpLink;
use crate::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
/// Identifier of a logical network. Tables only ever hold contacts of their own network.
pub struct NetworkId(pub [u8; 16]);

impl NetworkId {
    pub fn random() -> Self {
        NetworkId(rand::random())
    }

    pub const fn from_u128(value: u128) -> Self {
        NetworkId(value.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Debug for NetworkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({:032x})", u128::from_be_bytes(self.0))
    }
}

/// How messages reach the peer behind a [Contact].
#[derive(Clone)]
pub(crate) enum Endpoint {
    /// A node living in the same process, resolved through a [LocalNetwork].
    Local(Arc<LocalNetwork>),
    /// A node behind a UDP socket address, reached through this node's socket.
    Udp {
        address: SocketAddr,
        link: Arc<UdpLink>,
    },
}

#[derive(Clone)]
/// Handle to a remote (or the local) routing table.
///
/// Equality is by [Id] and [NetworkId], hashing by [Id] only.
pub struct Contact(Arc<ContactInner>);

struct ContactInner {
    id: Id,
    network_id: NetworkId,
    endpoint: Endpoint,
}

impl Contact {
    pub(crate) fn new(id: Id, network_id: NetworkId, endpoint: Endpoint) -> Contact {
        Contact(Arc::new(ContactInner {
            id,
            network_id,
            endpoint,
        }))
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.0.id
    }

    pub fn network_id(&self) -> &NetworkId {
        &self.0.network_id
    }

    /// Socket address of a UDP contact, `None` for in-process contacts.
    pub fn address(&self) -> Option<SocketAddr> {
        match &self.0.endpoint {
            Endpoint::Local(_) => None,
            Endpoint::Udp { address, .. } => Some(*address),
        }
    }

    /// Returns `true` if this contact is reached in-process.
    pub fn is_local(&self) -> bool {
        matches!(self.0.endpoint, Endpoint::Local(_))
    }

    // === Public Methods ===

    /// Sends `message` to the consumer `consumer_id` of this contact's table,
    /// on behalf of `source`.
    pub fn send(&self, source: &Contact, consumer_id: ConsumerId, message: &[u8]) -> Result<()> {
        match &self.0.endpoint {
            Endpoint::Local(network) => network.send(self, source, consumer_id, message),
            Endpoint::Udp { address, link } => link.send(source, *address, consumer_id, message),
        }
    }

    /// Pings this contact on behalf of `source`.
    ///
    /// Returns the round trip time, or `None` if it did not answer within `timeout`.
    pub fn ping(&self, source: &Contact, timeout: Duration) -> Option<Duration> {
        match &self.0.endpoint {
            Endpoint::Local(network) => network.ping(self, source),
            Endpoint::Udp { address, link } => link.ping(source, *address, timeout),
        }
    }

    /// Encodes this contact as
    /// `[i32 len][id][i32 len][network id][i32 port][i32 len][address]`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        put_bytes(buf, self.id().as_bytes());
        put_bytes(buf, self.network_id().as_bytes());

        match self.address() {
            None => {
                buf.put_i32(0);
                put_bytes(buf, &[]);
            }
            Some(address) => {
                buf.put_i32(address.port() as i32);
                match address.ip() {
                    IpAddr::V4(ip) => put_bytes(buf, &ip.octets()),
                    IpAddr::V6(ip) => put_bytes(buf, &ip.octets()),
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a contact reachable the same way (in-process or over the same
    /// socket) as `template`, which is normally the local contact.
    pub fn decode(buf: &mut &[u8], template: &Contact) -> Result<Contact> {
        let id = Id::from_bytes(get_bytes(buf)?)?;

        let network_id: [u8; 16] = get_bytes(buf)?
            .try_into()
            .map_err(|_| Error::MalformedPacket("network id length"))?;

        let port = get_i32(buf)?;
        let address = get_bytes(buf)?;

        let endpoint = match (&template.0.endpoint, address.len()) {
            (Endpoint::Local(network), 0) => Endpoint::Local(network.clone()),
            (Endpoint::Udp { link, .. }, len) if len == 4 || len == 16 => {
                let port = u16::try_from(port).map_err(|_| Error::MalformedPacket("port"))?;
                let ip = ip_from_octets(address)?;

                Endpoint::Udp {
                    address: SocketAddr::new(ip, port),
                    link: link.clone(),
                }
            }
            _ => return Err(Error::MalformedPacket("contact endpoint")),
        };

        Ok(Contact::new(id, NetworkId(network_id), endpoint))
    }

    /// Same contact, reachable at another address. Used to substitute an
    /// unspecified advertised ip with the observed one.
    pub(crate) fn with_address(&self, address: SocketAddr) -> Contact {
        match &self.0.endpoint {
            Endpoint::Local(_) => self.clone(),
            Endpoint::Udp { link, .. } => Contact::new(
                self.0.id,
                self.0.network_id,
                Endpoint::Udp {
                    address,
                    link: link.clone(),
                },
            ),
        }
    }
}

fn ip_from_octets(octets: &[u8]) -> Result<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(octets) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(octets) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }

    Err(Error::MalformedPacket("address length"))
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id && self.0.network_id == other.0.network_id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state)
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.0.id)
            .field("network_id", &self.0.network_id)
            .field("address", &self.address())
            .finish()
    }
}
