//! Message consumers and the request/response machinery built on them.

pub mod callback;
pub mod closest_nodes;
pub mod config;
pub(crate) mod messages;

use std::any::Any;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::common::Contact;
use crate::Result;

pub use callback::{Callback, WaitToken};
pub use closest_nodes::{ClosestResults, GetClosestNodes};
pub use config::Config;

/// Correlation token identifier, unique while the token is pending.
pub type TokenId = i64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Address of a [MessageConsumer] within a node.
pub struct ConsumerId(pub [u8; 16]);

impl ConsumerId {
    pub const fn from_u128(value: u128) -> Self {
        ConsumerId(value.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Debug for ConsumerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let value = u128::from_be_bytes(self.0);

        write!(
            f,
            "ConsumerId({:08x}-{:04x}-{:04x}-{:04x}-{:012x})",
            value >> 96,
            (value >> 80) & 0xffff,
            (value >> 64) & 0xffff,
            (value >> 48) & 0xffff,
            value & 0xffff_ffff_ffff
        )
    }
}

/// A handler for messages addressed to one [ConsumerId] of a node.
pub trait MessageConsumer: Send + Sync {
    fn consumer_id(&self) -> ConsumerId;

    /// Other consumers this one needs registered beside it.
    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Handle a `message` sent by `source`.
    fn deliver(&self, source: &Contact, message: &[u8]) -> Result<()>;

    /// Called once registered, with every resolved dependency.
    fn on_registered(&self, _links: &Links) {}

    fn on_unregistered(&self) {}
}

/// Constructor of a default consumer, for dependencies that may be created on demand.
pub type ConsumerFactory = fn() -> Registered;

#[derive(Clone, Debug)]
/// A consumer's requirement on another consumer.
pub struct Dependency {
    pub consumer_id: ConsumerId,
    /// Registration of an optional dependency never fails, it is simply absent from [Links].
    pub optional: bool,
    /// Used to create and register the dependency if it is missing.
    pub default: Option<ConsumerFactory>,
}

impl Dependency {
    pub fn required(consumer_id: ConsumerId) -> Self {
        Dependency {
            consumer_id,
            optional: false,
            default: None,
        }
    }

    pub fn optional(consumer_id: ConsumerId) -> Self {
        Dependency {
            consumer_id,
            optional: true,
            default: None,
        }
    }

    pub fn with_default(mut self, default: ConsumerFactory) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Clone)]
/// A consumer as kept in a node's registry, both as a trait object for
/// dispatch and as [Any] for typed lookups.
pub struct Registered {
    consumer: Arc<dyn MessageConsumer>,
    any: Arc<dyn Any + Send + Sync>,
}

impl Registered {
    pub fn new<C: MessageConsumer + 'static>(consumer: Arc<C>) -> Self {
        Registered {
            consumer: consumer.clone(),
            any: consumer,
        }
    }

    pub fn consumer(&self) -> &Arc<dyn MessageConsumer> {
        &self.consumer
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer.consumer_id()
    }

    /// Returns the concrete consumer if it is a `C`.
    pub fn downcast<C: MessageConsumer + 'static>(&self) -> Option<Arc<C>> {
        self.any.clone().downcast::<C>().ok()
    }
}

impl Debug for Registered {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Registered")
            .field(&self.consumer_id())
            .finish()
    }
}

#[derive(Debug, Default)]
/// Dependencies resolved for a consumer at registration.
pub struct Links {
    resolved: Vec<Registered>,
}

impl Links {
    pub(crate) fn new(resolved: Vec<Registered>) -> Self {
        Links { resolved }
    }

    pub fn get(&self, consumer_id: ConsumerId) -> Option<&Arc<dyn MessageConsumer>> {
        self.resolved
            .iter()
            .find(|registered| registered.consumer_id() == consumer_id)
            .map(Registered::consumer)
    }

    /// Typed access to a resolved dependency.
    pub fn consumer<C: MessageConsumer + 'static>(&self, consumer_id: ConsumerId) -> Option<Arc<C>> {
        self.resolved
            .iter()
            .find(|registered| registered.consumer_id() == consumer_id)
            .and_then(Registered::downcast)
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn consumer_id_debug_is_uuid_like() {
        let id = ConsumerId::from_u128(0x96de743d_8ec0_451e_a2a3_bb915af1095e);

        assert_eq!(
            format!("{id:?}"),
            "ConsumerId(96de743d-8ec0-451e-a2a3-bb915af1095e)"
        );
    }
}
