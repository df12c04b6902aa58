#![doc = include_str!("../README.md")]

// Public modules
pub mod common;
mod error;
pub mod local;
mod node;
pub mod rpc;
pub mod socket;

pub use crate::common::{Contact, Id, NetworkId, RoutingTable};
pub use crate::error::{Error, Result};
pub use crate::local::LocalNetwork;
pub use crate::node::{Info, Node, NodeBuilder};
pub use crate::rpc::{Config, ConsumerId, MessageConsumer};
pub use bytes::Bytes;
