//! Miscellaneous common structs used throughout the library.

mod contact;
mod id;
mod kbucket;
mod min_max_heap;
mod routing_table;
pub(crate) mod wire;

pub use contact::*;
pub(crate) use contact::Endpoint;
pub use id::*;
pub use kbucket::*;
pub use min_max_heap::*;
pub use routing_table::*;
