//! The wire layer: socket primitives, mesh bring-up and the indexed
//! socket array.

pub mod error;
pub mod mesh;
pub mod metrics;
pub mod network;
pub mod socket;

pub use error::{NetError, Result};
pub use mesh::{socket_index_for_node, PeerAddr};
pub use network::{Network, ReadIo, WriteIo, ROOT_SOCKET_INDEX};
