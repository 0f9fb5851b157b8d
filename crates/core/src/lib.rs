//! Distributed execution core for sharded neural-network inference.
//!
//! A single forward pass is split across a small cluster of nodes connected
//! by a full TCP mesh, and within each node across a fixed pool of worker
//! threads. The crate provides:
//!
//! - [`net`]: socket primitives, the mesh bring-up handshake and the
//!   indexed socket array with transfer telemetry
//! - [`collective`]: broadcast and all-reduce patterns over the mesh, with
//!   star and ring topologies
//! - [`wire`]: the root-to-worker config and weight streaming protocols
//! - [`executor`]: the barrier executor playing the per-node step program
//! - [`config`] / [`device`]: the descriptor data model and the opaque
//!   compute-device seam
//!
//! The host builds the configs, brings up a [`net::Network`], then runs an
//! [`executor::Executor`] with a [`collective::NetworkSynchronizer`] (or
//! [`collective::NullSynchronizer`] on a single node) and calls `forward()`
//! per inference step.

pub mod collective;
pub mod config;
pub mod device;
pub mod executor;
pub mod net;
pub mod wire;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use collective::{CollectiveType, NetworkSynchronizer, NodeSynchronizer, NullSynchronizer};
pub use config::{FloatType, NetConfig, NodeConfig, SyncType};
pub use device::{Device, DeviceBinding, DeviceSegment};
pub use executor::context::{BarrierPolicy, StepType};
pub use executor::execution::NetExecution;
pub use executor::watchdog::WatchdogConfig;
pub use executor::{Executor, ExecutorError, ExecutorOptions};
pub use net::{Network, PeerAddr};
