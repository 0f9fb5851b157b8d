//! Shared test utilities for tensormesh-core.
//!
//! Device doubles and loopback network builders used by unit and
//! integration tests. Compiled only for tests or behind the `test-utils`
//! feature.

mod devices;
mod loopback;

pub use devices::{CountingDevice, FailingDevice, ForwardCall, SleepDevice, WeightCall};
pub use loopback::{loopback_mesh, network_pair, stream_pair};
