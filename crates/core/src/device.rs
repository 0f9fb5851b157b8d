//! Device capability seam.
//!
//! The executor never touches tensor math. It sees a device only through two
//! traits: [`Device`] creates a per-segment execution handle, and
//! [`DeviceSegment`] runs one op index cooperatively on N threads. Concrete
//! kernels, weight layouts and memory placement live behind this seam.

use std::sync::Arc;

use thiserror::Error;

/// Failure surfaced by a device kernel or weight import.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// An op kernel failed at runtime.
    #[error("op {op_index} failed: {reason}")]
    Op { op_index: usize, reason: String },

    /// A weight blob did not match the op's expectations.
    #[error("weight rejected for op {op_index}: {reason}")]
    Weight { op_index: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// A compute backend able to execute segments of the node's program.
pub trait Device: Send + Sync {
    /// Upper bound on the executor thread pool this device supports.
    fn max_threads(&self) -> usize;

    /// Build the execution handle for one segment of the node program.
    fn create_segment(&self, segment_index: usize) -> Result<Arc<dyn DeviceSegment>>;
}

/// Execution handle for one segment: data-parallel op dispatch plus weight
/// import.
///
/// `forward` is called once per worker thread per op step; implementations
/// partition their work by `thread_index` and must not assume any ordering
/// between threads within a step.
pub trait DeviceSegment: Send + Sync {
    fn forward(
        &self,
        op_index: usize,
        n_threads: usize,
        thread_index: usize,
        batch_size: usize,
    ) -> Result<()>;

    /// Import `data` into the op's weight storage at `offset`.
    fn load_weight(&self, op_index: usize, offset: u64, data: &[u8]) -> Result<()>;
}

/// Assignment of a device to an inclusive range of segment indices.
#[derive(Clone)]
pub struct DeviceBinding {
    pub device: Arc<dyn Device>,
    /// `None` binds every segment.
    pub segments: Option<(usize, usize)>,
}

impl DeviceBinding {
    /// Bind `device` to all segments.
    pub fn all(device: Arc<dyn Device>) -> Self {
        Self { device, segments: None }
    }

    /// Bind `device` to segments `from..=to`.
    pub fn range(device: Arc<dyn Device>, from: usize, to: usize) -> Self {
        assert!(from <= to, "segment range must be ordered");
        Self { device, segments: Some((from, to)) }
    }

    /// Whether this binding covers `segment_index`.
    pub fn covers(&self, segment_index: usize) -> bool {
        match self.segments {
            None => true,
            Some((from, to)) => segment_index >= from && segment_index <= to,
        }
    }
}
