//! Device doubles that record, sleep or fail on demand.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::device::{Device, DeviceError, DeviceSegment, Result};

/// One recorded `forward` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCall {
    pub segment_index: usize,
    pub op_index: usize,
    pub thread_index: usize,
    pub batch_size: usize,
}

/// One recorded `load_weight` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightCall {
    pub segment_index: usize,
    pub op_index: usize,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Records every forward and weight call across all its segments.
pub struct CountingDevice {
    max_threads: usize,
    pub forwards: Arc<Mutex<Vec<ForwardCall>>>,
    pub weights: Arc<Mutex<Vec<WeightCall>>>,
}

impl CountingDevice {
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads,
            forwards: Arc::new(Mutex::new(Vec::new())),
            weights: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Device for CountingDevice {
    fn max_threads(&self) -> usize {
        self.max_threads
    }

    fn create_segment(&self, segment_index: usize) -> Result<Arc<dyn DeviceSegment>> {
        Ok(Arc::new(CountingSegment {
            segment_index,
            forwards: self.forwards.clone(),
            weights: self.weights.clone(),
        }))
    }
}

struct CountingSegment {
    segment_index: usize,
    forwards: Arc<Mutex<Vec<ForwardCall>>>,
    weights: Arc<Mutex<Vec<WeightCall>>>,
}

impl DeviceSegment for CountingSegment {
    fn forward(
        &self,
        op_index: usize,
        _n_threads: usize,
        thread_index: usize,
        batch_size: usize,
    ) -> Result<()> {
        self.forwards.lock().unwrap().push(ForwardCall {
            segment_index: self.segment_index,
            op_index,
            thread_index,
            batch_size,
        });
        Ok(())
    }

    fn load_weight(&self, op_index: usize, offset: u64, data: &[u8]) -> Result<()> {
        self.weights.lock().unwrap().push(WeightCall {
            segment_index: self.segment_index,
            op_index,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }
}

/// Every op sleeps for a fixed duration; drives watchdog tests.
pub struct SleepDevice {
    max_threads: usize,
    delay: Duration,
}

impl SleepDevice {
    pub fn new(max_threads: usize, delay: Duration) -> Self {
        Self { max_threads, delay }
    }
}

impl Device for SleepDevice {
    fn max_threads(&self) -> usize {
        self.max_threads
    }

    fn create_segment(&self, _segment_index: usize) -> Result<Arc<dyn DeviceSegment>> {
        Ok(Arc::new(SleepSegment { delay: self.delay }))
    }
}

struct SleepSegment {
    delay: Duration,
}

impl DeviceSegment for SleepSegment {
    fn forward(&self, _: usize, _: usize, _: usize, _: usize) -> Result<()> {
        std::thread::sleep(self.delay);
        Ok(())
    }

    fn load_weight(&self, _: usize, _: u64, _: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Fails a specific op index; drives abort-path tests.
pub struct FailingDevice {
    max_threads: usize,
    fail_at_op: usize,
}

impl FailingDevice {
    pub fn new(max_threads: usize, fail_at_op: usize) -> Self {
        Self { max_threads, fail_at_op }
    }
}

impl Device for FailingDevice {
    fn max_threads(&self) -> usize {
        self.max_threads
    }

    fn create_segment(&self, _segment_index: usize) -> Result<Arc<dyn DeviceSegment>> {
        Ok(Arc::new(FailingSegment { fail_at_op: self.fail_at_op }))
    }
}

struct FailingSegment {
    fail_at_op: usize,
}

impl DeviceSegment for FailingSegment {
    fn forward(&self, op_index: usize, _: usize, _: usize, _: usize) -> Result<()> {
        if op_index == self.fail_at_op {
            return Err(DeviceError::Op { op_index, reason: "injected failure".into() });
        }
        Ok(())
    }

    fn load_weight(&self, _: usize, _: u64, _: &[u8]) -> Result<()> {
        Ok(())
    }
}
