//! Shared state between the executor's worker threads.
//!
//! All counters and flags are atomics; the mutex exists only to back the
//! condvar. Worker threads rendezvous on [`ExecutorContext::wait_step_advance`]
//! after every step; the last arriver advances `current_step` and wakes the
//! rest.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::collective::NodeSynchronizer;
use crate::device::DeviceSegment;

/// Kinds of entries in the flat step program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StepType {
    ExecuteOp = 0,
    SyncNodes = 1,
}

pub(crate) const N_STEP_TYPES: usize = 2;

/// One entry of the per-node program.
pub(crate) enum Step {
    Op {
        segment: Arc<dyn DeviceSegment>,
        /// Op position within the owning segment.
        op_index: usize,
        /// Op name, for diagnostics.
        name: String,
    },
    Sync {
        segment_index: usize,
    },
}

impl Step {
    pub(crate) fn step_type(&self) -> StepType {
        match self {
            Step::Op { .. } => StepType::ExecuteOp,
            Step::Sync { .. } => StepType::SyncNodes,
        }
    }

    pub(crate) fn label(&self) -> &str {
        match self {
            Step::Op { name, .. } => name,
            Step::Sync { .. } => "sync_nodes",
        }
    }
}

/// How non-last arrivers wait for the step counter to advance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BarrierPolicy {
    /// Sleep on the condvar; minimal CPU, higher wake latency.
    #[default]
    Relaxed,
    /// Spin with `yield_now`; lowest wake latency, burns a core.
    Tight,
}

pub(crate) struct BenchState {
    pub(crate) step_start: Mutex<Instant>,
    /// Accumulated microseconds per step type.
    pub(crate) total_micros: [AtomicU64; N_STEP_TYPES],
}

impl BenchState {
    fn new() -> Self {
        Self {
            step_start: Mutex::new(Instant::now()),
            total_micros: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    pub(crate) fn reset(&self) {
        for total in &self.total_micros {
            total.store(0, Ordering::Relaxed);
        }
        *self.step_start.lock().unwrap() = Instant::now();
    }

    /// Credit the elapsed time since the previous mark to `step_type`.
    /// Called by the last arriver only.
    pub(crate) fn mark(&self, step_type: StepType) {
        let mut start = self.step_start.lock().unwrap();
        let now = Instant::now();
        let micros = now.duration_since(*start).as_micros() as u64;
        self.total_micros[step_type as usize].fetch_add(micros, Ordering::Relaxed);
        *start = now;
    }
}

pub(crate) struct ExecutorContext {
    pub(crate) n_threads: usize,
    pub(crate) steps: Vec<Step>,
    pub(crate) synchronizer: Arc<dyn NodeSynchronizer>,
    pub(crate) barrier: BarrierPolicy,
    pub(crate) bench: Option<BenchState>,

    /// Batch size of the forward in flight; copied in by `forward()`.
    pub(crate) batch_size: AtomicU32,
    pub(crate) epoch: AtomicU64,
    pub(crate) current_step: AtomicUsize,
    pub(crate) done_threads: AtomicUsize,
    pub(crate) done_run_threads: AtomicUsize,
    pub(crate) is_alive: AtomicBool,
    pub(crate) is_shutdown: AtomicBool,
    pub(crate) is_run_done: AtomicBool,

    pub(crate) mutex: Mutex<()>,
    pub(crate) condvar: Condvar,
}

impl ExecutorContext {
    pub(crate) fn new(
        n_threads: usize,
        steps: Vec<Step>,
        synchronizer: Arc<dyn NodeSynchronizer>,
        barrier: BarrierPolicy,
        benchmark: bool,
    ) -> Self {
        Self {
            n_threads,
            steps,
            synchronizer,
            barrier,
            bench: benchmark.then(BenchState::new),
            batch_size: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            current_step: AtomicUsize::new(0),
            done_threads: AtomicUsize::new(0),
            done_run_threads: AtomicUsize::new(0),
            is_alive: AtomicBool::new(true),
            is_shutdown: AtomicBool::new(false),
            is_run_done: AtomicBool::new(true),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn notify_all(&self) {
        // Pairs with waiters that re-check predicates under the mutex.
        let _guard = self.mutex.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Block until a new epoch starts or shutdown is requested.
    pub(crate) fn wait_for_epoch(&self, local_epoch: u64) {
        let guard = self.mutex.lock().unwrap();
        let _guard = self
            .condvar
            .wait_while(guard, |_| {
                !self.is_shutdown.load(Ordering::Acquire)
                    && self.epoch.load(Ordering::Acquire) == local_epoch
            })
            .unwrap();
    }

    /// Wait at the step barrier until the last arriver advances
    /// `current_step`, or the run is torn down.
    pub(crate) fn wait_step_advance(&self, step_index: usize, local_epoch: u64) {
        let done = |ctx: &Self| {
            ctx.is_shutdown.load(Ordering::Acquire)
                || !ctx.is_alive.load(Ordering::Acquire)
                || ctx.epoch.load(Ordering::Acquire) != local_epoch
                || ctx.current_step.load(Ordering::Acquire) != step_index
        };
        match self.barrier {
            BarrierPolicy::Relaxed => {
                let guard = self.mutex.lock().unwrap();
                let _guard = self.condvar.wait_while(guard, |_| !done(self)).unwrap();
            }
            BarrierPolicy::Tight => {
                while !done(self) {
                    std::thread::yield_now();
                }
            }
        }
    }
}
