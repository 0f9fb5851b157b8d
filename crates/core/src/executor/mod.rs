//! The barrier executor: a fixed thread pool playing a flat step program.
//!
//! Construction derives the program from the node config: one `ExecuteOp`
//! step per op of every segment, then one `SyncNodes` step per segment that
//! has sync descriptors (only in multi-node meshes). Worker threads are
//! spawned once and epoch-dispatched: every `forward()` bumps the epoch to
//! release them from idle, and all threads rendezvous on a barrier after
//! each step.
//!
//! Failure policy: a worker never unwinds across the pool. It flags the run
//! dead, logs, and drains; `forward()` observes the flag and returns the
//! error. A stalled step is detected by the watchdog and aborted the same
//! way. A failed forward is terminal for this executor.

pub mod context;
pub mod execution;
pub mod watchdog;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, warn};

use crate::collective::NodeSynchronizer;
use crate::config::{NetConfig, NodeConfig};
use crate::device::{DeviceBinding, DeviceError, DeviceSegment};
use crate::net::NetError;

use context::{BarrierPolicy, ExecutorContext, Step, StepType};
use execution::NetExecution;
use watchdog::{StallAction, StallTracker, WatchdogConfig};

/// Errors raised by executor construction and `forward()`.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Construction-time misconfiguration; never raised during a forward.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A worker thread hit a runtime failure; details were logged.
    #[error("execution failed in one of the worker threads")]
    Failed,

    /// The watchdog gave up on a stalled step.
    #[error("forward stalled for {stalled_ms} ms at step {step_index} ({label})")]
    StallTimeout {
        step_index: usize,
        label: String,
        stalled_ms: u64,
    },

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Tunables fixed at executor construction.
#[derive(Clone, Copy, Default)]
pub struct ExecutorOptions {
    /// Accumulate per-step-type wall time, readable via `total_time`.
    pub benchmark: bool,
    pub barrier: BarrierPolicy,
    pub watchdog: WatchdogConfig,
}

/// Drives one node's program over a fixed worker thread pool.
pub struct Executor {
    context: Arc<ExecutorContext>,
    execution: Arc<NetExecution>,
    node_config: NodeConfig,
    segments: Vec<Option<Arc<dyn DeviceSegment>>>,
    watchdog: WatchdogConfig,
    threads: Vec<JoinHandle<()>>,
}

impl Executor {
    /// Build the step program, create device segments and spawn the pool.
    pub fn new(
        net_config: &NetConfig,
        node_config: NodeConfig,
        devices: &[DeviceBinding],
        execution: Arc<NetExecution>,
        synchronizer: Arc<dyn NodeSynchronizer>,
        options: ExecutorOptions,
    ) -> Result<Self> {
        let n_threads = execution.n_threads();
        let max_threads = devices.iter().map(|b| b.device.max_threads()).max().unwrap_or(0);
        if n_threads > max_threads {
            return Err(ExecutorError::InvalidConfig(format!(
                "this configuration supports max {max_threads} threads"
            )));
        }

        let use_synchronizer = net_config.n_nodes > 1;
        let mut segments: Vec<Option<Arc<dyn DeviceSegment>>> =
            Vec::with_capacity(node_config.segments.len());
        let mut steps = Vec::new();

        for (segment_index, segment_config) in node_config.segments.iter().enumerate() {
            let binding = devices
                .iter()
                .find(|b| b.covers(segment_index))
                .ok_or_else(|| {
                    ExecutorError::InvalidConfig(format!(
                        "cannot locate device for segment {segment_index}"
                    ))
                })?;

            if segment_config.ops.is_empty() {
                segments.push(None);
            } else {
                let segment = binding
                    .device
                    .create_segment(segment_index)
                    .map_err(|e| ExecutorError::InvalidConfig(e.to_string()))?;
                for (op_index, op) in segment_config.ops.iter().enumerate() {
                    steps.push(Step::Op {
                        segment: segment.clone(),
                        op_index,
                        name: op.name.clone(),
                    });
                }
                segments.push(Some(segment));
            }

            if use_synchronizer && !segment_config.syncs.is_empty() {
                steps.push(Step::Sync { segment_index });
            }
        }

        let context = Arc::new(ExecutorContext::new(
            n_threads,
            steps,
            synchronizer,
            options.barrier,
            options.benchmark,
        ));

        let threads = (0..n_threads)
            .map(|thread_index| {
                let ctx = context.clone();
                std::thread::Builder::new()
                    .name(format!("executor-{thread_index}"))
                    .spawn(move || worker_loop(ctx, thread_index))
                    .expect("spawn executor thread")
            })
            .collect();

        Ok(Self {
            context,
            execution,
            node_config,
            segments,
            watchdog: options.watchdog,
            threads,
        })
    }

    pub fn n_steps(&self) -> usize {
        self.context.steps.len()
    }

    /// Step kinds in program order; useful for planning checks.
    pub fn step_types(&self) -> Vec<StepType> {
        self.context.steps.iter().map(Step::step_type).collect()
    }

    /// Run one forward pass with the batch size currently set on the
    /// execution state.
    ///
    /// # Panics
    /// Panics when no batch size was set.
    pub fn forward(&self) -> Result<()> {
        let batch_size = self.execution.batch_size();
        assert!(batch_size > 0, "batch size must be set before forward");

        let ctx = &self.context;
        {
            let _guard = ctx.mutex.lock().unwrap();
            ctx.is_alive.store(true, Ordering::Release);
            ctx.current_step.store(0, Ordering::Release);
            ctx.done_threads.store(0, Ordering::Release);
            ctx.done_run_threads.store(0, Ordering::Release);
            ctx.is_run_done.store(false, Ordering::Release);
            ctx.batch_size.store(batch_size, Ordering::Release);
            if let Some(bench) = &ctx.bench {
                bench.reset();
            }
            ctx.epoch.fetch_add(1, Ordering::AcqRel);
            ctx.condvar.notify_all();
        }

        let mut tracker = StallTracker::new(self.watchdog, Instant::now());
        let mut guard = ctx.mutex.lock().unwrap();
        loop {
            if ctx.is_shutdown.load(Ordering::Acquire)
                || ctx.is_run_done.load(Ordering::Acquire)
                || !ctx.is_alive.load(Ordering::Acquire)
            {
                break;
            }
            let (g, _) = ctx
                .condvar
                .wait_timeout(guard, Duration::from_millis(50))
                .unwrap();
            guard = g;

            let step_index = ctx.current_step.load(Ordering::Acquire);
            match tracker.observe(step_index, Instant::now()) {
                StallAction::None => {}
                StallAction::Log { stalled } => {
                    let (step_type, label) = self.step_info(step_index);
                    warn!(
                        step_index,
                        step_type,
                        op = label,
                        done_threads = ctx.done_threads.load(Ordering::Acquire),
                        n_threads = ctx.n_threads,
                        stalled_ms = stalled.as_millis() as u64,
                        "forward is stalled"
                    );
                }
                StallAction::Abort { stalled } => {
                    ctx.is_alive.store(false, Ordering::Release);
                    ctx.is_run_done.store(true, Ordering::Release);
                    // Bump the epoch so workers leave their inner waits.
                    ctx.epoch.fetch_add(1, Ordering::AcqRel);
                    ctx.condvar.notify_all();
                    drop(guard);
                    let (step_type, label) = self.step_info(step_index);
                    let stalled_ms = stalled.as_millis() as u64;
                    error!(step_index, step_type, op = label, stalled_ms, "forward aborted by watchdog");
                    return Err(ExecutorError::StallTimeout {
                        step_index,
                        label: label.to_string(),
                        stalled_ms,
                    });
                }
            }
        }
        let failed = !ctx.is_alive.load(Ordering::Acquire);
        drop(guard);

        if failed {
            return Err(ExecutorError::Failed);
        }
        Ok(())
    }

    fn step_info(&self, step_index: usize) -> (&'static str, &str) {
        match self.context.steps.get(step_index) {
            Some(step) => (
                match step.step_type() {
                    StepType::ExecuteOp => "execute_op",
                    StepType::SyncNodes => "sync_nodes",
                },
                step.label(),
            ),
            None => ("finished", "-"),
        }
    }

    /// Import a weight blob into the op identified by `name` and `op_index`.
    ///
    /// Not safe to interleave with `forward()`; the host serializes them.
    pub fn load_weight(&self, name: &str, op_index: u32, offset: u64, data: &[u8]) -> Result<()> {
        for (segment_index, segment_config) in self.node_config.segments.iter().enumerate() {
            for (local_index, op) in segment_config.ops.iter().enumerate() {
                if op.index == op_index && op.name == name {
                    let segment = self.segments[segment_index]
                        .as_ref()
                        .expect("segment with ops has a device segment");
                    return segment
                        .load_weight(local_index, offset, data)
                        .map_err(ExecutorError::from);
                }
            }
        }
        Err(ExecutorError::InvalidConfig(format!(
            "cannot locate op by name: {name}"
        )))
    }

    /// Accumulated wall time in microseconds for `step_type`; zero unless
    /// the executor was built with `benchmark`.
    pub fn total_time(&self, step_type: StepType) -> u64 {
        self.context
            .bench
            .as_ref()
            .map(|bench| bench.total_micros[step_type as usize].load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        let ctx = &self.context;
        {
            let _guard = ctx.mutex.lock().unwrap();
            ctx.is_shutdown.store(true, Ordering::Release);
            ctx.epoch.fetch_add(1, Ordering::AcqRel);
            ctx.condvar.notify_all();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn execute_step(ctx: &ExecutorContext, step: &Step, thread_index: usize) -> Result<()> {
    let batch_size = ctx.batch_size.load(Ordering::Acquire) as usize;
    match step {
        Step::Op { segment, op_index, .. } => segment
            .forward(*op_index, ctx.n_threads, thread_index, batch_size)
            .map_err(ExecutorError::from),
        Step::Sync { segment_index } => ctx
            .synchronizer
            .sync(*segment_index, ctx.n_threads, thread_index)
            .map_err(ExecutorError::from),
    }
}

fn worker_loop(ctx: Arc<ExecutorContext>, thread_index: usize) {
    let mut local_epoch = 0u64;
    let last_arriver = ctx.n_threads - 1;

    loop {
        ctx.wait_for_epoch(local_epoch);
        if ctx.is_shutdown.load(Ordering::Acquire) {
            break;
        }
        local_epoch = ctx.epoch.load(Ordering::Acquire);

        while ctx.is_alive.load(Ordering::Acquire) {
            let step_index = ctx.current_step.load(Ordering::Acquire);
            if step_index == ctx.steps.len() {
                break;
            }

            let step = &ctx.steps[step_index];
            if let Err(e) = execute_step(&ctx, step, thread_index) {
                ctx.is_alive.store(false, Ordering::Release);
                error!(
                    thread_index,
                    step_index,
                    op = step.label(),
                    error = %e,
                    "execution error"
                );
                ctx.notify_all();
                break;
            }

            let arrived = ctx.done_threads.fetch_add(1, Ordering::AcqRel);
            if arrived == last_arriver {
                if let Some(bench) = &ctx.bench {
                    bench.mark(step.step_type());
                }
                ctx.done_threads.store(0, Ordering::Release);
                ctx.current_step.fetch_add(1, Ordering::AcqRel);
                ctx.notify_all();
            } else {
                ctx.wait_step_advance(step_index, local_epoch);
                if ctx.is_shutdown.load(Ordering::Acquire)
                    || ctx.epoch.load(Ordering::Acquire) != local_epoch
                {
                    break;
                }
            }
        }

        let finished = ctx.done_run_threads.fetch_add(1, Ordering::AcqRel);
        if finished == last_arriver {
            ctx.is_run_done.store(true, Ordering::Release);
            ctx.notify_all();
        }
    }
}
