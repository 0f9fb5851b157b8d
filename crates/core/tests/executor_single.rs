//! Single-node executor scenarios: program construction, the step barrier,
//! failure propagation and the stall watchdog.

use std::sync::Arc;
use std::time::Duration;

use tensormesh_core::config::{
    FloatType, NetConfig, NodeConfig, OpBufferRef, OpConfig, PipeConfig, SegmentConfig, SizeDesc,
    SyncConfig, SyncType,
};
use tensormesh_core::executor::context::StepType;
use tensormesh_core::executor::execution::NetExecution;
use tensormesh_core::executor::{Executor, ExecutorError, ExecutorOptions};
use tensormesh_core::testing::{CountingDevice, FailingDevice, SleepDevice};
use tensormesh_core::{BarrierPolicy, DeviceBinding, NullSynchronizer, WatchdogConfig};

fn net_config(n_nodes: u32, n_batches: u32) -> NetConfig {
    NetConfig {
        n_batches,
        n_nodes,
        pipes: vec![PipeConfig { name: "hidden".into(), size: SizeDesc::new(FloatType::F32, 16) }],
        pre_syncs: Vec::new(),
    }
}

fn op(name: &str, index: u32) -> OpConfig {
    OpConfig {
        code: 0,
        index,
        weight_size: 0,
        name: name.into(),
        input: OpBufferRef::default(),
        output: OpBufferRef::default(),
        config: Vec::new(),
    }
}

fn node_config_with_ops(names: &[&str]) -> NodeConfig {
    NodeConfig {
        node_index: 0,
        buffers: Vec::new(),
        segments: vec![SegmentConfig {
            syncs: vec![SyncConfig { pipe_index: 0, sync_type: SyncType::NodeSlices }],
            ops: names.iter().enumerate().map(|(i, n)| op(n, i as u32)).collect(),
        }],
    }
}

#[test]
fn single_node_four_threads_three_ops() {
    let device = Arc::new(CountingDevice::new(8));
    let net = net_config(1, 4);
    let execution = Arc::new(NetExecution::new(4, &net));
    let executor = Executor::new(
        &net,
        node_config_with_ops(&["a", "b", "c"]),
        &[DeviceBinding::all(device.clone())],
        execution.clone(),
        Arc::new(NullSynchronizer),
        ExecutorOptions::default(),
    )
    .unwrap();

    // Single node: the sync descriptor must not produce a sync step.
    assert_eq!(executor.n_steps(), 3);
    assert!(executor.step_types().iter().all(|t| *t == StepType::ExecuteOp));

    execution.set_batch_size(2);
    executor.forward().unwrap();

    let forwards = device.forwards.lock().unwrap();
    assert_eq!(forwards.len(), 3 * 4);
    for op_index in 0..3 {
        for thread_index in 0..4 {
            assert_eq!(
                forwards
                    .iter()
                    .filter(|c| c.op_index == op_index && c.thread_index == thread_index)
                    .count(),
                1
            );
        }
    }
    assert!(forwards.iter().all(|c| c.batch_size == 2));
}

#[test]
fn repeated_forwards_reuse_the_pool() {
    let device = Arc::new(CountingDevice::new(4));
    let net = net_config(1, 2);
    let execution = Arc::new(NetExecution::new(2, &net));
    let executor = Executor::new(
        &net,
        node_config_with_ops(&["a", "b"]),
        &[DeviceBinding::all(device.clone())],
        execution.clone(),
        Arc::new(NullSynchronizer),
        ExecutorOptions::default(),
    )
    .unwrap();

    execution.set_batch_size(1);
    for _ in 0..5 {
        executor.forward().unwrap();
    }
    assert_eq!(device.forwards.lock().unwrap().len(), 5 * 2 * 2);
}

#[test]
#[should_panic(expected = "batch size must be set before forward")]
fn zero_batch_size_panics() {
    let device = Arc::new(CountingDevice::new(4));
    let net = net_config(1, 2);
    let execution = Arc::new(NetExecution::new(1, &net));
    let executor = Executor::new(
        &net,
        node_config_with_ops(&["a"]),
        &[DeviceBinding::all(device)],
        execution,
        Arc::new(NullSynchronizer),
        ExecutorOptions::default(),
    )
    .unwrap();
    executor.forward().unwrap();
}

#[test]
fn max_batch_size_is_valid() {
    let device = Arc::new(CountingDevice::new(4));
    let net = net_config(1, 3);
    let execution = Arc::new(NetExecution::new(1, &net));
    let executor = Executor::new(
        &net,
        node_config_with_ops(&["a"]),
        &[DeviceBinding::all(device.clone())],
        execution.clone(),
        Arc::new(NullSynchronizer),
        ExecutorOptions::default(),
    )
    .unwrap();
    execution.set_batch_size(3);
    executor.forward().unwrap();
    assert!(device.forwards.lock().unwrap().iter().all(|c| c.batch_size == 3));
}

#[test]
fn empty_segment_still_emits_sync_step() {
    let device = Arc::new(CountingDevice::new(4));
    let net = net_config(2, 2);
    let execution = Arc::new(NetExecution::new(1, &net));
    let node = NodeConfig {
        node_index: 0,
        buffers: Vec::new(),
        segments: vec![SegmentConfig {
            syncs: vec![SyncConfig { pipe_index: 0, sync_type: SyncType::WithRoot }],
            ops: Vec::new(),
        }],
    };
    let executor = Executor::new(
        &net,
        node,
        &[DeviceBinding::all(device)],
        execution.clone(),
        Arc::new(NullSynchronizer),
        ExecutorOptions::default(),
    )
    .unwrap();
    assert_eq!(executor.step_types(), vec![StepType::SyncNodes]);

    execution.set_batch_size(1);
    executor.forward().unwrap();
}

#[test]
fn thread_count_above_device_limit_is_rejected() {
    let device = Arc::new(CountingDevice::new(2));
    let net = net_config(1, 2);
    let execution = Arc::new(NetExecution::new(4, &net));
    let result = Executor::new(
        &net,
        node_config_with_ops(&["a"]),
        &[DeviceBinding::all(device)],
        execution,
        Arc::new(NullSynchronizer),
        ExecutorOptions::default(),
    );
    assert!(matches!(result, Err(ExecutorError::InvalidConfig(_))));
}

#[test]
fn segment_without_device_is_rejected() {
    let device = Arc::new(CountingDevice::new(4));
    let net = net_config(1, 2);
    let execution = Arc::new(NetExecution::new(1, &net));
    let result = Executor::new(
        &net,
        node_config_with_ops(&["a"]),
        // Binding covers only segment 5; segment 0 has no device.
        &[DeviceBinding::range(device, 5, 6)],
        execution,
        Arc::new(NullSynchronizer),
        ExecutorOptions::default(),
    );
    assert!(matches!(result, Err(ExecutorError::InvalidConfig(_))));
}

#[test]
fn failing_op_aborts_the_forward() {
    let device = Arc::new(FailingDevice::new(4, 1));
    let net = net_config(1, 2);
    let execution = Arc::new(NetExecution::new(2, &net));
    let executor = Executor::new(
        &net,
        node_config_with_ops(&["ok", "boom", "never"]),
        &[DeviceBinding::all(device)],
        execution.clone(),
        Arc::new(NullSynchronizer),
        ExecutorOptions::default(),
    )
    .unwrap();
    execution.set_batch_size(1);
    assert!(matches!(executor.forward(), Err(ExecutorError::Failed)));
}

#[test]
fn watchdog_aborts_a_stalled_forward() {
    // Surface the stall diagnostics under RUST_LOG.
    tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::from_default_env(),
    ).try_init().ok();

    let device = Arc::new(SleepDevice::new(4, Duration::from_millis(400)));
    let net = net_config(1, 2);
    let execution = Arc::new(NetExecution::new(1, &net));
    let options = ExecutorOptions {
        benchmark: false,
        barrier: BarrierPolicy::Relaxed,
        watchdog: WatchdogConfig::new(60, 150),
    };
    let executor = Executor::new(
        &net,
        node_config_with_ops(&["slow_op"]),
        &[DeviceBinding::all(device)],
        execution.clone(),
        Arc::new(NullSynchronizer),
        options,
    )
    .unwrap();
    execution.set_batch_size(1);
    match executor.forward() {
        Err(ExecutorError::StallTimeout { step_index, label, stalled_ms }) => {
            assert_eq!(step_index, 0);
            assert_eq!(label, "slow_op");
            assert!(stalled_ms >= 150);
        }
        other => panic!("expected stall timeout, got {other:?}"),
    }
}

#[test]
fn fast_forward_outruns_the_watchdog() {
    let device = Arc::new(CountingDevice::new(4));
    let net = net_config(1, 2);
    let execution = Arc::new(NetExecution::new(2, &net));
    let options = ExecutorOptions {
        watchdog: WatchdogConfig::new(200, 1_000),
        ..Default::default()
    };
    let executor = Executor::new(
        &net,
        node_config_with_ops(&["a", "b"]),
        &[DeviceBinding::all(device)],
        execution.clone(),
        Arc::new(NullSynchronizer),
        options,
    )
    .unwrap();
    execution.set_batch_size(1);
    executor.forward().unwrap();
}

#[test]
fn tight_barrier_runs_the_same_program() {
    let device = Arc::new(CountingDevice::new(4));
    let net = net_config(1, 2);
    let execution = Arc::new(NetExecution::new(3, &net));
    let options = ExecutorOptions { barrier: BarrierPolicy::Tight, ..Default::default() };
    let executor = Executor::new(
        &net,
        node_config_with_ops(&["a", "b"]),
        &[DeviceBinding::all(device.clone())],
        execution.clone(),
        Arc::new(NullSynchronizer),
        options,
    )
    .unwrap();
    execution.set_batch_size(2);
    executor.forward().unwrap();
    assert_eq!(device.forwards.lock().unwrap().len(), 2 * 3);
}

#[test]
fn benchmark_accumulates_op_time() {
    let device = Arc::new(SleepDevice::new(4, Duration::from_millis(5)));
    let net = net_config(1, 2);
    let execution = Arc::new(NetExecution::new(1, &net));
    let options = ExecutorOptions { benchmark: true, ..Default::default() };
    let executor = Executor::new(
        &net,
        node_config_with_ops(&["a", "b"]),
        &[DeviceBinding::all(device)],
        execution.clone(),
        Arc::new(NullSynchronizer),
        options,
    )
    .unwrap();
    execution.set_batch_size(1);
    executor.forward().unwrap();
    assert!(executor.total_time(StepType::ExecuteOp) >= 10_000 / 2);
    assert_eq!(executor.total_time(StepType::SyncNodes), 0);
}

#[test]
fn load_weight_resolves_ops_by_name_and_index() {
    let device = Arc::new(CountingDevice::new(4));
    let net = net_config(1, 2);
    let execution = Arc::new(NetExecution::new(1, &net));
    let node = NodeConfig {
        node_index: 0,
        buffers: Vec::new(),
        segments: vec![
            SegmentConfig { syncs: Vec::new(), ops: vec![op("proj", 0)] },
            SegmentConfig { syncs: Vec::new(), ops: vec![op("proj", 1), op("norm", 0)] },
        ],
    };
    let executor = Executor::new(
        &net,
        node,
        &[DeviceBinding::all(device.clone())],
        execution,
        Arc::new(NullSynchronizer),
        ExecutorOptions::default(),
    )
    .unwrap();

    executor.load_weight("proj", 1, 32, &[1, 2, 3]).unwrap();
    let weights = device.weights.lock().unwrap();
    assert_eq!(weights.len(), 1);
    assert_eq!(weights[0].segment_index, 1);
    assert_eq!(weights[0].op_index, 0);
    assert_eq!(weights[0].offset, 32);
    assert_eq!(weights[0].data, vec![1, 2, 3]);
    drop(weights);

    assert!(matches!(
        executor.load_weight("missing", 0, 0, &[]),
        Err(ExecutorError::InvalidConfig(_))
    ));
}
