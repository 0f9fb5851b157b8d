//! Multi-node collective scenarios over in-process loopback meshes.
//!
//! Each node runs on its own OS thread with its own [`Network`] built from
//! a pre-wired socket array. All-reduce results use integer-valued floats so
//! star and ring sums compare bit-exact regardless of fold order.

use std::sync::Arc;
use std::thread;

use tensormesh_core::collective::{NetworkSynchronizer, NodeSynchronizer};
use tensormesh_core::config::{
    FloatType, NetConfig, NodeConfig, PipeConfig, SegmentConfig, SizeDesc, SyncConfig, SyncType,
};
use tensormesh_core::executor::execution::NetExecution;
use tensormesh_core::net::Network;
use tensormesh_core::testing::loopback_mesh;
use tensormesh_core::CollectiveType;

fn net_config(n_nodes: u32, pipe_values: u32) -> NetConfig {
    NetConfig {
        n_batches: 1,
        n_nodes,
        pipes: vec![PipeConfig {
            name: "pipe".into(),
            size: SizeDesc::new(FloatType::F32, pipe_values),
        }],
        pre_syncs: Vec::new(),
    }
}

fn node_config(node_index: u32, sync_type: SyncType) -> NodeConfig {
    NodeConfig {
        node_index,
        buffers: Vec::new(),
        segments: vec![SegmentConfig {
            syncs: vec![SyncConfig { pipe_index: 0, sync_type }],
            ops: Vec::new(),
        }],
    }
}

fn fill_pipe(execution: &NetExecution, values: &[f32]) {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let pipe = execution.pipe(0);
    unsafe { pipe.bytes_mut(0, bytes.len()) }.copy_from_slice(&bytes);
}

fn read_pipe(execution: &NetExecution, count: usize) -> Vec<f32> {
    let pipe = execution.pipe(0);
    unsafe { pipe.bytes(0, count * 4) }
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

/// Run one sync on every node concurrently and return the post-sync pipe
/// contents per node.
fn run_sync(
    n_nodes: usize,
    pipe_values: u32,
    sync_type: SyncType,
    collective: CollectiveType,
    fill: impl Fn(usize) -> Vec<f32> + Send + Sync + Clone + 'static,
) -> Vec<Vec<f32>> {
    let mesh = loopback_mesh(n_nodes);
    let mut handles = Vec::new();
    for (node_index, sockets) in mesh.into_iter().enumerate() {
        let fill = fill.clone();
        handles.push(thread::spawn(move || {
            let network = Arc::new(Network::from_streams(sockets, false));
            let net = net_config(n_nodes as u32, pipe_values);
            let execution = Arc::new(NetExecution::new(1, &net));
            execution.set_batch_size(1);
            fill_pipe(&execution, &fill(node_index));

            let synchronizer = NetworkSynchronizer::new(
                network,
                execution.clone(),
                net,
                node_config(node_index as u32, sync_type),
                collective,
            );
            synchronizer.sync(0, 1, 0).unwrap();
            read_pipe(&execution, pipe_values as usize)
        }));
    }
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn two_node_star_all_reduce() {
    // Root 1..=16, worker 100..=115; both must end with the element sums.
    let results = run_sync(2, 16, SyncType::NodeSlices, CollectiveType::Auto, |node| {
        (0..16)
            .map(|i| if node == 0 { 1.0 + i as f32 } else { 100.0 + i as f32 })
            .collect()
    });
    let expected: Vec<f32> = (0..16).map(|i| 101.0 + 2.0 * i as f32).collect();
    assert_eq!(results[0], expected);
    assert_eq!(results[1], expected);
}

#[test]
fn five_node_ring_all_reduce() {
    // Each node fills its own 8-value slice with its index; every slice sums
    // to 0+1+2+3+4 = 10 across the mesh, bit-exact.
    let results = run_sync(5, 40, SyncType::NodeSlices, CollectiveType::Auto, |node| {
        let mut values = vec![0.0f32; 40];
        for v in &mut values[node * 8..(node + 1) * 8] {
            *v = node as f32;
        }
        values
    });
    for result in &results {
        assert_eq!(result, &vec![10.0f32; 40]);
    }
}

#[test]
fn eight_node_except_root_star() {
    // Forced star: the root folds every worker's buffer; workers keep their
    // own pre-sync contents untouched.
    let fill = |node: usize| vec![node as f32 + 1.0; 8];
    let results = run_sync(8, 8, SyncType::NodeSlicesExceptRoot, CollectiveType::Star, fill);
    let expected_sum: f32 = (1..=8).map(|v| v as f32).sum();
    assert_eq!(results[0], vec![expected_sum; 8]);
    for (node_index, result) in results.iter().enumerate().skip(1) {
        assert_eq!(result, &fill(node_index));
    }
}

#[test]
fn random_integer_buffers_match_the_local_sum() {
    use rand::{Rng, SeedableRng};
    // Integer-valued floats keep the comparison bit-exact.
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let buffers: Vec<Vec<f32>> = (0..3)
        .map(|_| (0..12).map(|_| rng.gen_range(-64i32..64) as f32).collect())
        .collect();
    let expected: Vec<f32> =
        (0..12).map(|i| buffers.iter().map(|b| b[i]).sum()).collect();

    let fill_buffers = buffers.clone();
    let results = run_sync(3, 12, SyncType::NodeSlices, CollectiveType::Auto, move |node| {
        fill_buffers[node].clone()
    });
    for result in &results {
        assert_eq!(result, &expected);
    }
}

#[test]
fn five_node_except_root_ring_reduces_to_root() {
    let results = run_sync(5, 40, SyncType::NodeSlicesExceptRoot, CollectiveType::Ring, |node| {
        vec![node as f32; 40]
    });
    // Root ends with the full elementwise sum even though reduce-scatter
    // leaves each node owning only one finished chunk.
    let expected_sum: f32 = (0..5).map(|v| v as f32).sum();
    assert_eq!(results[0], vec![expected_sum; 40]);
}

#[test]
fn forced_ring_on_two_nodes() {
    let results = run_sync(2, 8, SyncType::NodeSlices, CollectiveType::Ring, |node| {
        vec![node as f32 + 1.0; 8]
    });
    assert_eq!(results[0], vec![3.0f32; 8]);
    assert_eq!(results[1], vec![3.0f32; 8]);
}

#[test]
fn broadcast_from_root_with_thread_pool() {
    // Five nodes, two threads: the root partitions its four sockets across
    // both threads; workers read on thread 0 only.
    let n_nodes = 5usize;
    let mesh = loopback_mesh(n_nodes);
    let mut handles = Vec::new();
    for (node_index, sockets) in mesh.into_iter().enumerate() {
        handles.push(thread::spawn(move || {
            let network = Arc::new(Network::from_streams(sockets, false));
            let net = net_config(n_nodes as u32, 8);
            let execution = Arc::new(NetExecution::new(2, &net));
            execution.set_batch_size(1);
            if node_index == 0 {
                fill_pipe(&execution, &[7.0f32; 8]);
            }

            let synchronizer = Arc::new(NetworkSynchronizer::new(
                network,
                execution.clone(),
                net,
                node_config(node_index as u32, SyncType::WithRoot),
                CollectiveType::Auto,
            ));
            let pool: Vec<_> = (0..2)
                .map(|thread_index| {
                    let synchronizer = synchronizer.clone();
                    thread::spawn(move || synchronizer.sync(0, 2, thread_index).unwrap())
                })
                .collect();
            for worker in pool {
                worker.join().unwrap();
            }
            read_pipe(&execution, 8)
        }));
    }
    let results: Vec<Vec<f32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for result in &results {
        assert_eq!(result, &vec![7.0f32; 8]);
    }
}

#[test]
fn batched_all_reduce_syncs_every_batch() {
    // Two batches in flight: each batch row is reduced independently.
    let n_nodes = 2usize;
    let mesh = loopback_mesh(n_nodes);
    let mut handles = Vec::new();
    for (node_index, sockets) in mesh.into_iter().enumerate() {
        handles.push(thread::spawn(move || {
            let network = Arc::new(Network::from_streams(sockets, false));
            let net = NetConfig {
                n_batches: 2,
                n_nodes: 2,
                pipes: vec![PipeConfig { name: "pipe".into(), size: SizeDesc::new(FloatType::F32, 4) }],
                pre_syncs: Vec::new(),
            };
            let execution = Arc::new(NetExecution::new(1, &net));
            execution.set_batch_size(2);
            let values: Vec<f32> = (0..8).map(|i| (node_index * 10 + i) as f32).collect();
            fill_pipe(&execution, &values);

            let synchronizer = NetworkSynchronizer::new(
                network,
                execution.clone(),
                net,
                node_config(node_index as u32, SyncType::NodeSlices),
                CollectiveType::Auto,
            );
            synchronizer.sync(0, 1, 0).unwrap();
            read_pipe(&execution, 8)
        }));
    }
    let results: Vec<Vec<f32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let expected: Vec<f32> = (0..8).map(|i| (i + (10 + i)) as f32).collect();
    assert_eq!(results[0], expected);
    assert_eq!(results[1], expected);
}

#[test]
fn dropped_peer_surfaces_a_transfer_error() {
    let mesh = loopback_mesh(2);
    let mut nodes = mesh.into_iter();
    let root_sockets = nodes.next().unwrap();
    let worker_sockets = nodes.next().unwrap();

    // The worker vanishes before the sync.
    drop(worker_sockets);

    let network = Arc::new(Network::from_streams(root_sockets, false));
    let net = net_config(2, 8);
    let execution = Arc::new(NetExecution::new(1, &net));
    execution.set_batch_size(1);
    let synchronizer = NetworkSynchronizer::new(
        network,
        execution,
        net,
        node_config(0, SyncType::NodeSlices),
        CollectiveType::Auto,
    );
    let err = synchronizer.sync(0, 1, 0).unwrap_err();
    assert!(matches!(err, tensormesh_core::net::NetError::Transfer { .. }));
}
