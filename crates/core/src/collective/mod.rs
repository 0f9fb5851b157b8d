//! Cross-node collective communication.
//!
//! A sync step exchanges one pipe batch across the cluster in one of three
//! patterns: root broadcast ([`SyncType::WithRoot`]), all-reduce with sum
//! ([`SyncType::NodeSlices`]) or reduce-to-root only
//! ([`SyncType::NodeSlicesExceptRoot`]). All-reduce runs over a selectable
//! topology: a root-centric star or a neighbour ring (reduce-scatter +
//! all-gather), picked by [`CollectiveType`].
//!
//! Socket discipline: in every collective only thread 0 of a node touches
//! the network, except the root side of a broadcast which partitions its
//! sends across the thread pool. The executor's step barrier guarantees no
//! op is concurrently touching the pipe.

pub mod reduce;

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::config::{FloatType, NetConfig, NodeConfig, SyncType};
use crate::executor::execution::{NetExecution, Pipe};
use crate::net::mesh::socket_index_for_node;
use crate::net::network::{Network, ReadIo, WriteIo, ROOT_SOCKET_INDEX};
use crate::net::Result;

use reduce::reduce_sum;

/// Topology policy for the all-reduce collectives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectiveType {
    /// Star for small meshes (up to 4 nodes), ring above.
    #[default]
    Auto,
    Star,
    Ring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Topology {
    Star,
    Ring,
}

impl CollectiveType {
    fn resolve(self, n_nodes: u32) -> Topology {
        match self {
            CollectiveType::Star => Topology::Star,
            CollectiveType::Ring => Topology::Ring,
            CollectiveType::Auto => {
                if n_nodes <= 4 {
                    Topology::Star
                } else {
                    Topology::Ring
                }
            }
        }
    }
}

/// Per-segment synchronization capability the executor invokes on every
/// worker thread at a sync step.
pub trait NodeSynchronizer: Send + Sync {
    fn sync(&self, segment_index: usize, n_threads: usize, thread_index: usize) -> Result<()>;
}

/// No-op synchronizer for single-node runs.
pub struct NullSynchronizer;

impl NodeSynchronizer for NullSynchronizer {
    fn sync(&self, _segment_index: usize, _n_threads: usize, _thread_index: usize) -> Result<()> {
        Ok(())
    }
}

/// Wire-backed synchronizer: walks the segment's sync descriptors and runs
/// the configured collective per batch.
pub struct NetworkSynchronizer {
    network: Arc<Network>,
    execution: Arc<NetExecution>,
    net_config: NetConfig,
    node_config: NodeConfig,
    collective: CollectiveType,
}

impl NetworkSynchronizer {
    pub fn new(
        network: Arc<Network>,
        execution: Arc<NetExecution>,
        net_config: NetConfig,
        node_config: NodeConfig,
        collective: CollectiveType,
    ) -> Self {
        Self { network, execution, net_config, node_config, collective }
    }
}

impl NodeSynchronizer for NetworkSynchronizer {
    fn sync(&self, segment_index: usize, n_threads: usize, thread_index: usize) -> Result<()> {
        let segment = &self.node_config.segments[segment_index];
        let node_index = self.node_config.node_index;
        let n_nodes = self.net_config.n_nodes;

        for sync in &segment.syncs {
            let pipe_config = &self.net_config.pipes[sync.pipe_index as usize];
            let batch_bytes = pipe_config.size.n_bytes as usize;
            let float_type = pipe_config.size.float_type;
            let pipe = self.execution.pipe(sync.pipe_index as usize);
            let batch_size = self.execution.batch_size() as usize;
            let kind = match sync.sync_type {
                SyncType::WithRoot => "sync_with_root",
                SyncType::NodeSlices => "sync_node_slices",
                SyncType::NodeSlicesExceptRoot => "sync_node_slices_except_root",
            };

            if thread_index == 0 {
                debug!(
                    segment_index,
                    pipe_index = sync.pipe_index,
                    sync = kind,
                    batch_size,
                    batch_bytes,
                    "running sync step"
                );
            }

            for batch_index in 0..batch_size {
                let offset = batch_index * batch_bytes;
                let start = Instant::now();

                match sync.sync_type {
                    SyncType::WithRoot => sync_with_root(
                        &self.network,
                        node_index,
                        pipe,
                        offset,
                        batch_bytes,
                        n_threads,
                        thread_index,
                    )?,
                    SyncType::NodeSlices => sync_node_slices(
                        false,
                        &self.network,
                        node_index,
                        n_nodes,
                        float_type,
                        pipe,
                        offset,
                        batch_bytes,
                        thread_index,
                        self.collective,
                    )?,
                    SyncType::NodeSlicesExceptRoot => sync_node_slices(
                        true,
                        &self.network,
                        node_index,
                        n_nodes,
                        float_type,
                        pipe,
                        offset,
                        batch_bytes,
                        thread_index,
                        self.collective,
                    )?,
                }

                if self.network.is_monitoring_enabled() {
                    self.network.record_operation(
                        kind,
                        0,
                        (batch_bytes * batch_size) as u64,
                        start,
                        Instant::now(),
                    );
                }
            }
        }
        Ok(())
    }
}

thread_local! {
    /// Scratch for gathered peer data; grows monotonically, never shrinks.
    static TEMP: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

fn with_temp<R>(len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
    TEMP.with(|cell| {
        let mut buf = cell.borrow_mut();
        if buf.len() < len {
            buf.resize(len, 0);
        }
        f(&mut buf[..len])
    })
}

/// One-to-all broadcast of a pipe batch from the root.
///
/// The root partitions its sockets across the thread pool (thread `t` serves
/// sockets `t, t + n_threads, ...`); on workers only thread 0 reads, from
/// the root socket. No ACK: the step barrier after the sync is the fence.
fn sync_with_root(
    network: &Network,
    node_index: u32,
    pipe: &Pipe,
    offset: usize,
    len: usize,
    n_threads: usize,
    thread_index: usize,
) -> Result<()> {
    if node_index == 0 {
        let n_sockets = network.n_sockets();
        let mine = n_sockets / n_threads + usize::from(n_sockets % n_threads > thread_index);
        if mine == 0 {
            return Ok(());
        }
        // Shared view: every sender thread reads the same bytes.
        let data = unsafe { pipe.bytes(offset, len) };
        let mut ios: Vec<WriteIo<'_>> = (0..mine)
            .map(|i| WriteIo { socket_index: thread_index + i * n_threads, data })
            .collect();
        network.write_many(&mut ios)
    } else {
        if thread_index != 0 {
            return Ok(());
        }
        let data = unsafe { pipe.bytes_mut(offset, len) };
        network.read_many(&mut [ReadIo { socket_index: ROOT_SOCKET_INDEX, data }])
    }
}

/// All-reduce (sum) of a pipe batch, or reduce-to-root when `only_to_root`.
///
/// Single-threaded on every node: only thread 0 touches sockets, which also
/// keeps the shared pipe free of intra-node races.
#[allow(clippy::too_many_arguments)]
fn sync_node_slices(
    only_to_root: bool,
    network: &Network,
    node_index: u32,
    n_nodes: u32,
    float_type: FloatType,
    pipe: &Pipe,
    offset: usize,
    len: usize,
    thread_index: usize,
    collective: CollectiveType,
) -> Result<()> {
    if n_nodes <= 1 || len == 0 || thread_index != 0 {
        return Ok(());
    }
    match collective.resolve(n_nodes) {
        Topology::Star => star_all_reduce(only_to_root, network, node_index, n_nodes, float_type, pipe, offset, len),
        Topology::Ring => ring_all_reduce(only_to_root, network, node_index, n_nodes, float_type, pipe, offset, len),
    }
}

/// Root-centric all-reduce: gather full buffers into the root with folding,
/// then broadcast the sum back. O(n) transfers of the whole buffer.
#[allow(clippy::too_many_arguments)]
fn star_all_reduce(
    only_to_root: bool,
    network: &Network,
    node_index: u32,
    n_nodes: u32,
    float_type: FloatType,
    pipe: &Pipe,
    offset: usize,
    len: usize,
) -> Result<()> {
    if node_index == 0 {
        with_temp(len, |temp| -> Result<()> {
            for worker in 1..n_nodes {
                let socket_index = socket_index_for_node(0, worker);
                network.read_many(&mut [ReadIo { socket_index, data: &mut temp[..] }])?;
                let acc = unsafe { pipe.bytes_mut(offset, len) };
                reduce_sum(acc, temp, float_type);
            }
            Ok(())
        })?;

        if !only_to_root {
            let data = unsafe { pipe.bytes(offset, len) };
            for worker in 1..n_nodes {
                let socket_index = socket_index_for_node(0, worker);
                network.write_many(&mut [WriteIo { socket_index, data }])?;
            }
        }
    } else {
        let data = unsafe { pipe.bytes(offset, len) };
        network.write_many(&mut [WriteIo { socket_index: ROOT_SOCKET_INDEX, data }])?;

        if !only_to_root {
            let data = unsafe { pipe.bytes_mut(offset, len) };
            network.read_many(&mut [ReadIo { socket_index: ROOT_SOCKET_INDEX, data }])?;
        }
    }
    Ok(())
}

/// Bandwidth-optimal ring all-reduce: reduce-scatter over n-1 steps, then
/// all-gather over n-1 more. Even-indexed nodes send before receiving,
/// odd-indexed the reverse, which breaks the cycle that would otherwise
/// deadlock blocking sockets.
///
/// With `only_to_root` the all-gather is replaced by one gather round:
/// after reduce-scatter node `i` owns only chunk `(i + 1) mod n` fully
/// reduced, so every worker ships its owned chunk straight to the root,
/// leaving the root with the complete sum and workers partially reduced.
#[allow(clippy::too_many_arguments)]
fn ring_all_reduce(
    only_to_root: bool,
    network: &Network,
    node_index: u32,
    n_nodes: u32,
    float_type: FloatType,
    pipe: &Pipe,
    offset: usize,
    len: usize,
) -> Result<()> {
    let n = n_nodes;
    let me = node_index;
    let slice = len / n as usize;

    let send_socket = socket_index_for_node(me, (me + 1) % n);
    let recv_socket = socket_index_for_node(me, (me + n - 1) % n);
    let send_first = me % 2 == 0;

    // Reduce-scatter: circulate chunks, folding into the local copy.
    with_temp(slice, |temp| -> Result<()> {
        for step in 0..n - 1 {
            let send_chunk = ((me + n - step) % n) as usize;
            let recv_chunk = ((me + n - step - 1) % n) as usize;

            let send_range = offset + send_chunk * slice;
            if send_first {
                let data = unsafe { pipe.bytes(send_range, slice) };
                network.write_many(&mut [WriteIo { socket_index: send_socket, data }])?;
                network.read_many(&mut [ReadIo { socket_index: recv_socket, data: &mut temp[..] }])?;
            } else {
                network.read_many(&mut [ReadIo { socket_index: recv_socket, data: &mut temp[..] }])?;
                let data = unsafe { pipe.bytes(send_range, slice) };
                network.write_many(&mut [WriteIo { socket_index: send_socket, data }])?;
            }

            let acc = unsafe { pipe.bytes_mut(offset + recv_chunk * slice, slice) };
            reduce_sum(acc, temp, float_type);
        }
        Ok(())
    })?;

    if only_to_root {
        if me == 0 {
            for worker in 1..n {
                let chunk = ((worker + 1) % n) as usize;
                let socket_index = socket_index_for_node(0, worker);
                let data = unsafe { pipe.bytes_mut(offset + chunk * slice, slice) };
                network.read_many(&mut [ReadIo { socket_index, data }])?;
            }
        } else {
            let owned = ((me + 1) % n) as usize;
            let data = unsafe { pipe.bytes(offset + owned * slice, slice) };
            network.write_many(&mut [WriteIo { socket_index: ROOT_SOCKET_INDEX, data }])?;
        }
        return Ok(());
    }

    // All-gather: circulate the reduced chunks, starting from the owned one.
    for step in 0..n - 1 {
        let send_chunk = ((me + n + 1 - step) % n) as usize;
        let recv_chunk = ((me + n - step) % n) as usize;

        let send_range = offset + send_chunk * slice;
        let recv_range = offset + recv_chunk * slice;
        if send_first {
            let data = unsafe { pipe.bytes(send_range, slice) };
            network.write_many(&mut [WriteIo { socket_index: send_socket, data }])?;
            let data = unsafe { pipe.bytes_mut(recv_range, slice) };
            network.read_many(&mut [ReadIo { socket_index: recv_socket, data }])?;
        } else {
            let data = unsafe { pipe.bytes_mut(recv_range, slice) };
            network.read_many(&mut [ReadIo { socket_index: recv_socket, data }])?;
            let data = unsafe { pipe.bytes(send_range, slice) };
            network.write_many(&mut [WriteIo { socket_index: send_socket, data }])?;
        }
    }
    Ok(())
}
