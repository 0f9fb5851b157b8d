//! Config broadcast: the root ships [`NetConfig`] and per-node
//! [`NodeConfig`] to every worker right after bring-up.
//!
//! Each transfer is fenced on both sides: the receiver ACKs "ready", the
//! sender streams every field, the receiver ACKs "done". Variable-length
//! arrays are introduced by their counts; op parameter blobs travel inline.

use crate::config::{
    BufferConfig, FloatType, NetConfig, NodeConfig, OpBufferRef, OpConfig, PipeConfig,
    PreSyncConfig, SegmentConfig, SizeDesc, SyncConfig, SyncType,
};
use crate::net::network::{Network, ROOT_SOCKET_INDEX};
use crate::net::{NetError, Result};

use super::{read_string, read_u32, read_u64, write_string, write_u32, write_u64};

fn write_size(network: &Network, socket_index: usize, size: &SizeDesc) -> Result<()> {
    write_u32(network, socket_index, size.float_type as u32)?;
    write_u32(network, socket_index, size.count)?;
    write_u64(network, socket_index, size.n_bytes)
}

fn read_size(network: &Network, socket_index: usize) -> Result<SizeDesc> {
    let code = read_u32(network, socket_index)?;
    let float_type = FloatType::from_code(code)
        .ok_or_else(|| NetError::Transfer { reason: format!("unknown float type {code}") })?;
    let count = read_u32(network, socket_index)?;
    let n_bytes = read_u64(network, socket_index)?;
    Ok(SizeDesc { float_type, count, n_bytes })
}

fn write_ref(network: &Network, socket_index: usize, buffer_ref: &OpBufferRef) -> Result<()> {
    write_u32(network, socket_index, buffer_ref.source)?;
    write_u32(network, socket_index, buffer_ref.index)
}

fn read_ref(network: &Network, socket_index: usize) -> Result<OpBufferRef> {
    Ok(OpBufferRef {
        source: read_u32(network, socket_index)?,
        index: read_u32(network, socket_index)?,
    })
}

/// Root side of the config protocol.
pub struct RootConfigWriter<'a> {
    network: &'a Network,
}

impl<'a> RootConfigWriter<'a> {
    pub fn new(network: &'a Network) -> Self {
        Self { network }
    }

    pub fn write_net(&self, socket_index: usize, config: &NetConfig) -> Result<()> {
        let network = self.network;
        network.read_ack(socket_index)?;

        write_u32(network, socket_index, config.n_batches)?;
        write_u32(network, socket_index, config.n_nodes)?;
        write_u32(network, socket_index, config.pipes.len() as u32)?;
        for pipe in &config.pipes {
            write_size(network, socket_index, &pipe.size)?;
            write_string(network, socket_index, &pipe.name)?;
        }
        write_u32(network, socket_index, config.pre_syncs.len() as u32)?;
        for pre_sync in &config.pre_syncs {
            write_u32(network, socket_index, pre_sync.pipe_index)?;
        }

        network.read_ack(socket_index)
    }

    pub fn write_node(&self, socket_index: usize, config: &NodeConfig) -> Result<()> {
        let network = self.network;
        network.read_ack(socket_index)?;

        write_u32(network, socket_index, config.node_index)?;
        write_u32(network, socket_index, config.buffers.len() as u32)?;
        write_u32(network, socket_index, config.segments.len() as u32)?;

        for buffer in &config.buffers {
            write_size(network, socket_index, &buffer.size)?;
            write_string(network, socket_index, &buffer.name)?;
        }

        for segment in &config.segments {
            write_u32(network, socket_index, segment.syncs.len() as u32)?;
            write_u32(network, socket_index, segment.ops.len() as u32)?;

            for sync in &segment.syncs {
                write_u32(network, socket_index, sync.pipe_index)?;
                write_u32(network, socket_index, sync.sync_type as u32)?;
            }
            for op in &segment.ops {
                write_u32(network, socket_index, op.code)?;
                write_u32(network, socket_index, op.index)?;
                write_u64(network, socket_index, op.weight_size)?;
                write_u64(network, socket_index, op.config.len() as u64)?;
                write_string(network, socket_index, &op.name)?;
                write_ref(network, socket_index, &op.input)?;
                write_ref(network, socket_index, &op.output)?;
                if !op.config.is_empty() {
                    network.write(socket_index, &op.config)?;
                }
            }
        }

        network.read_ack(socket_index)
    }

    /// Ship the shared net config plus each worker's node config.
    ///
    /// `node_configs[i]` is node `i`'s program; index 0 (the root's own) is
    /// not transferred.
    pub fn write_to_workers(&self, net_config: &NetConfig, node_configs: &[NodeConfig]) -> Result<()> {
        for node_index in 1..net_config.n_nodes as usize {
            let socket_index = node_index - 1;
            self.write_net(socket_index, net_config)?;
            self.write_node(socket_index, &node_configs[node_index])?;
        }
        Ok(())
    }
}

/// Worker side of the config protocol; reads from the root socket.
pub struct WorkerConfigReader<'a> {
    network: &'a Network,
}

impl<'a> WorkerConfigReader<'a> {
    pub fn new(network: &'a Network) -> Self {
        Self { network }
    }

    pub fn read_net(&self) -> Result<NetConfig> {
        let network = self.network;
        network.write_ack(ROOT_SOCKET_INDEX)?;

        let n_batches = read_u32(network, ROOT_SOCKET_INDEX)?;
        let n_nodes = read_u32(network, ROOT_SOCKET_INDEX)?;
        let n_pipes = read_u32(network, ROOT_SOCKET_INDEX)?;
        let mut pipes = Vec::with_capacity(n_pipes as usize);
        for _ in 0..n_pipes {
            let size = read_size(network, ROOT_SOCKET_INDEX)?;
            let name = read_string(network, ROOT_SOCKET_INDEX)?;
            pipes.push(PipeConfig { name, size });
        }
        let n_pre_syncs = read_u32(network, ROOT_SOCKET_INDEX)?;
        let mut pre_syncs = Vec::with_capacity(n_pre_syncs as usize);
        for _ in 0..n_pre_syncs {
            pre_syncs.push(PreSyncConfig { pipe_index: read_u32(network, ROOT_SOCKET_INDEX)? });
        }

        network.write_ack(ROOT_SOCKET_INDEX)?;
        Ok(NetConfig { n_batches, n_nodes, pipes, pre_syncs })
    }

    pub fn read_node(&self) -> Result<NodeConfig> {
        let network = self.network;
        network.write_ack(ROOT_SOCKET_INDEX)?;

        let node_index = read_u32(network, ROOT_SOCKET_INDEX)?;
        let n_buffers = read_u32(network, ROOT_SOCKET_INDEX)?;
        let n_segments = read_u32(network, ROOT_SOCKET_INDEX)?;

        let mut buffers = Vec::with_capacity(n_buffers as usize);
        for _ in 0..n_buffers {
            let size = read_size(network, ROOT_SOCKET_INDEX)?;
            let name = read_string(network, ROOT_SOCKET_INDEX)?;
            buffers.push(BufferConfig { name, size });
        }

        let mut segments = Vec::with_capacity(n_segments as usize);
        for _ in 0..n_segments {
            let n_syncs = read_u32(network, ROOT_SOCKET_INDEX)?;
            let n_ops = read_u32(network, ROOT_SOCKET_INDEX)?;

            let mut syncs = Vec::with_capacity(n_syncs as usize);
            for _ in 0..n_syncs {
                let pipe_index = read_u32(network, ROOT_SOCKET_INDEX)?;
                let code = read_u32(network, ROOT_SOCKET_INDEX)?;
                let sync_type = SyncType::from_code(code).ok_or_else(|| NetError::Transfer {
                    reason: format!("unknown sync type {code}"),
                })?;
                syncs.push(SyncConfig { pipe_index, sync_type });
            }

            let mut ops = Vec::with_capacity(n_ops as usize);
            for _ in 0..n_ops {
                let code = read_u32(network, ROOT_SOCKET_INDEX)?;
                let index = read_u32(network, ROOT_SOCKET_INDEX)?;
                let weight_size = read_u64(network, ROOT_SOCKET_INDEX)?;
                let config_size = read_u64(network, ROOT_SOCKET_INDEX)? as usize;
                let name = read_string(network, ROOT_SOCKET_INDEX)?;
                let input = read_ref(network, ROOT_SOCKET_INDEX)?;
                let output = read_ref(network, ROOT_SOCKET_INDEX)?;
                let mut config = vec![0u8; config_size];
                if config_size > 0 {
                    network.read(ROOT_SOCKET_INDEX, &mut config)?;
                }
                ops.push(OpConfig { code, index, weight_size, name, input, output, config });
            }

            segments.push(SegmentConfig { syncs, ops });
        }

        network.write_ack(ROOT_SOCKET_INDEX)?;
        Ok(NodeConfig { node_index, buffers, segments })
    }
}
