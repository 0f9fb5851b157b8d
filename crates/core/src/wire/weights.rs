//! Weight distribution: the root streams weight blobs to every peer after
//! the configs.
//!
//! Per weight and destination the root writes one record
//! `{ name_len:u32, name, op_index:u32, offset:u64, n_bytes:u64, bytes }`;
//! a record with `name_len == 0` terminates the stream and the worker
//! replies with an ACK. Tensor-parallel matmul weights are cut into per-node
//! slices through a temp buffer that grows monotonically.

use tracing::info;

use crate::config::FloatType;
use crate::executor::{Executor, Result};
use crate::net::network::{Network, ROOT_SOCKET_INDEX};

use super::{read_u32, read_u64, write_u32, write_u64};

/// Tensor-parallel split of a matmul weight by output rows.
///
/// Rows are distributed as contiguous blocks: node `i` owns rows
/// `i * rows_per_node .. (i + 1) * rows_per_node`, so a slice is one
/// contiguous byte range of the source.
#[derive(Debug, Clone, Copy)]
pub struct RowMatmulSlice {
    pub n_nodes: u32,
    pub rows: u32,
    pub cols: u32,
    /// Bytes of one node's slice.
    pub slice_bytes: u64,
    /// Bytes of the whole weight.
    pub total_bytes: u64,
}

impl RowMatmulSlice {
    pub fn new(float_type: FloatType, n_nodes: u32, rows: u32, cols: u32) -> Self {
        assert!(n_nodes > 0 && rows % n_nodes == 0, "rows must split evenly");
        let row_bytes = float_type.bytes_for(cols);
        Self {
            n_nodes,
            rows,
            cols,
            slice_bytes: (rows / n_nodes) as u64 * row_bytes,
            total_bytes: rows as u64 * row_bytes,
        }
    }

    /// Copy node `node_index`'s slice of `weight` into `out`.
    pub fn copy_slice(&self, node_index: u32, weight: &[u8], out: &mut [u8]) {
        assert_eq!(weight.len() as u64, self.total_bytes);
        let start = node_index as u64 * self.slice_bytes;
        out[..self.slice_bytes as usize]
            .copy_from_slice(&weight[start as usize..(start + self.slice_bytes) as usize]);
    }
}

/// Tensor-parallel split of a matmul weight by input columns.
///
/// Every row contributes a column segment to each node, so a slice is a
/// strided gather: node `i` takes segment `i` of every row.
#[derive(Debug, Clone, Copy)]
pub struct ColMatmulSlice {
    pub n_nodes: u32,
    pub rows: u32,
    pub cols: u32,
    /// Bytes of one full row.
    row_bytes: u64,
    /// Bytes of one node's segment within a row.
    segment_bytes: u64,
    pub slice_bytes: u64,
    pub total_bytes: u64,
}

impl ColMatmulSlice {
    pub fn new(float_type: FloatType, n_nodes: u32, rows: u32, cols: u32) -> Self {
        assert!(n_nodes > 0 && cols % n_nodes == 0, "cols must split evenly");
        let row_bytes = float_type.bytes_for(cols);
        let segment_bytes = float_type.bytes_for(cols / n_nodes);
        Self {
            n_nodes,
            rows,
            cols,
            row_bytes,
            segment_bytes,
            slice_bytes: rows as u64 * segment_bytes,
            total_bytes: rows as u64 * row_bytes,
        }
    }

    /// Gather node `node_index`'s column segments of `weight` into `out`.
    pub fn copy_slice(&self, node_index: u32, weight: &[u8], out: &mut [u8]) {
        assert_eq!(weight.len() as u64, self.total_bytes);
        let segment = self.segment_bytes as usize;
        let row_bytes = self.row_bytes as usize;
        let column_offset = node_index as usize * segment;
        for row in 0..self.rows as usize {
            let src = row * row_bytes + column_offset;
            out[row * segment..(row + 1) * segment].copy_from_slice(&weight[src..src + segment]);
        }
    }
}

/// Root side: loads weights locally and streams peers their share.
pub struct RootWeightLoader<'a> {
    executor: &'a Executor,
    network: Option<&'a Network>,
    n_nodes: u32,
    temp: Vec<u8>,
}

impl<'a> RootWeightLoader<'a> {
    /// `network` may be `None` only in single-node runs.
    pub fn new(executor: &'a Executor, network: Option<&'a Network>, n_nodes: u32) -> Self {
        assert!(n_nodes == 1 || network.is_some(), "multi-node loader needs a network");
        Self { executor, network, n_nodes, temp: Vec::new() }
    }

    /// Stream one weight record to `node_index`.
    pub fn write_weight(
        &self,
        node_index: u32,
        op_name: &str,
        op_index: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let network = self.network.expect("no network for peer write");
        let socket_index = (node_index - 1) as usize;
        write_u32(network, socket_index, op_name.len() as u32 + 1)?;
        network.write(socket_index, op_name.as_bytes())?;
        network.write(socket_index, &[0u8])?;
        write_u32(network, socket_index, op_index)?;
        write_u64(network, socket_index, offset)?;
        write_u64(network, socket_index, data.len() as u64)?;
        network.write(socket_index, data)?;
        Ok(())
    }

    /// Load a weight on the root only.
    pub fn load_root(&self, op_name: &str, op_index: u32, data: &[u8]) -> Result<u64> {
        self.executor.load_weight(op_name, op_index, 0, data)?;
        Ok(data.len() as u64)
    }

    /// Load a shared weight on the root and replicate it to every peer.
    pub fn load_all(&self, op_name: &str, op_index: u32, data: &[u8]) -> Result<u64> {
        self.executor.load_weight(op_name, op_index, 0, data)?;
        for node_index in 1..self.n_nodes {
            self.write_weight(node_index, op_name, op_index, 0, data)?;
        }
        Ok(data.len() as u64)
    }

    /// Cut a row-split matmul weight into per-node slices and distribute
    /// them. `expert_index` offsets the destination for stacked expert
    /// weights.
    pub fn load_row_matmul_slices(
        &mut self,
        op_name: &str,
        op_index: u32,
        expert_index: u32,
        slice: &RowMatmulSlice,
        weight: &[u8],
    ) -> Result<u64> {
        let offset = expert_index as u64 * slice.slice_bytes;
        if self.n_nodes == 1 {
            self.executor.load_weight(op_name, op_index, offset, weight)?;
            return Ok(slice.total_bytes);
        }
        let mut temp = std::mem::take(&mut self.temp);
        if temp.len() < slice.slice_bytes as usize {
            temp.resize(slice.slice_bytes as usize, 0);
        }
        for node_index in 0..self.n_nodes {
            let buf = &mut temp[..slice.slice_bytes as usize];
            slice.copy_slice(node_index, weight, buf);
            if node_index == 0 {
                self.executor.load_weight(op_name, op_index, offset, buf)?;
            } else {
                self.write_weight(node_index, op_name, op_index, offset, buf)?;
            }
        }
        self.temp = temp;
        Ok(slice.total_bytes)
    }

    /// Column-split counterpart of [`RootWeightLoader::load_row_matmul_slices`].
    pub fn load_col_matmul_slices(
        &mut self,
        op_name: &str,
        op_index: u32,
        expert_index: u32,
        slice: &ColMatmulSlice,
        weight: &[u8],
    ) -> Result<u64> {
        let offset = expert_index as u64 * slice.slice_bytes;
        if self.n_nodes == 1 {
            self.executor.load_weight(op_name, op_index, offset, weight)?;
            return Ok(slice.total_bytes);
        }
        let mut temp = std::mem::take(&mut self.temp);
        if temp.len() < slice.slice_bytes as usize {
            temp.resize(slice.slice_bytes as usize, 0);
        }
        for node_index in 0..self.n_nodes {
            let buf = &mut temp[..slice.slice_bytes as usize];
            slice.copy_slice(node_index, weight, buf);
            if node_index == 0 {
                self.executor.load_weight(op_name, op_index, offset, buf)?;
            } else {
                self.write_weight(node_index, op_name, op_index, offset, buf)?;
            }
        }
        self.temp = temp;
        Ok(slice.total_bytes)
    }

    /// Terminate every peer's stream and collect their ACKs.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(network) = self.network {
            for socket_index in 0..(self.n_nodes - 1) as usize {
                write_u32(network, socket_index, 0)?;
                network.read_ack(socket_index)?;
            }
        }
        self.temp = Vec::new();
        Ok(())
    }
}

/// Worker side: replays the root's stream into the local executor.
pub struct WorkerWeightReader<'a> {
    executor: &'a Executor,
    network: &'a Network,
    temp: Vec<u8>,
}

impl<'a> WorkerWeightReader<'a> {
    pub fn new(executor: &'a Executor, network: &'a Network) -> Self {
        Self { executor, network, temp: Vec::new() }
    }

    /// Read records until the zero-length terminator, loading each weight.
    pub fn read(&mut self) -> Result<()> {
        loop {
            let name_len = read_u32(self.network, ROOT_SOCKET_INDEX)? as usize;
            if name_len == 0 {
                self.network.write_ack(ROOT_SOCKET_INDEX)?;
                self.temp = Vec::new();
                break;
            }
            let mut name_bytes = vec![0u8; name_len];
            self.network.read(ROOT_SOCKET_INDEX, &mut name_bytes)?;
            name_bytes.pop(); // NUL
            let op_name = String::from_utf8(name_bytes).map_err(|_| {
                crate::net::NetError::Transfer { reason: "op name is not valid utf-8".into() }
            })?;

            let op_index = read_u32(self.network, ROOT_SOCKET_INDEX)?;
            let offset = read_u64(self.network, ROOT_SOCKET_INDEX)?;
            let n_bytes = read_u64(self.network, ROOT_SOCKET_INDEX)? as usize;
            if self.temp.len() < n_bytes {
                self.temp.resize(n_bytes, 0);
            }
            self.network.read(ROOT_SOCKET_INDEX, &mut self.temp[..n_bytes])?;

            self.executor
                .load_weight(&op_name, op_index, offset, &self.temp[..n_bytes])?;
            info!(op = %op_name, op_index, kib = n_bytes / 1024, "weight loaded");
        }
        info!("weights loaded");
        Ok(())
    }
}
