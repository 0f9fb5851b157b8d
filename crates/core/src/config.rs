//! Static configuration of a distributed forward pass.
//!
//! Two descriptor trees drive the runtime:
//! - [`NetConfig`] is cluster-wide and identical on every node: the pipe
//!   (staging buffer) table and batch limits.
//! - [`NodeConfig`] is this node's slice of the program: buffers, segments,
//!   ops and the sync points between segments.
//!
//! The host constructs both; workers additionally receive them over the wire
//! (see [`crate::wire`]). Node 0 is always the root.

/// Numeric layout of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FloatType {
    /// 32-bit IEEE float.
    F32 = 0,
    /// 16-bit IEEE float.
    F16 = 1,
    /// 8-bit block quantization: 32 values + f16 scale per 34-byte block.
    Q80 = 2,
    /// 4-bit block quantization: 32 values + f16 scale per 18-byte block.
    Q40 = 3,
}

/// Values per quantized block.
pub const QUANT_BLOCK_SIZE: u32 = 32;

impl FloatType {
    /// Byte length of a buffer holding `count` values of this type.
    ///
    /// # Panics
    /// Panics if `count` is not a multiple of the block size for quantized
    /// types.
    pub fn bytes_for(self, count: u32) -> u64 {
        let count = count as u64;
        match self {
            FloatType::F32 => count * 4,
            FloatType::F16 => count * 2,
            FloatType::Q80 => {
                assert!(count % QUANT_BLOCK_SIZE as u64 == 0, "Q80 count must align to blocks");
                (count / QUANT_BLOCK_SIZE as u64) * 34
            }
            FloatType::Q40 => {
                assert!(count % QUANT_BLOCK_SIZE as u64 == 0, "Q40 count must align to blocks");
                (count / QUANT_BLOCK_SIZE as u64) * 18
            }
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(FloatType::F32),
            1 => Some(FloatType::F16),
            2 => Some(FloatType::Q80),
            3 => Some(FloatType::Q40),
            _ => None,
        }
    }
}

/// Shape of one batch worth of a buffer: type, value count and the derived
/// byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeDesc {
    pub float_type: FloatType,
    pub count: u32,
    pub n_bytes: u64,
}

impl SizeDesc {
    pub fn new(float_type: FloatType, count: u32) -> Self {
        Self {
            float_type,
            count,
            n_bytes: float_type.bytes_for(count),
        }
    }
}

/// A named inter-op staging buffer, replicated `n_batches` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeConfig {
    pub name: String,
    pub size: SizeDesc,
}

/// A pipe that must be pushed from the root before the program starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreSyncConfig {
    pub pipe_index: u32,
}

/// Cluster-wide configuration, identical on every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    /// Maximum batch size any forward may use.
    pub n_batches: u32,
    /// Cluster size; 1 disables all sync machinery.
    pub n_nodes: u32,
    pub pipes: Vec<PipeConfig>,
    pub pre_syncs: Vec<PreSyncConfig>,
}

/// A named node-local working buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    pub name: String,
    pub size: SizeDesc,
}

/// Where an op reads from or writes to: a pipe or buffer slot.
///
/// Fixed-size POD; travels over the wire as two u32 fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpBufferRef {
    /// Source kind discriminator (pipe, buffer, ...) as agreed with the host.
    pub source: u32,
    /// Slot index within the source table.
    pub index: u32,
}

/// One tensor operation inside a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpConfig {
    /// Opaque op kind understood by the device.
    pub code: u32,
    /// Disambiguates ops sharing a name (e.g. per-layer instances).
    pub index: u32,
    /// Total weight bytes this op expects via `load_weight`.
    pub weight_size: u64,
    pub name: String,
    pub input: OpBufferRef,
    pub output: OpBufferRef,
    /// Opaque per-op parameter blob, forwarded to the device untouched.
    pub config: Vec<u8>,
}

/// Cross-node synchronization pattern over one pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyncType {
    /// Root broadcasts the whole pipe batch to every worker.
    WithRoot = 0,
    /// All-reduce (sum) across all nodes; every node ends with the sum.
    NodeSlices = 1,
    /// Reduction only: the root ends with the sum, workers are not updated.
    NodeSlicesExceptRoot = 2,
}

impl SyncType {
    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(SyncType::WithRoot),
            1 => Some(SyncType::NodeSlices),
            2 => Some(SyncType::NodeSlicesExceptRoot),
            _ => None,
        }
    }
}

/// A sync point executed after a segment's ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub pipe_index: u32,
    pub sync_type: SyncType,
}

/// A bounded group of ops with optional trailing syncs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    pub syncs: Vec<SyncConfig>,
    pub ops: Vec<OpConfig>,
}

/// Per-node program: this node's buffers and segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// 0 = root.
    pub node_index: u32,
    pub buffers: Vec<BufferConfig>,
    pub segments: Vec<SegmentConfig>,
}

impl NodeConfig {
    pub fn is_root(&self) -> bool {
        self.node_index == 0
    }
}
