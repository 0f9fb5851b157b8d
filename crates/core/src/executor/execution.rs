//! Mutable per-node run state: the pipe buffers and the batch size.
//!
//! Pipes are the staging buffers every op reads and writes and every sync
//! ships across the wire. They are allocated once, zeroed, 64-byte aligned
//! and live for the lifetime of the run. Ops partition pipe access by thread
//! index and collectives touch sockets from one thread only, so the buffers
//! are handed out as raw ranges with the aliasing discipline documented on
//! [`Pipe`].

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::NetConfig;

/// Alignment of every pipe allocation; covers any element type the
/// reduction kernels read and keeps slices cacheline-friendly.
pub const PIPE_ALIGN: usize = 64;

struct AlignedAlloc {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedAlloc {
    fn zeroed(len: usize) -> Self {
        assert!(len > 0, "pipe must not be empty");
        let layout = Layout::from_size_align(len, PIPE_ALIGN).expect("pipe layout");
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, len, layout }
    }
}

impl Drop for AlignedAlloc {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// One staging buffer of `n_batches x batch_bytes`, shared by all worker
/// threads.
///
/// Access goes through raw-range views because the buffer is concurrently
/// written by data-parallel ops. Callers uphold the partitioning rules: a
/// range handed out as mutable must not be observed by any other thread for
/// the duration of the borrow. The executor's step barrier delimits those
/// windows.
pub struct Pipe {
    alloc: AlignedAlloc,
}

unsafe impl Send for Pipe {}
unsafe impl Sync for Pipe {}

impl Pipe {
    fn zeroed(len: usize) -> Self {
        Self { alloc: AlignedAlloc::zeroed(len) }
    }

    pub fn len(&self) -> usize {
        self.alloc.len
    }

    pub fn is_empty(&self) -> bool {
        self.alloc.len == 0
    }

    /// Shared view of `offset..offset + len`.
    ///
    /// # Safety
    /// No thread may hold a mutable view overlapping the range while the
    /// returned slice is alive.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset.checked_add(len).is_some_and(|end| end <= self.alloc.len));
        std::slice::from_raw_parts(self.alloc.ptr.as_ptr().add(offset), len)
    }

    /// Mutable view of `offset..offset + len`.
    ///
    /// # Safety
    /// The range must not be observed by any other thread while the returned
    /// slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset.checked_add(len).is_some_and(|end| end <= self.alloc.len));
        std::slice::from_raw_parts_mut(self.alloc.ptr.as_ptr().add(offset), len)
    }
}

/// Mutable state of one node's run: pipes plus the per-forward batch size.
pub struct NetExecution {
    n_threads: usize,
    n_batches: u32,
    batch_size: AtomicU32,
    pipes: Vec<Pipe>,
}

impl NetExecution {
    /// Allocate zeroed pipes per the cluster config.
    pub fn new(n_threads: usize, net_config: &NetConfig) -> Self {
        assert!(n_threads > 0, "executor needs at least one thread");
        let pipes = net_config
            .pipes
            .iter()
            .map(|pipe| Pipe::zeroed(net_config.n_batches as usize * pipe.size.n_bytes as usize))
            .collect();
        Self {
            n_threads,
            n_batches: net_config.n_batches,
            // Must be overwritten via set_batch_size before any forward.
            batch_size: AtomicU32::new(0),
            pipes,
        }
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    pub fn n_batches(&self) -> u32 {
        self.n_batches
    }

    pub fn n_pipes(&self) -> usize {
        self.pipes.len()
    }

    pub fn pipe(&self, pipe_index: usize) -> &Pipe {
        &self.pipes[pipe_index]
    }

    /// Set the batch size for subsequent forwards.
    ///
    /// # Panics
    /// Panics when `batch_size` exceeds the configured maximum.
    pub fn set_batch_size(&self, batch_size: u32) {
        assert!(batch_size <= self.n_batches, "batch size exceeds n_batches");
        self.batch_size.store(batch_size, Ordering::Release);
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size.load(Ordering::Acquire)
    }
}
