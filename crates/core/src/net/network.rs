//! The indexed socket array and its I/O surface.
//!
//! A [`Network`] owns one configured TCP stream per peer, per-socket byte
//! counters and optional transfer telemetry. Collective steps drive it
//! through the scatter/gather calls [`Network::write_many`] /
//! [`Network::read_many`], which make progress on every socket that can move
//! bytes and drain the rest on would-block.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

use super::error::{NetError, Result};
use super::mesh::{self, PeerAddr};
use super::metrics::{SocketStats, Telemetry};
use super::socket;

/// On workers the root always occupies socket 0.
pub const ROOT_SOCKET_INDEX: usize = 0;

/// One pending send: `data` to the socket at `socket_index`.
pub struct WriteIo<'a> {
    pub socket_index: usize,
    pub data: &'a [u8],
}

/// One pending receive: fill `data` from the socket at `socket_index`.
pub struct ReadIo<'a> {
    pub socket_index: usize,
    pub data: &'a mut [u8],
}

/// Fixed full-mesh socket array with counters and telemetry.
pub struct Network {
    sockets: Vec<TcpStream>,
    sent_bytes: Vec<AtomicU64>,
    recv_bytes: Vec<AtomicU64>,
    turbo: AtomicBool,
    telemetry: Telemetry,
}

impl Network {
    /// Worker-side constructor: join the mesh via [`mesh::serve`].
    pub fn serve(port: u16, monitor: bool) -> Result<Self> {
        Ok(Self::from_streams(mesh::serve(port)?, monitor))
    }

    /// Root-side constructor: build the mesh via [`mesh::connect`].
    pub fn connect(workers: &[PeerAddr], monitor: bool) -> Result<Self> {
        Ok(Self::from_streams(mesh::connect(workers)?, monitor))
    }

    /// Wrap an already-established socket array.
    pub fn from_streams(sockets: Vec<TcpStream>, monitor: bool) -> Self {
        let n = sockets.len();
        Self {
            sockets,
            sent_bytes: (0..n).map(|_| AtomicU64::new(0)).collect(),
            recv_bytes: (0..n).map(|_| AtomicU64::new(0)).collect(),
            turbo: AtomicBool::new(false),
            telemetry: Telemetry::new(n, monitor),
        }
    }

    pub fn n_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Toggle non-blocking mode on every socket at once. While enabled,
    /// reads and writes spin on would-block instead of sleeping in the
    /// kernel.
    pub fn set_turbo(&self, enabled: bool) -> Result<()> {
        for stream in &self.sockets {
            stream
                .set_nonblocking(enabled)
                .map_err(|e| NetError::connection(format!("cannot toggle non-blocking: {e}")))?;
        }
        self.turbo.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_turbo(&self) -> bool {
        self.turbo.load(Ordering::Relaxed)
    }

    fn stream(&self, socket_index: usize) -> &TcpStream {
        &self.sockets[socket_index]
    }

    /// Chunked blocking write to one socket.
    pub fn write(&self, socket_index: usize, data: &[u8]) -> Result<()> {
        assert!(socket_index < self.sockets.len());
        let start = Instant::now();

        let stream = self.stream(socket_index);
        for chunk in data.chunks(socket::MAX_CHUNK_SIZE) {
            socket::write_full(stream, chunk)?;
        }
        self.sent_bytes[socket_index].fetch_add(data.len() as u64, Ordering::Relaxed);

        self.telemetry
            .record("write", socket_index, data.len() as u64, start, Instant::now());
        Ok(())
    }

    /// Chunked blocking read from one socket.
    pub fn read(&self, socket_index: usize, data: &mut [u8]) -> Result<()> {
        assert!(socket_index < self.sockets.len());
        let start = Instant::now();

        let stream = self.stream(socket_index);
        for chunk in data.chunks_mut(socket::MAX_CHUNK_SIZE) {
            socket::read_full(stream, chunk)?;
        }
        self.recv_bytes[socket_index].fetch_add(data.len() as u64, Ordering::Relaxed);

        self.telemetry
            .record("read", socket_index, data.len() as u64, start, Instant::now());
        Ok(())
    }

    pub fn write_ack(&self, socket_index: usize) -> Result<()> {
        socket::write_ack(self.stream(socket_index))
    }

    pub fn read_ack(&self, socket_index: usize) -> Result<()> {
        socket::read_ack(self.stream(socket_index))
    }

    /// Opportunistic read: give up after `max_attempts` would-block misses
    /// with no byte received. Intended for probing while in turbo mode.
    pub fn try_read_with_max_attempts(
        &self,
        socket_index: usize,
        data: &mut [u8],
        max_attempts: u64,
    ) -> Result<bool> {
        assert!(socket_index < self.sockets.len());
        if socket::try_read_full(self.stream(socket_index), data, max_attempts)? {
            self.recv_bytes[socket_index].fetch_add(data.len() as u64, Ordering::Relaxed);
            return Ok(true);
        }
        Ok(false)
    }

    /// Vectored send: progress every socket that accepts bytes, round-robin,
    /// until all transfers complete. One chunk per socket per pass keeps the
    /// streams interleaved instead of head-of-line blocked.
    pub fn write_many(&self, ios: &mut [WriteIo<'_>]) -> Result<()> {
        for io in ios.iter() {
            assert!(io.socket_index < self.sockets.len());
            self.sent_bytes[io.socket_index].fetch_add(io.data.len() as u64, Ordering::Relaxed);
        }
        let mut writing = true;
        while writing {
            writing = false;
            for io in ios.iter_mut() {
                if io.data.is_empty() {
                    continue;
                }
                writing = true;
                let mut stream = self.stream(io.socket_index);
                let chunk = io.data.len().min(socket::MAX_CHUNK_SIZE);
                match stream.write(&io.data[..chunk]) {
                    Ok(0) => return Err(NetError::transfer("socket closed")),
                    Ok(n) => io.data = &io.data[n..],
                    Err(e) if is_spin(&e) => continue,
                    Err(e) => return Err(NetError::transfer(format!("write error: {e}"))),
                }
            }
        }
        Ok(())
    }

    /// Vectored receive counterpart of [`Network::write_many`].
    pub fn read_many(&self, ios: &mut [ReadIo<'_>]) -> Result<()> {
        let start = Instant::now();
        let mut total = 0u64;
        for io in ios.iter() {
            assert!(io.socket_index < self.sockets.len());
            self.recv_bytes[io.socket_index].fetch_add(io.data.len() as u64, Ordering::Relaxed);
            total += io.data.len() as u64;
        }
        let mut reading = true;
        while reading {
            reading = false;
            for io in ios.iter_mut() {
                if io.data.is_empty() {
                    continue;
                }
                reading = true;
                let mut stream = self.stream(io.socket_index);
                match stream.read(io.data) {
                    Ok(0) => return Err(NetError::transfer("socket closed")),
                    Ok(n) => {
                        let rest = std::mem::take(&mut io.data);
                        io.data = &mut rest[n..];
                    }
                    Err(e) if is_spin(&e) => continue,
                    Err(e) => return Err(NetError::transfer(format!("read error: {e}"))),
                }
            }
        }
        self.telemetry.record("read_many", 0, total, start, Instant::now());
        Ok(())
    }

    /// Broadcast `data` to every socket.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut ios: Vec<WriteIo<'_>> = (0..self.sockets.len())
            .map(|socket_index| WriteIo { socket_index, data })
            .collect();
        self.write_many(&mut ios)
    }

    /// Total (sent, received) bytes since the last call; resets counters.
    pub fn total_stats(&self) -> (u64, u64) {
        let mut sent = 0;
        let mut recv = 0;
        for counter in &self.sent_bytes {
            sent += counter.swap(0, Ordering::Relaxed);
        }
        for counter in &self.recv_bytes {
            recv += counter.swap(0, Ordering::Relaxed);
        }
        (sent, recv)
    }

    pub fn reset_stats(&self) {
        for counter in self.sent_bytes.iter().chain(self.recv_bytes.iter()) {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn is_monitoring_enabled(&self) -> bool {
        self.telemetry.enabled()
    }

    /// Record an externally-timed operation (collective steps use this).
    pub fn record_operation(
        &self,
        kind: &'static str,
        socket_index: usize,
        bytes: u64,
        start: Instant,
        end: Instant,
    ) {
        self.telemetry.record(kind, socket_index, bytes, start, end);
    }

    pub fn socket_stats(&self, socket_index: usize) -> Option<SocketStats> {
        self.telemetry.socket_stats(socket_index)
    }

    pub fn performance_report(&self) {
        self.telemetry.performance_report();
    }

    pub fn bottleneck_report(&self) {
        self.telemetry.bottleneck_report();
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        for stream in &self.sockets {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        info!("network closed");
    }
}

fn is_spin(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
