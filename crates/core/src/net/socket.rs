//! Blocking TCP primitives.
//!
//! Every socket in the mesh runs with `TCP_NODELAY` and, where the platform
//! has it, `TCP_QUICKACK`. Bulk I/O is chunked at 4 KiB. In turbo mode the
//! streams are switched to non-blocking and callers spin on would-block
//! instead of sleeping; these helpers treat `WouldBlock` accordingly.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};

use super::error::{NetError, Result};

/// Fixed sentinel fencing handshake phases.
pub const ACK: u32 = 23_571_114;

/// Bulk I/O chunk boundary.
pub const MAX_CHUNK_SIZE: usize = 4096;

/// Apply the latency-oriented socket options every mesh socket uses.
pub fn configure(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    set_quick_ack(stream);
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_quick_ack(stream: &TcpStream) {
    use std::os::unix::io::AsRawFd;
    let value: libc::c_int = 1;
    // Best effort; QUICKACK is advisory and resets after reads anyway.
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_quick_ack(_stream: &TcpStream) {}

#[cfg(target_os = "linux")]
fn set_reuse_addr(listener: &TcpListener) {
    use std::os::unix::io::AsRawFd;
    let value: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            listener.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_reuse_addr(_listener: &TcpListener) {}

/// Dial `host:port` and configure the stream.
pub fn connect_to(host: &str, port: u16) -> Result<TcpStream> {
    let target = (host, port);
    let addrs: Vec<_> = target
        .to_socket_addrs()
        .map_err(|e| NetError::connection(format!("cannot resolve {host}:{port}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(NetError::connection(format!("no address for {host}:{port}")));
    }
    let stream = TcpStream::connect(&addrs[..])
        .map_err(|e| NetError::connection(format!("cannot connect to {host}:{port}: {e}")))?;
    configure(&stream)
        .map_err(|e| NetError::connection(format!("cannot configure socket: {e}")))?;
    Ok(stream)
}

/// Bind a reusable listener on `0.0.0.0:port`.
pub fn bind_listener(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .map_err(|e| NetError::connection(format!("cannot bind port {port}: {e}")))?;
    set_reuse_addr(&listener);
    Ok(listener)
}

/// Accept one inbound connection and configure it.
pub fn accept_from(listener: &TcpListener) -> Result<TcpStream> {
    let (stream, _) = listener
        .accept()
        .map_err(|e| NetError::connection(format!("accept failed: {e}")))?;
    configure(&stream)
        .map_err(|e| NetError::connection(format!("cannot configure socket: {e}")))?;
    Ok(stream)
}

fn is_spin(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Write all of `data`, spinning on would-block.
pub fn write_full(mut stream: &TcpStream, data: &[u8]) -> Result<()> {
    let mut sent = 0;
    while sent < data.len() {
        match stream.write(&data[sent..]) {
            Ok(0) => return Err(NetError::transfer("socket closed")),
            Ok(n) => sent += n,
            Err(e) if is_spin(&e) => continue,
            Err(e) => return Err(NetError::transfer(format!("write error: {e}"))),
        }
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes, spinning on would-block.
///
/// `max_attempts` bounds the number of would-block misses tolerated *before
/// the first byte arrives* (0 = unbounded); once any byte has been received
/// the read commits and spins to completion. Returns `false` when the budget
/// runs out with nothing read.
pub fn try_read_full(mut stream: &TcpStream, buf: &mut [u8], max_attempts: u64) -> Result<bool> {
    let mut received = 0;
    let mut budget = max_attempts;
    while received < buf.len() {
        match stream.read(&mut buf[received..]) {
            Ok(0) => return Err(NetError::transfer("socket closed")),
            Ok(n) => received += n,
            Err(e) if is_spin(&e) => {
                if received == 0 && max_attempts > 0 {
                    budget -= 1;
                    if budget == 0 {
                        return Ok(false);
                    }
                }
            }
            Err(e) => return Err(NetError::transfer(format!("read error: {e}"))),
        }
    }
    Ok(true)
}

/// Read exactly `buf.len()` bytes.
pub fn read_full(stream: &TcpStream, buf: &mut [u8]) -> Result<()> {
    try_read_full(stream, buf, 0).map(|_| ())
}

pub fn write_ack(stream: &TcpStream) -> Result<()> {
    write_full(stream, &ACK.to_ne_bytes())
}

/// Read and verify the ACK sentinel.
pub fn read_ack(stream: &TcpStream) -> Result<()> {
    let mut packet = [0u8; 4];
    read_full(stream, &mut packet)?;
    if u32::from_ne_bytes(packet) != ACK {
        return Err(NetError::transfer("invalid ack packet"));
    }
    Ok(())
}

pub fn write_u32(stream: &TcpStream, value: u32) -> Result<()> {
    write_full(stream, &value.to_ne_bytes())
}

pub fn read_u32(stream: &TcpStream) -> Result<u32> {
    let mut bytes = [0u8; 4];
    read_full(stream, &mut bytes)?;
    Ok(u32::from_ne_bytes(bytes))
}
