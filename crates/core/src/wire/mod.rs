//! Root-to-worker wire protocols: config broadcast and weight streaming.
//!
//! Both protocols are raw field-by-field streams over the mesh sockets, with
//! fixed-width native-endian scalars and length-prefixed NUL-terminated
//! strings. The cluster is a same-binary deployment, so no endianness or
//! width conversion is performed.

pub mod config;
pub mod weights;

use crate::net::network::Network;
use crate::net::{NetError, Result};

pub(crate) fn write_u32(network: &Network, socket_index: usize, value: u32) -> Result<()> {
    network.write(socket_index, &value.to_ne_bytes())
}

pub(crate) fn read_u32(network: &Network, socket_index: usize) -> Result<u32> {
    let mut bytes = [0u8; 4];
    network.read(socket_index, &mut bytes)?;
    Ok(u32::from_ne_bytes(bytes))
}

pub(crate) fn write_u64(network: &Network, socket_index: usize, value: u64) -> Result<()> {
    network.write(socket_index, &value.to_ne_bytes())
}

pub(crate) fn read_u64(network: &Network, socket_index: usize) -> Result<u64> {
    let mut bytes = [0u8; 8];
    network.read(socket_index, &mut bytes)?;
    Ok(u64::from_ne_bytes(bytes))
}

/// `{ len:u32 (includes NUL), bytes..., 0x00 }`
pub(crate) fn write_string(network: &Network, socket_index: usize, value: &str) -> Result<()> {
    write_u32(network, socket_index, value.len() as u32 + 1)?;
    network.write(socket_index, value.as_bytes())?;
    network.write(socket_index, &[0u8])
}

pub(crate) fn read_string(network: &Network, socket_index: usize) -> Result<String> {
    let len = read_u32(network, socket_index)? as usize;
    if len == 0 {
        return Err(NetError::Transfer { reason: "empty string on the wire".into() });
    }
    let mut bytes = vec![0u8; len];
    network.read(socket_index, &mut bytes)?;
    bytes.pop(); // NUL
    String::from_utf8(bytes)
        .map_err(|_| NetError::Transfer { reason: "string is not valid utf-8".into() })
}
