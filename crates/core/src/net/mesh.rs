//! Cluster bring-up: building the full TCP mesh.
//!
//! Every pair of nodes holds exactly one socket. On node `i` the socket array
//! indexes peers by the rule in [`socket_index_for_node`]; on workers the
//! root is always socket 0.
//!
//! Bring-up is a strict request/response handshake:
//! 1. The root dials every worker and sends it the mesh size, the worker's
//!    index and the host table of every other worker, then collects an ACK.
//! 2. Once all workers acknowledged, the root sends a second ACK to each
//!    ("root ready").
//! 3. Each worker then completes the mesh: it dials every worker at or after
//!    its own index and accepts a connection from every worker before it.
//!    The deterministic ordering keeps dial and accept from racing.

use std::net::TcpStream;

use tracing::info;

use super::error::{NetError, Result};
use super::socket;

/// Address of one worker from the root's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

/// Map a peer's node index to its slot in this node's socket array.
///
/// On node `i`, socket `s` holds peer `s` when `s < i` and peer `s + 1`
/// otherwise; equivalently the array lists every other node in order. The
/// root therefore sits at socket 0 on every worker.
pub fn socket_index_for_node(my_node: u32, peer_node: u32) -> usize {
    debug_assert_ne!(my_node, peer_node, "a node holds no socket to itself");
    if peer_node < my_node {
        peer_node as usize
    } else {
        (peer_node - 1) as usize
    }
}

fn write_host(stream: &TcpStream, host: &str) -> Result<()> {
    // Length includes the NUL terminator.
    let len = host.len() as u32 + 1;
    socket::write_u32(stream, len)?;
    socket::write_full(stream, host.as_bytes())?;
    socket::write_full(stream, &[0u8])
}

fn read_host(stream: &TcpStream) -> Result<String> {
    let len = socket::read_u32(stream)? as usize;
    if len == 0 {
        return Err(NetError::transfer("empty host in peer table"));
    }
    let mut bytes = vec![0u8; len];
    socket::read_full(stream, &mut bytes)?;
    bytes.pop(); // NUL
    String::from_utf8(bytes).map_err(|_| NetError::transfer("host is not valid utf-8"))
}

/// Worker-side bring-up: listen on `port` and join the mesh the root
/// announces. Returns the indexed socket array (root at index 0).
pub fn serve(port: u16) -> Result<Vec<TcpStream>> {
    let listener = socket::bind_listener(port)?;
    info!(port, "listening for the root node");

    let root = socket::accept_from(&listener)?;
    info!("root node connected");

    let n_sockets = socket::read_u32(&root)?;
    if n_sockets == 0 {
        return Err(NetError::transfer("mesh announced zero sockets"));
    }
    // The peer table lists every worker but this one.
    let n_peers = n_sockets - 1;
    let worker_index = socket::read_u32(&root)?;
    info!(n_sockets, worker_index, "received mesh layout");

    let mut peers = Vec::with_capacity(n_peers as usize);
    for _ in 0..n_peers {
        let host = read_host(&root)?;
        let peer_port = socket::read_u32(&root)? as u16;
        peers.push(PeerAddr::new(host, peer_port));
    }

    socket::write_ack(&root)?;
    // Workers must not dial each other until every worker holds the table.
    socket::read_ack(&root)?;

    let mut sockets = Vec::with_capacity(n_sockets as usize);
    sockets.push(root);

    for (i, peer) in peers.iter().enumerate() {
        let socket_index = i + 1;
        let stream = if i as u32 >= worker_index {
            info!(socket_index, host = %peer.host, port = peer.port, "dialing worker");
            socket::connect_to(&peer.host, peer.port)?
        } else {
            info!(socket_index, host = %peer.host, port = peer.port, "awaiting worker");
            socket::accept_from(&listener)?
        };
        sockets.push(stream);
    }

    info!("mesh established");
    Ok(sockets)
}

/// Root-side bring-up: dial every worker, distribute the peer table, release
/// the mesh. Returns the indexed socket array (worker `i + 1` at index `i`).
pub fn connect(workers: &[PeerAddr]) -> Result<Vec<TcpStream>> {
    assert!(!workers.is_empty(), "mesh needs at least one worker");
    let n_sockets = workers.len() as u32;

    let mut sockets = Vec::with_capacity(workers.len());
    for (i, worker) in workers.iter().enumerate() {
        info!(socket_index = i, host = %worker.host, port = worker.port, "dialing worker");
        let stream = socket::connect_to(&worker.host, worker.port)?;

        socket::write_u32(&stream, n_sockets)?;
        socket::write_u32(&stream, i as u32)?;
        for (j, other) in workers.iter().enumerate() {
            if j == i {
                continue;
            }
            write_host(&stream, &other.host)?;
            socket::write_u32(&stream, other.port as u32)?;
        }
        socket::read_ack(&stream)?;
        sockets.push(stream);
    }

    for stream in &sockets {
        socket::write_ack(stream)?;
    }

    info!("mesh established");
    Ok(sockets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_maps_workers_shifted_down() {
        assert_eq!(socket_index_for_node(0, 1), 0);
        assert_eq!(socket_index_for_node(0, 5), 4);
    }

    #[test]
    fn workers_keep_root_at_zero() {
        for node in 1..6 {
            assert_eq!(socket_index_for_node(node, 0), 0);
        }
    }

    #[test]
    fn worker_to_worker_skips_self() {
        // On node 2 of a 5-node mesh: peers are 0, 1, 3, 4.
        assert_eq!(socket_index_for_node(2, 0), 0);
        assert_eq!(socket_index_for_node(2, 1), 1);
        assert_eq!(socket_index_for_node(2, 3), 2);
        assert_eq!(socket_index_for_node(2, 4), 3);
    }

    #[test]
    fn mapping_is_injective_per_node() {
        let n_nodes = 6u32;
        for me in 0..n_nodes {
            let mut seen = vec![false; (n_nodes - 1) as usize];
            for peer in 0..n_nodes {
                if peer == me {
                    continue;
                }
                let s = socket_index_for_node(me, peer);
                assert!(!seen[s], "socket {s} reused on node {me}");
                seen[s] = true;
            }
            assert!(seen.iter().all(|&v| v));
        }
    }
}
