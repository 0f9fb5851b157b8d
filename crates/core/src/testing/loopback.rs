//! Loopback socket builders for in-process multi-node tests.

use std::net::{TcpListener, TcpStream};
use std::thread;

use crate::net::mesh::socket_index_for_node;
use crate::net::network::Network;

/// One connected localhost stream pair.
pub fn stream_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let dial = thread::spawn(move || TcpStream::connect(addr).unwrap());
    let (accepted, _) = listener.accept().unwrap();
    (dial.join().unwrap(), accepted)
}

/// Two single-socket [`Network`]s wired to each other.
pub fn network_pair() -> (Network, Network) {
    let (a, b) = stream_pair();
    (
        Network::from_streams(vec![a], false),
        Network::from_streams(vec![b], false),
    )
}

/// A full in-process mesh: one socket array per node, indexed by the
/// standard peer mapping rule (`n * (n - 1) / 2` connections total).
pub fn loopback_mesh(n_nodes: usize) -> Vec<Vec<TcpStream>> {
    assert!(n_nodes >= 2);
    let mut arrays: Vec<Vec<Option<TcpStream>>> =
        (0..n_nodes).map(|_| (0..n_nodes - 1).map(|_| None).collect()).collect();

    for i in 0..n_nodes {
        for j in (i + 1)..n_nodes {
            let (a, b) = stream_pair();
            arrays[i][socket_index_for_node(i as u32, j as u32)] = Some(a);
            arrays[j][socket_index_for_node(j as u32, i as u32)] = Some(b);
        }
    }

    arrays
        .into_iter()
        .map(|sockets| sockets.into_iter().map(Option::unwrap).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_arrays_have_full_degree() {
        let mesh = loopback_mesh(4);
        assert_eq!(mesh.len(), 4);
        assert!(mesh.iter().all(|sockets| sockets.len() == 3));
    }
}
