//! Compact node info carried in `find_node` responses.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::common::{Id, ID_SIZE};

/// Size of a compact IPv4 node info: id, ip and port.
pub const COMPACT_NODE_SIZE: usize = ID_SIZE + 6;

#[derive(Debug, Clone, PartialEq)]
/// Node contact, an [Id] and the socket address it was seen at.
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node { id, address }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.address)
    }
}

pub(crate) fn nodes4_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut vec = Vec::with_capacity(COMPACT_NODE_SIZE * nodes.len());
    for node in nodes {
        vec.extend_from_slice(node.id.as_bytes());
        vec.extend_from_slice(&node.address.ip().octets());
        vec.extend_from_slice(&node.address.port().to_be_bytes());
    }
    vec
}

/// Returns None if `bytes` is not a whole number of compact node infos.
pub(crate) fn bytes_to_nodes4(bytes: &[u8]) -> Option<Vec<Node>> {
    if bytes.len() % COMPACT_NODE_SIZE != 0 {
        return None;
    }

    bytes
        .chunks_exact(COMPACT_NODE_SIZE)
        .map(|chunk| {
            let id = Id::from_bytes(&chunk[..ID_SIZE]).ok()?;
            let ip = Ipv4Addr::new(
                chunk[ID_SIZE],
                chunk[ID_SIZE + 1],
                chunk[ID_SIZE + 2],
                chunk[ID_SIZE + 3],
            );
            let port = u16::from_be_bytes([chunk[ID_SIZE + 4], chunk[ID_SIZE + 5]]);

            Some(Node::new(id, SocketAddrV4::new(ip, port)))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compact_nodes() {
        let nodes = vec![
            Node::new(Id::random(), SocketAddrV4::new([127, 0, 0, 1].into(), 6881)),
            Node::new(Id::random(), SocketAddrV4::new([10, 0, 0, 2].into(), 1)),
        ];

        let bytes = nodes4_to_bytes(&nodes);
        assert_eq!(bytes.len(), 2 * COMPACT_NODE_SIZE);
        assert_eq!(bytes_to_nodes4(&bytes), Some(nodes));
    }

    #[test]
    fn truncated_compact_nodes() {
        assert_eq!(bytes_to_nodes4(&[0u8; COMPACT_NODE_SIZE + 3]), None);
    }
}
