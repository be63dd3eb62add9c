//! Interfaces the streaming core consumes from the overlay layer.
//!
//! The core never opens sockets: the routing layer hands it established,
//! authenticated peer links and answers "who is near this key" queries.

use std::fmt;

use async_trait::async_trait;

use weir_core::wire::Message;
use weir_core::ChunkKey;

/// Overlay address of a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}…)", hex::encode(&self.0[..8]))
    }
}

/// Log-distance proximity order between two 256-bit addresses: the number
/// of leading bits they share. Identical addresses report 255.
pub fn proximity(a: &[u8; 32], b: &[u8; 32]) -> u8 {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            return (i * 8) as u8 + diff.leading_zeros() as u8;
        }
    }
    255
}

/// The DHT-like routing layer.
pub trait Overlay: Send + Sync {
    /// Invoke `f(peer, proximity_order, is_nearest_neighbour)` for each
    /// connected peer in non-decreasing distance to `key`, up to `max_po`,
    /// stopping when `f` returns `false`.
    fn each_conn(&self, key: &ChunkKey, max_po: u8, f: &mut dyn FnMut(PeerId, u8, bool) -> bool);
}

/// The established link to one peer. Sending is the core's only duty here;
/// decoded inbound messages arrive through the dispatch loop.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn id(&self) -> PeerId;

    /// The peer's public signing key, when the link layer authenticated
    /// one. Enables takeover proof verification.
    fn remote_public_key(&self) -> Option<[u8; 32]> {
        None
    }

    async fn send(&self, msg: Message) -> Result<(), LinkClosed>;
}

/// The peer link is gone; the dispatch loop will wind the peer down.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("peer link closed")]
pub struct LinkClosed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proximity_counts_shared_prefix_bits() {
        let zero = [0u8; 32];
        let mut one_bit = [0u8; 32];
        one_bit[0] = 0b1000_0000;
        assert_eq!(proximity(&zero, &one_bit), 0);

        let mut low_bit = [0u8; 32];
        low_bit[31] = 1;
        assert_eq!(proximity(&zero, &low_bit), 255);

        let mut mid = [0u8; 32];
        mid[2] = 0b0001_0000;
        assert_eq!(proximity(&zero, &mid), 19);
    }

    #[test]
    fn proximity_of_identical_addresses_is_max() {
        let addr = [0xabu8; 32];
        assert_eq!(proximity(&addr, &addr), 255);
    }
}
