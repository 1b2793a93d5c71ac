use std::marker::PhantomData;
use std::net::SocketAddr;
#[cfg(test)] use std::sync::Mutex;

use rand::Rng;
use tokio::sync::RwLock;
use tracing::debug;

/// number of attempts to pick a random peer while the directory is being modified concurrently
const RANDOM_PEER_ATTEMPTS: usize = 3;

#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_PEER_PICKER_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait PeerPicker {
    /// a uniformly distributed index in `0..len`, `len` is guaranteed to be > 0
    fn pick_index(len: usize) -> usize;
}
pub struct RandomPeerPicker {}
impl PeerPicker for RandomPeerPicker {
    fn pick_index(len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}

/// The set of remote peers in the current game, deduplicated by address. Insertion order is
///  preserved, so snapshots and peer lists are deterministic.
pub struct PeerDirectory<P: PeerPicker = RandomPeerPicker> {
    peers: RwLock<Vec<SocketAddr>>,
    _picker: PhantomData<fn() -> P>,
}

impl PeerDirectory {
    pub fn new() -> PeerDirectory {
        Self::new_with_picker()
    }
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl <P: PeerPicker> PeerDirectory<P> {
    pub fn new_with_picker() -> PeerDirectory<P> {
        PeerDirectory {
            peers: Default::default(),
            _picker: Default::default(),
        }
    }

    /// returns `false` if the peer was present already
    pub async fn add(&self, peer: SocketAddr) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains(&peer) {
            return false;
        }
        peers.push(peer);
        true
    }

    /// adds all peers that are not present yet, returning those that were added
    pub async fn merge(&self, new_peers: &[SocketAddr]) -> Vec<SocketAddr> {
        let mut peers = self.peers.write().await;
        let mut added = Vec::new();
        for &peer in new_peers {
            if !peers.contains(&peer) {
                peers.push(peer);
                added.push(peer);
            }
        }
        added
    }

    /// returns `false` if the peer was not present
    pub async fn remove(&self, peer: SocketAddr) -> bool {
        let mut peers = self.peers.write().await;
        match peers.iter().position(|p| *p == peer) {
            Some(idx) => {
                peers.remove(idx);
                true
            }
            None => false,
        }
    }

    pub async fn clear(&self) {
        self.peers.write().await.clear();
    }

    pub async fn contains(&self, peer: SocketAddr) -> bool {
        self.peers.read().await.contains(&peer)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<SocketAddr> {
        self.peers.read().await.clone()
    }

    pub async fn snapshot_except(&self, excluded: SocketAddr) -> Vec<SocketAddr> {
        self.peers.read().await
            .iter()
            .filter(|p| **p != excluded)
            .cloned()
            .collect()
    }

    /// The size is read separately from the picked entry, and a concurrent removal may
    ///  invalidate the index in between. That is retried a bounded number of times.
    pub async fn random_peer(&self) -> Option<SocketAddr> {
        for _ in 0..RANDOM_PEER_ATTEMPTS {
            let len = self.len().await;
            if len == 0 {
                return None;
            }

            let idx = P::pick_index(len);
            if let Some(peer) = self.peers.read().await.get(idx) {
                return Some(*peer);
            }
            debug!(idx, len, "peer directory changed while picking a random peer - retrying");
        }
        None
    }
}
