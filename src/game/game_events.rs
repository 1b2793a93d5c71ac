use std::net::SocketAddr;

/// The application level operations of a [crate::game::p2p_api::P2pApi], for reporting failures
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Operation {
    Join,
    Leave,
    RequestPeerList,
    SendPeerList,
    StartGame,
    SendBomb,
    SendLose,
    /// announcing a joined peer to another peer
    PeerJoined,
    /// announcing a peer that quit to another peer
    PeerLeft,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GameEvent {
    PeerJoined(SocketAddr),
    PeerLeft(SocketAddr),
    /// the peers in a received peer list, after they were merged into the local directory
    PeerListReceived(Vec<SocketAddr>),
    GameStarts {
        bomb_time: i32,
    },
    BombReceived {
        from: SocketAddr,
        bomb_time: i32,
    },
    PeerLost(SocketAddr),
    /// An operation was not acknowledged (after all configured retries). The game layer will
    ///  typically remove the peer and carry on with another one.
    OperationFailed {
        operation: Operation,
        peer: SocketAddr,
    },
    SocketDied,
}
