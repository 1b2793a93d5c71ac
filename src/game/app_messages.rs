use std::net::SocketAddr;

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum AppMessageKind {
    PassBomb = 1,
    Lose = 2,
    Join = 3,
    Quit = 4,
    ListPeers = 5,
    Peers = 6,
    PeerJoined = 7,
    PeerQuit = 8,
    Start = 9,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum GameStatus {
    Open = 0,
    Running = 1,
    Ended = 2,
}

#[derive(Debug, thiserror::Error)]
pub enum AppMessageError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("invalid data for {0:?}: {1}")]
    InvalidData(AppMessageKind, String),
}

/// The game's application protocol, carried as JSON in the payload of data messages:
///  `{"msg": <kind>, "data": {...}}`
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AppMessage {
    Join,
    Quit,
    ListPeers,
    Peers(Vec<SocketAddr>),
    PeerJoined(SocketAddr),
    PeerQuit(SocketAddr),
    Start { bomb_time: i32 },
    PassBomb { bomb_time: i32, status: GameStatus },
    Lose { status: GameStatus },
}

#[derive(Serialize, Deserialize)]
struct RawAppMessage {
    msg: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct StartData {
    bombtime: i32,
}

#[derive(Serialize, Deserialize)]
struct PassBombData {
    bombtime: i32,
    #[serde(default = "status_running")]
    status: GameStatus,
}

#[derive(Serialize, Deserialize)]
struct LoseData {
    #[serde(default = "status_ended")]
    status: GameStatus,
}

#[derive(Serialize, Deserialize)]
struct PeerData {
    peer: SocketAddr,
}

#[derive(Serialize, Deserialize)]
struct PeerListData {
    peerlist: Vec<String>,
}

fn status_running() -> GameStatus {
    GameStatus::Running
}

fn status_ended() -> GameStatus {
    GameStatus::Ended
}

impl AppMessage {
    pub fn kind(&self) -> AppMessageKind {
        match self {
            AppMessage::Join => AppMessageKind::Join,
            AppMessage::Quit => AppMessageKind::Quit,
            AppMessage::ListPeers => AppMessageKind::ListPeers,
            AppMessage::Peers(_) => AppMessageKind::Peers,
            AppMessage::PeerJoined(_) => AppMessageKind::PeerJoined,
            AppMessage::PeerQuit(_) => AppMessageKind::PeerQuit,
            AppMessage::Start { .. } => AppMessageKind::Start,
            AppMessage::PassBomb { .. } => AppMessageKind::PassBomb,
            AppMessage::Lose { .. } => AppMessageKind::Lose,
        }
    }

    pub fn ser(&self) -> Result<Bytes, AppMessageError> {
        let data = match self {
            AppMessage::Join | AppMessage::Quit | AppMessage::ListPeers => None,
            AppMessage::Peers(peers) => Some(serde_json::to_value(PeerListData {
                peerlist: peers.iter().map(|p| p.to_string()).collect(),
            })?),
            AppMessage::PeerJoined(peer) | AppMessage::PeerQuit(peer) => Some(serde_json::to_value(PeerData { peer: *peer })?),
            AppMessage::Start { bomb_time } => Some(serde_json::to_value(StartData { bombtime: *bomb_time })?),
            AppMessage::PassBomb { bomb_time, status } => Some(serde_json::to_value(PassBombData { bombtime: *bomb_time, status: *status })?),
            AppMessage::Lose { status } => Some(serde_json::to_value(LoseData { status: *status })?),
        };

        let raw = RawAppMessage {
            msg: self.kind().into(),
            data,
        };
        Ok(serde_json::to_vec(&raw)?.into())
    }

    /// Validates the payload's shape for its kind - anything that does not match is an error
    pub fn try_deser(buf: &[u8]) -> Result<AppMessage, AppMessageError> {
        let raw: RawAppMessage = serde_json::from_slice(buf)?;
        let kind = AppMessageKind::try_from(raw.msg)
            .map_err(|_| AppMessageError::UnknownKind(raw.msg))?;

        let data = match raw.data {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(data)) => data,
            Some(_) => return Err(AppMessageError::InvalidData(kind, "data is not an object".to_string())),
        };

        let msg = match kind {
            AppMessageKind::Join => AppMessage::Join,
            AppMessageKind::Quit => AppMessage::Quit,
            AppMessageKind::ListPeers => AppMessage::ListPeers,
            AppMessageKind::Peers => {
                let data: PeerListData = parse_data(kind, data)?;
                AppMessage::Peers(parse_peer_list(&data.peerlist))
            }
            AppMessageKind::PeerJoined => AppMessage::PeerJoined(parse_data::<PeerData>(kind, data)?.peer),
            AppMessageKind::PeerQuit => AppMessage::PeerQuit(parse_data::<PeerData>(kind, data)?.peer),
            AppMessageKind::Start => {
                let data: StartData = parse_data(kind, data)?;
                AppMessage::Start { bomb_time: data.bombtime }
            }
            AppMessageKind::PassBomb => {
                let data: PassBombData = parse_data(kind, data)?;
                AppMessage::PassBomb { bomb_time: data.bombtime, status: data.status }
            }
            AppMessageKind::Lose => {
                let data: LoseData = parse_data(kind, data)?;
                AppMessage::Lose { status: data.status }
            }
        };
        Ok(msg)
    }
}

fn parse_data<T: DeserializeOwned>(kind: AppMessageKind, data: Map<String, Value>) -> Result<T, AppMessageError> {
    serde_json::from_value(Value::Object(data))
        .map_err(|e| AppMessageError::InvalidData(kind, e.to_string()))
}

/// entries that are not valid socket addresses are skipped individually
fn parse_peer_list(peerlist: &[String]) -> Vec<SocketAddr> {
    peerlist.iter()
        .filter_map(|s| match s.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                debug!("skipping invalid peer address {:?} in peer list", s);
                None
            }
        })
        .collect()
}
