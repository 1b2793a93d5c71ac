use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::P2pConfig;
use crate::game::app_messages::{AppMessage, AppMessageError, GameStatus};
use crate::game::game_events::{GameEvent, Operation};
use crate::game::peer_directory::PeerDirectory;
use crate::messaging::messenger::{MessengerError, Receipt, SendOutcome};
use crate::session::p2p_manager::P2pManager;
use crate::session::session_events::SessionEvent;
use crate::util::event_notifier::EventNotifier;

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("{operation:?} to {peer} was not acknowledged in time")]
    Timeout {
        operation: Operation,
        peer: SocketAddr,
    },
    #[error("session is closed")]
    Closed,
    #[error("{operation:?} to {peer} failed: {cause}")]
    Transport {
        operation: Operation,
        peer: SocketAddr,
        cause: anyhow::Error,
    },
    #[error("failed to encode message: {0}")]
    Encode(#[from] AppMessageError),
    #[error("operation task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

pub type BroadcastResult = Vec<(SocketAddr, Result<(), GameError>)>;

/// an application level operation, re-issued as a whole on retry
#[derive(Clone, Debug)]
enum Request {
    Join,
    Leave,
    RequestPeerList,
    SendPeerList(Vec<SocketAddr>),
    StartGame(i32),
    SendBomb(i32),
    SendLose,
    AnnouncePeerJoined(SocketAddr),
    AnnouncePeerQuit(SocketAddr),
}
impl Request {
    fn operation(&self) -> Operation {
        match self {
            Request::Join => Operation::Join,
            Request::Leave => Operation::Leave,
            Request::RequestPeerList => Operation::RequestPeerList,
            Request::SendPeerList(_) => Operation::SendPeerList,
            Request::StartGame(_) => Operation::StartGame,
            Request::SendBomb(_) => Operation::SendBomb,
            Request::SendLose => Operation::SendLose,
            Request::AnnouncePeerJoined(_) => Operation::PeerJoined,
            Request::AnnouncePeerQuit(_) => Operation::PeerLeft,
        }
    }

    fn app_message(&self) -> AppMessage {
        match self {
            Request::Join => AppMessage::Join,
            Request::Leave => AppMessage::Quit,
            Request::RequestPeerList => AppMessage::ListPeers,
            Request::SendPeerList(peers) => AppMessage::Peers(peers.clone()),
            Request::StartGame(bomb_time) => AppMessage::Start { bomb_time: *bomb_time },
            Request::SendBomb(bomb_time) => AppMessage::PassBomb { bomb_time: *bomb_time, status: GameStatus::Running },
            Request::SendLose => AppMessage::Lose { status: GameStatus::Ended },
            Request::AnnouncePeerJoined(peer) => AppMessage::PeerJoined(*peer),
            Request::AnnouncePeerQuit(peer) => AppMessage::PeerQuit(*peer),
        }
    }
}

/// The game's protocol on top of a [P2pManager] session: peer bookkeeping, and operations that
///  complete when the peer acknowledged (or failed to acknowledge) them.
///
/// A [P2pApi] must be closed explicitly by calling [P2pApi::close].
pub struct P2pApi {
    manager: Arc<P2pManager>,
    directory: PeerDirectory,
    events: EventNotifier<GameEvent>,
    operation_retries: u32,
    peer_capacity: usize,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl P2pApi {
    /// binds a UDP socket and opens a session on it
    pub async fn bind(config: P2pConfig, is_host: bool) -> anyhow::Result<Arc<P2pApi>> {
        let manager = P2pManager::bind(Arc::new(config), is_host).await?;
        Self::open(Arc::new(manager)).await
    }

    /// Starts the (not yet started) session and dispatching of incoming application messages
    pub async fn open(manager: Arc<P2pManager>) -> anyhow::Result<Arc<P2pApi>> {
        let config = manager.config();
        let api = Arc::new(P2pApi {
            operation_retries: config.operation_retries,
            peer_capacity: config.peer_capacity,
            manager: manager.clone(),
            directory: PeerDirectory::new(),
            events: EventNotifier::new(),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            dispatcher: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let session_events = manager.subscribe();
        manager.start().await?;

        let dispatcher = tokio::spawn(api.clone().dispatch(session_events));
        *api.dispatcher.lock().await = Some(dispatcher);

        info!(local_addr=?manager.local_addr(), is_host=manager.is_host(), "game session opened");
        Ok(api)
    }

    /// Stops the session and awaits termination of event dispatching. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // stopping the session ends the stream of session events, terminating the dispatcher
        self.manager.stop().await;
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            if let Err(e) = dispatcher.await {
                warn!("event dispatcher failed: {}", e);
            }
        }

        self.directory.clear().await;
        self.events.close();
        info!(local_addr=?self.manager.local_addr(), "game session closed");
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<GameEvent> {
        self.events.subscribe()
    }

    pub fn manager(&self) -> &Arc<P2pManager> {
        &self.manager
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.manager.local_addr()
    }

    pub fn port(&self) -> u16 {
        self.manager.local_addr().port()
    }

    pub fn is_host(&self) -> bool {
        self.manager.is_host()
    }

    pub fn bomb_time_millis(&self) -> i32 {
        self.manager.config().bomb_time_millis
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.directory.snapshot().await
    }

    pub async fn peer_count(&self) -> usize {
        self.directory.len().await
    }

    pub async fn is_full(&self) -> bool {
        self.directory.len().await >= self.peer_capacity
    }

    pub async fn get_random_peer(&self) -> Option<SocketAddr> {
        self.directory.random_peer().await
    }

    pub async fn remove_peer(&self, peer: SocketAddr) -> bool {
        self.directory.remove(peer).await
    }

    /// Greets the peer, then asks to join its game. On success the peer is added locally.
    pub async fn do_join_game(&self, peer: SocketAddr) -> Result<(), GameError> {
        self.perform(Request::Join, peer).await?;
        self.directory.add(peer).await;
        Ok(())
    }

    /// Quits the peer's game and says farewell. On success the local directory is cleared.
    pub async fn do_leave_game(&self, peer: SocketAddr) -> Result<(), GameError> {
        self.perform(Request::Leave, peer).await?;
        self.directory.clear().await;
        Ok(())
    }

    pub async fn do_request_peer_list(&self, peer: SocketAddr) -> Result<(), GameError> {
        self.perform(Request::RequestPeerList, peer).await
    }

    pub async fn do_start_game(&self, peer: SocketAddr, bomb_time: i32) -> Result<(), GameError> {
        self.perform(Request::StartGame(bomb_time), peer).await
    }

    pub async fn do_send_bomb(&self, peer: SocketAddr, bomb_time: i32) -> Result<(), GameError> {
        self.perform(Request::SendBomb(bomb_time), peer).await
    }

    /// Tells every known peer that this peer lost, then leaves each of them
    pub async fn do_broadcast_lose(self: &Arc<Self>) -> BroadcastResult {
        let recipients = self.directory.snapshot().await;
        self.fan_out(recipients, Request::SendLose).await
    }

    /// Announces a newly joined peer to every other peer
    pub async fn do_broadcast_peer_joined(self: &Arc<Self>, joined_peer: SocketAddr) -> BroadcastResult {
        let recipients = self.directory.snapshot_except(joined_peer).await;
        self.fan_out(recipients, Request::AnnouncePeerJoined(joined_peer)).await
    }

    /// Announces a peer that quit to every remaining peer
    pub async fn broadcast_peer_quit(self: &Arc<Self>, quit_peer: SocketAddr) -> BroadcastResult {
        let recipients = self.directory.snapshot_except(quit_peer).await;
        self.fan_out(recipients, Request::AnnouncePeerQuit(quit_peer)).await
    }

    async fn send_peer_list(&self, requester: SocketAddr) -> Result<(), GameError> {
        let peers = self.directory.snapshot_except(requester).await;
        debug!(?requester, ?peers, "sending peer list");
        self.perform(Request::SendPeerList(peers), requester).await
    }

    /// Sends to all recipients concurrently. The recipients are a snapshot, so directory changes
    ///  while the broadcast is running do not affect it.
    async fn fan_out(self: &Arc<Self>, recipients: Vec<SocketAddr>, request: Request) -> BroadcastResult {
        let tasks = recipients.into_iter()
            .map(|peer| {
                let api = self.clone();
                let request = request.clone();
                (peer, tokio::spawn(async move {
                    api.deliver_broadcast(request, peer).await
                }))
            })
            .collect::<Vec<_>>();

        let mut results = Vec::with_capacity(tasks.len());
        for (peer, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            };
            results.push((peer, result));
        }
        results
    }

    async fn deliver_broadcast(&self, request: Request, peer: SocketAddr) -> Result<(), GameError> {
        let is_lose = matches!(request, Request::SendLose);
        self.perform(request, peer).await?;
        if is_lose {
            self.do_leave_game(peer).await?;
        }
        Ok(())
    }

    /// Runs a request, re-issuing it after timeouts as configured. A final failure is reported
    ///  as an event in addition to being returned.
    async fn perform(&self, request: Request, peer: SocketAddr) -> Result<(), GameError> {
        let operation = request.operation();
        let mut num_retries = 0;
        loop {
            match self.attempt(&request, peer).await {
                Ok(()) => return Ok(()),
                Err(GameError::Timeout { .. }) if num_retries < self.operation_retries => {
                    num_retries += 1;
                    debug!(?operation, ?peer, num_retries, "operation timed out - retrying");
                }
                Err(e) => {
                    warn!(?operation, ?peer, "operation failed: {}", e);
                    self.events.send_event(GameEvent::OperationFailed { operation, peer });
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self, request: &Request, peer: SocketAddr) -> Result<(), GameError> {
        let operation = request.operation();

        if let Request::Join = request {
            self.await_delivery(operation, peer, self.manager.greet(peer).await).await?;
        }

        let payload = request.app_message().ser()?;
        self.await_delivery(operation, peer, self.manager.send(peer, payload).await).await?;

        if let Request::Leave = request {
            self.await_delivery(operation, peer, self.manager.farewell(peer).await).await?;
        }
        Ok(())
    }

    async fn await_delivery(&self, operation: Operation, peer: SocketAddr, sent: Result<Receipt, MessengerError>) -> Result<(), GameError> {
        let receipt = match sent {
            Ok(receipt) => receipt,
            Err(MessengerError::TransportClosed) => return Err(GameError::Closed),
            Err(MessengerError::Transport(cause)) => return Err(GameError::Transport { operation, peer, cause }),
        };
        self.packets_sent.fetch_add(1, Ordering::Relaxed);

        match receipt.outcome().await {
            SendOutcome::Delivered(_) => {
                self.packets_received.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            SendOutcome::TimedOut => Err(GameError::Timeout { operation, peer }),
            SendOutcome::Abandoned => Err(GameError::Closed),
        }
    }

    async fn dispatch(self: Arc<Self>, mut session_events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(evt) = session_events.recv().await {
            match evt {
                SessionEvent::MessageReceived(data) => {
                    self.packets_received.fetch_add(1, Ordering::Relaxed);
                    self.on_message_received(data.peer, &data.payload).await;
                }
                SessionEvent::PeerGreets(_) | SessionEvent::PeerFarewells(_) => {
                    self.packets_received.fetch_add(1, Ordering::Relaxed);
                }
                SessionEvent::SocketDied => {
                    self.events.send_event(GameEvent::SocketDied);
                }
                // outcomes of our own sends are correlated through their receipts
                _ => {}
            }
        }
        debug!("session event stream ended");
    }

    async fn on_message_received(self: &Arc<Self>, sender: SocketAddr, payload: &[u8]) {
        let msg = match AppMessage::try_deser(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(?sender, "dropping application message: {}", e);
                return;
            }
        };
        debug!(?sender, ?msg, "received application message");

        match msg {
            AppMessage::Join => {
                self.directory.add(sender).await;
                self.events.send_event(GameEvent::PeerJoined(sender));
            }
            AppMessage::Quit => {
                self.directory.remove(sender).await;
                self.events.send_event(GameEvent::PeerLeft(sender));
            }
            AppMessage::ListPeers => {
                // replying waits for an ack, which must not block dispatching
                let api = self.clone();
                tokio::spawn(async move {
                    let _ = api.send_peer_list(sender).await;
                });
            }
            AppMessage::Peers(peers) => {
                let myself = self.local_addr();
                let peers = peers.into_iter()
                    .filter(|p| *p != myself)
                    .collect::<Vec<_>>();
                self.directory.merge(&peers).await;
                self.events.send_event(GameEvent::PeerListReceived(peers));
            }
            AppMessage::PeerJoined(peer) => {
                if peer != self.local_addr() {
                    self.directory.add(peer).await;
                    self.events.send_event(GameEvent::PeerJoined(peer));
                }
            }
            AppMessage::PeerQuit(peer) => {
                self.directory.remove(peer).await;
                self.events.send_event(GameEvent::PeerLeft(peer));
            }
            AppMessage::Start { bomb_time } => {
                self.events.send_event(GameEvent::GameStarts { bomb_time });
            }
            AppMessage::PassBomb { bomb_time, .. } => {
                self.events.send_event(GameEvent::BombReceived { from: sender, bomb_time });
            }
            AppMessage::Lose { .. } => {
                self.directory.remove(sender).await;
                self.events.send_event(GameEvent::PeerLost(sender));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use rstest::rstest;
    use tokio::runtime::Builder;

    use crate::messaging::envelope::{Envelope, MessageKind};
    use crate::messaging::transport::MessageHandler;
    use crate::test_util::peers::test_peer;
    use crate::test_util::transport::TrackingTransport;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    async fn api_with_retries(operation_retries: u32) -> (Arc<P2pApi>, Arc<TrackingTransport>) {
        let transport = Arc::new(TrackingTransport::new(test_peer(1)));
        let mut config = P2pConfig::new(test_peer(1));
        config.ack_timeout = TIMEOUT;
        config.operation_retries = operation_retries;
        config.peer_capacity = 2;

        let manager = P2pManager::with_transport(Arc::new(config), false, transport.clone()).unwrap();
        let api = P2pApi::open(Arc::new(manager)).await.unwrap();
        (api, transport)
    }

    async fn api() -> (Arc<P2pApi>, Arc<TrackingTransport>) {
        api_with_retries(0).await
    }

    async fn inject(api: &P2pApi, from: SocketAddr, msg: AppMessage) {
        let envelope = Envelope::new(MessageKind::Data, 1_000_000, msg.ser().unwrap());
        api.manager.messenger().handle_message(&envelope.to_bytes(), from).await;
    }

    async fn inject_raw(api: &P2pApi, from: SocketAddr, payload: &'static [u8]) {
        let envelope = Envelope::new(MessageKind::Data, 1_000_001, Bytes::from_static(payload));
        api.manager.messenger().handle_message(&envelope.to_bytes(), from).await;
    }

    async fn ack(api: &P2pApi, to: SocketAddr, envelope: &Envelope) {
        api.manager.messenger().handle_message(&envelope.ack().to_bytes(), to).await;
    }

    fn app_message(envelope: &Envelope) -> AppMessage {
        assert_eq!(envelope.kind, MessageKind::Data);
        AppMessage::try_deser(&envelope.payload).unwrap()
    }

    #[tokio::test]
    async fn test_join_game() {
        let (api, transport) = api().await;

        let join = {
            let api = api.clone();
            tokio::spawn(async move { api.do_join_game(test_peer(2)).await })
        };

        let (to, greet) = transport.wait_for_sent(1).await.remove(0);
        assert_eq!(to, test_peer(2));
        assert_eq!(greet.kind, MessageKind::Greet);
        assert!(api.peers().await.is_empty());
        ack(&api, test_peer(2), &greet).await;

        let (to, join_msg) = transport.wait_for_sent(1).await.remove(0);
        assert_eq!(to, test_peer(2));
        assert_eq!(app_message(&join_msg), AppMessage::Join);
        ack(&api, test_peer(2), &join_msg).await;

        join.await.unwrap().unwrap();
        assert_eq!(api.peers().await, vec![test_peer(2)]);
        assert_eq!(api.packets_sent(), 2);
        assert_eq!(api.packets_received(), 2);

        api.close().await;
    }

    #[tokio::test]
    async fn test_leave_game() {
        let (api, transport) = api().await;
        let mut events = api.subscribe();
        inject(&api, test_peer(2), AppMessage::Join).await;
        inject(&api, test_peer(3), AppMessage::Join).await;
        assert_eq!(events.recv().await, Some(GameEvent::PeerJoined(test_peer(2))));
        assert_eq!(events.recv().await, Some(GameEvent::PeerJoined(test_peer(3))));
        assert_eq!(api.peers().await, vec![test_peer(2), test_peer(3)]);
        transport.take_sent();

        let leave = {
            let api = api.clone();
            tokio::spawn(async move { api.do_leave_game(test_peer(2)).await })
        };

        let (_, quit) = transport.wait_for_sent(1).await.remove(0);
        assert_eq!(app_message(&quit), AppMessage::Quit);
        ack(&api, test_peer(2), &quit).await;

        let (_, farewell) = transport.wait_for_sent(1).await.remove(0);
        assert_eq!(farewell.kind, MessageKind::Farewell);
        ack(&api, test_peer(2), &farewell).await;

        leave.await.unwrap().unwrap();
        assert!(api.peers().await.is_empty());

        api.close().await;
    }

    #[rstest]
    #[case::join(AppMessage::Join, vec![test_peer(6), test_peer(5)], Some(GameEvent::PeerJoined(test_peer(5))))]
    #[case::quit(AppMessage::Quit, vec![test_peer(6)], Some(GameEvent::PeerLeft(test_peer(5))))]
    #[case::peer_joined(AppMessage::PeerJoined(test_peer(7)), vec![test_peer(6), test_peer(7)], Some(GameEvent::PeerJoined(test_peer(7))))]
    #[case::peer_joined_myself(AppMessage::PeerJoined(test_peer(1)), vec![test_peer(6)], None)]
    #[case::peer_quit(AppMessage::PeerQuit(test_peer(6)), vec![], Some(GameEvent::PeerLeft(test_peer(6))))]
    #[case::peers(AppMessage::Peers(vec![test_peer(6), test_peer(7), test_peer(1)]), vec![test_peer(6), test_peer(7)], Some(GameEvent::PeerListReceived(vec![test_peer(6), test_peer(7)])))]
    #[case::start(AppMessage::Start { bomb_time: 5000 }, vec![test_peer(6)], Some(GameEvent::GameStarts { bomb_time: 5000 }))]
    #[case::pass_bomb(AppMessage::PassBomb { bomb_time: 4321, status: GameStatus::Running }, vec![test_peer(6)], Some(GameEvent::BombReceived { from: test_peer(5), bomb_time: 4321 }))]
    #[case::lose(AppMessage::Lose { status: GameStatus::Ended }, vec![test_peer(6)], Some(GameEvent::PeerLost(test_peer(5))))]
    fn test_incoming(#[case] msg: AppMessage, #[case] expected_peers: Vec<SocketAddr>, #[case] expected_event: Option<GameEvent>) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let (api, transport) = api().await;
            // peer 6 is known initially
            api.directory.add(test_peer(6)).await;
            let mut events = api.subscribe();

            inject(&api, test_peer(5), msg).await;
            // the message is acknowledged in any case
            assert_eq!(transport.take_sent().len(), 1);

            // a marker message to know that the message under test was dispatched
            inject(&api, test_peer(9), AppMessage::Start { bomb_time: -1 }).await;
            let mut actual_events = Vec::new();
            loop {
                match events.recv().await.unwrap() {
                    GameEvent::GameStarts { bomb_time: -1 } => break,
                    evt => actual_events.push(evt),
                }
            }

            assert_eq!(actual_events, expected_event.into_iter().collect::<Vec<_>>());
            assert_eq!(api.peers().await, expected_peers);

            api.close().await;
        });
    }

    #[rstest]
    #[case::not_json(b"hello".as_slice())]
    #[case::unknown_kind(br#"{"msg":42}"#.as_slice())]
    #[case::missing_bombtime(br#"{"msg":1,"data":{}}"#.as_slice())]
    #[case::wrong_shape(br#"{"msg":7,"data":[1]}"#.as_slice())]
    fn test_invalid_application_message_is_dropped(#[case] payload: &'static [u8]) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let (api, _transport) = api().await;
            let mut events = api.subscribe();

            inject_raw(&api, test_peer(5), payload).await;
            inject(&api, test_peer(9), AppMessage::Start { bomb_time: -1 }).await;

            assert_eq!(events.recv().await, Some(GameEvent::GameStarts { bomb_time: -1 }));
            assert!(api.peers().await.is_empty());

            api.close().await;
        });
    }

    #[tokio::test]
    async fn test_list_peers_reply_excludes_requester() {
        let (api, transport) = api().await;
        api.directory.merge(&[test_peer(2), test_peer(3), test_peer(4)]).await;

        inject(&api, test_peer(3), AppMessage::ListPeers).await;

        // the ack for LIST_PEERS and the PEERS reply
        let sent = transport.wait_for_sent(2).await;
        let (to, reply) = sent.iter()
            .find(|(_, e)| !e.is_ack)
            .unwrap();
        assert_eq!(*to, test_peer(3));
        assert_eq!(app_message(reply), AppMessage::Peers(vec![test_peer(2), test_peer(4)]));

        api.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_bomb_timeout() {
        let (api, transport) = api().await;
        let mut events = api.subscribe();

        let result = api.do_send_bomb(test_peer(2), 5000).await;
        assert!(matches!(result, Err(GameError::Timeout { operation: Operation::SendBomb, peer }) if peer == test_peer(2)));
        assert_eq!(events.recv().await, Some(GameEvent::OperationFailed { operation: Operation::SendBomb, peer: test_peer(2) }));
        assert_eq!(api.manager.messenger().num_pending().await, 0);

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(app_message(&sent[0].1), AppMessage::PassBomb { bomb_time: 5000, status: GameStatus::Running });

        api.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_timeout() {
        let (api, transport) = api_with_retries(1).await;
        let mut events = api.subscribe();

        let start = {
            let api = api.clone();
            tokio::spawn(async move { api.do_start_game(test_peer(2), 3000).await })
        };

        let (_, first) = transport.wait_for_sent(1).await.remove(0);
        let (_, second) = transport.wait_for_sent(1).await.remove(0);
        assert_ne!(first.id, second.id);
        assert_eq!(app_message(&second), AppMessage::Start { bomb_time: 3000 });
        ack(&api, test_peer(2), &second).await;

        start.await.unwrap().unwrap();

        api.close().await;
        // no failure was reported before the stream ended
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let (api, transport) = api_with_retries(2).await;

        let result = api.do_request_peer_list(test_peer(2)).await;
        assert!(matches!(result, Err(GameError::Timeout { operation: Operation::RequestPeerList, .. })));
        assert_eq!(transport.take_sent().len(), 3);

        api.close().await;
    }

    #[tokio::test]
    async fn test_broadcast_peer_quit() {
        let (api, transport) = api().await;
        api.directory.merge(&[test_peer(2), test_peer(3), test_peer(4)]).await;

        let broadcast = {
            let api = api.clone();
            tokio::spawn(async move { api.broadcast_peer_quit(test_peer(3)).await })
        };

        let sent = transport.wait_for_sent(2).await;
        let mut recipients = sent.iter().map(|(to, _)| *to).collect::<Vec<_>>();
        recipients.sort();
        assert_eq!(recipients, vec![test_peer(2), test_peer(4)]);
        for (to, envelope) in &sent {
            assert_eq!(app_message(envelope), AppMessage::PeerQuit(test_peer(3)));
            ack(&api, *to, envelope).await;
        }

        let results = broadcast.await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().map(|(p, _)| *p).collect::<Vec<_>>(), vec![test_peer(2), test_peer(4)]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(transport.take_sent().is_empty());

        api.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_reports_one_outcome_per_peer() {
        let (api, transport) = api().await;
        api.directory.merge(&[test_peer(2), test_peer(3)]).await;

        let broadcast = {
            let api = api.clone();
            tokio::spawn(async move { api.do_broadcast_peer_joined(test_peer(7)).await })
        };

        // only peer 3 acknowledges
        for (to, envelope) in transport.wait_for_sent(2).await {
            assert_eq!(app_message(&envelope), AppMessage::PeerJoined(test_peer(7)));
            if to == test_peer(3) {
                ack(&api, to, &envelope).await;
            }
        }

        let results = broadcast.await.unwrap();
        assert!(matches!(results[0], (p, Err(GameError::Timeout { operation: Operation::PeerJoined, .. })) if p == test_peer(2)));
        assert!(matches!(results[1], (p, Ok(())) if p == test_peer(3)));

        api.close().await;
    }

    #[tokio::test]
    async fn test_broadcast_lose_then_leave() {
        let (api, transport) = api().await;
        api.directory.add(test_peer(2)).await;

        let broadcast = {
            let api = api.clone();
            tokio::spawn(async move { api.do_broadcast_lose().await })
        };

        let (_, lose) = transport.wait_for_sent(1).await.remove(0);
        assert_eq!(app_message(&lose), AppMessage::Lose { status: GameStatus::Ended });
        ack(&api, test_peer(2), &lose).await;

        let (_, quit) = transport.wait_for_sent(1).await.remove(0);
        assert_eq!(app_message(&quit), AppMessage::Quit);
        ack(&api, test_peer(2), &quit).await;

        let (_, farewell) = transport.wait_for_sent(1).await.remove(0);
        assert_eq!(farewell.kind, MessageKind::Farewell);
        ack(&api, test_peer(2), &farewell).await;

        let results = broadcast.await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        assert!(api.peers().await.is_empty());

        api.close().await;
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_directory() {
        let (api, transport) = api().await;
        assert!(api.do_broadcast_lose().await.is_empty());
        assert!(transport.take_sent().is_empty());
        api.close().await;
    }

    #[tokio::test]
    async fn test_is_full() {
        let (api, _transport) = api().await;
        assert!(!api.is_full().await);
        api.directory.merge(&[test_peer(2), test_peer(3)]).await;
        assert!(api.is_full().await);
        assert!(api.remove_peer(test_peer(2)).await);
        assert!(!api.is_full().await);
        api.close().await;
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let (api, _transport) = api().await;
        api.close().await;
        api.close().await;

        assert!(matches!(api.do_join_game(test_peer(2)).await, Err(GameError::Closed)));
        assert!(api.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_resolves_operation_in_flight() {
        let (api, transport) = api().await;

        let bomb = {
            let api = api.clone();
            tokio::spawn(async move { api.do_send_bomb(test_peer(2), 5000).await })
        };
        transport.wait_for_sent(1).await;

        api.close().await;
        drop(api);

        let result = tokio::time::timeout(Duration::from_secs(1), bomb).await
            .expect("operation still pending after close")
            .unwrap();
        assert!(matches!(result, Err(GameError::Closed)));
    }

    #[tokio::test]
    async fn test_socket_died_is_republished() {
        let (api, transport) = api().await;
        let mut events = api.subscribe();

        transport.die();
        assert_eq!(tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap(), Some(GameEvent::SocketDied));

        api.close().await;
    }

    #[tokio::test]
    async fn test_transport_error_fails_operation() {
        let (api, transport) = api().await;
        let mut events = api.subscribe();
        transport.set_fail_sends(true);

        assert!(matches!(api.do_start_game(test_peer(2), 1).await, Err(GameError::Transport { operation: Operation::StartGame, .. })));
        assert_eq!(events.recv().await, Some(GameEvent::OperationFailed { operation: Operation::StartGame, peer: test_peer(2) }));

        api.close().await;
    }
}
