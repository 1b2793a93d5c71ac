use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::messaging::envelope::{Envelope, MessageKind};
use crate::messaging::transport::{MessageHandler, Transport};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// message ids are unique for the lifetime of the process
fn next_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("messenger is closed")]
    TransportClosed,
    #[error("transport error: {0}")]
    Transport(anyhow::Error),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    /// the peer acknowledged, passing the ack's payload
    Delivered(Bytes),
    TimedOut,
    /// the messenger was closed or dropped before the send was resolved
    Abandoned,
}

/// Handle for a single tracked send, resolving exactly once
pub struct Receipt {
    pub id: u64,
    pub peer: SocketAddr,
    outcome: oneshot::Receiver<SendOutcome>,
}
impl Debug for Receipt {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Receipt{{#{} to {:?}}}", self.id, self.peer)
    }
}
impl Receipt {
    pub async fn outcome(self) -> SendOutcome {
        self.outcome.await
            .unwrap_or(SendOutcome::Abandoned)
    }
}

/// Callbacks for everything that happens in a [Messenger]. They are called from the receive
///  loop and from the watchdog, potentially concurrently.
#[cfg_attr(test, automock)]
pub trait MessengerListener: Send + Sync {
    /// a peer sent a (non-ack) message - it was acknowledged already
    fn on_received(&self, kind: MessageKind, peer: SocketAddr, id: u64, payload: Bytes);
    fn on_delivered(&self, kind: MessageKind, peer: SocketAddr, id: u64, payload: Bytes);
    /// the payload that was sent
    fn on_failed(&self, kind: MessageKind, peer: SocketAddr, id: u64, payload: Bytes);
}

struct PendingSend {
    peer: SocketAddr,
    sent_at: Instant,
    envelope: Envelope,
    completion: oneshot::Sender<SendOutcome>,
}

/// Turns best-effort datagrams into sends with a definite outcome: every tracked send is
///  resolved exactly once, either by a matching ack or by the watchdog after the ack timeout.
pub struct Messenger {
    transport: Arc<dyn Transport>,
    listener: Arc<dyn MessengerListener>,
    ack_timeout: Duration,
    pending: Mutex<FxHashMap<u64, PendingSend>>,
    closed: AtomicBool,
}

impl Messenger {
    pub fn new(transport: Arc<dyn Transport>, listener: Arc<dyn MessengerListener>, ack_timeout: Duration) -> Messenger {
        Messenger {
            transport,
            listener,
            ack_timeout,
            pending: Default::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn greet(&self, peer: SocketAddr) -> Result<Receipt, MessengerError> {
        self.send_tracked(peer, MessageKind::Greet, Bytes::new()).await
    }

    pub async fn farewell(&self, peer: SocketAddr) -> Result<Receipt, MessengerError> {
        self.send_tracked(peer, MessageKind::Farewell, Bytes::new()).await
    }

    pub async fn ping(&self, peer: SocketAddr) -> Result<Receipt, MessengerError> {
        self.send_tracked(peer, MessageKind::Ping, Bytes::new()).await
    }

    pub async fn send_data(&self, peer: SocketAddr, payload: Bytes) -> Result<Receipt, MessengerError> {
        self.send_tracked(peer, MessageKind::Data, payload).await
    }

    async fn send_tracked(&self, peer: SocketAddr, kind: MessageKind, payload: Bytes) -> Result<Receipt, MessengerError> {
        if self.is_closed() {
            return Err(MessengerError::TransportClosed);
        }

        let id = next_message_id();
        let envelope = Envelope::new(kind, id, payload);
        let buf = envelope.to_bytes();
        let (completion, outcome) = oneshot::channel();

        // NB: registered before sending so that even an immediate ack finds its entry
        {
            let mut pending = self.pending.lock().await;
            // re-checked under the lock: abandon_pending() must not miss a concurrent registration
            if self.is_closed() {
                return Err(MessengerError::TransportClosed);
            }
            pending.insert(id, PendingSend {
                peer,
                sent_at: Instant::now(),
                envelope,
                completion,
            });
        }

        trace!(?peer, ?kind, id, "sending tracked message");
        if let Err(e) = self.transport.send(peer, &buf).await {
            self.pending.lock().await
                .remove(&id);
            return Err(MessengerError::Transport(e));
        }

        Ok(Receipt {
            id,
            peer,
            outcome,
        })
    }

    pub async fn num_pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves all pending sends as [SendOutcome::Abandoned] without notifying the listener,
    ///  returning their number. Call after [Messenger::close] so no new sends are registered.
    pub async fn abandon_pending(&self) -> usize {
        let abandoned = std::mem::take(&mut *self.pending.lock().await);
        for p in abandoned.values() {
            debug!(peer=?p.peer, kind=?p.envelope.kind, id=p.envelope.id, "abandoning pending message");
        }
        let num_abandoned = abandoned.len();
        for (_, p) in abandoned {
            let _ = p.completion.send(SendOutcome::Abandoned);
        }
        num_abandoned
    }

    /// Removes and fails all pending sends that were sent `ack_timeout` or more before `now`,
    ///  returning the number of failed sends
    pub async fn fail_expired(&self, now: Instant) -> usize {
        let expired = {
            let mut pending = self.pending.lock().await;
            let expired_ids = pending.iter()
                .filter(|(_, p)| now.saturating_duration_since(p.sent_at) >= self.ack_timeout)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            expired_ids.into_iter()
                .flat_map(|id| pending.remove(&id))
                .collect::<Vec<_>>()
        };

        let num_expired = expired.len();
        for p in expired {
            warn!(peer=?p.peer, kind=?p.envelope.kind, id=p.envelope.id, "message was not acknowledged in time");
            let _ = p.completion.send(SendOutcome::TimedOut);
            self.listener.on_failed(p.envelope.kind, p.peer, p.envelope.id, p.envelope.payload);
        }
        num_expired
    }

    /// Periodically fails expired pending sends until a cancel signal is received
    pub async fn run_watchdog(&self, interval: Duration, mut cancel: broadcast::Receiver<()>) {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(?interval, ack_timeout=?self.ack_timeout, "starting watchdog");
        loop {
            select! {
                _ = ticks.tick() => {
                    self.fail_expired(Instant::now()).await;
                }
                _ = cancel.recv() => break,
            }
        }
        debug!("watchdog terminated");
    }

    async fn on_ack(&self, sender: SocketAddr, ack: Envelope) {
        let resolved = {
            let mut pending = self.pending.lock().await;
            let is_match = pending.get(&ack.id)
                .map(|p| p.peer == sender && p.envelope.kind == ack.kind);
            match is_match {
                Some(true) => pending.remove(&ack.id),
                Some(false) => {
                    debug!(?sender, id=ack.id, "ack does not match pending message - ignoring");
                    None
                }
                None => {
                    debug!(?sender, id=ack.id, "ack for unknown or already resolved message - ignoring");
                    None
                }
            }
        };

        if let Some(p) = resolved {
            trace!(?sender, kind=?ack.kind, id=ack.id, "message acknowledged");
            let _ = p.completion.send(SendOutcome::Delivered(ack.payload.clone()));
            self.listener.on_delivered(ack.kind, sender, ack.id, ack.payload);
        }
    }

    async fn on_message(&self, sender: SocketAddr, envelope: Envelope) {
        let ack = envelope.ack().to_bytes();
        if let Err(e) = self.transport.send(sender, &ack).await {
            warn!(?sender, id=envelope.id, error=%e, "failed to acknowledge message - dropping it");
            return;
        }

        self.listener.on_received(envelope.kind, sender, envelope.id, envelope.payload);
    }
}

#[async_trait::async_trait]
impl MessageHandler for Messenger {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr) {
        let envelope = match Envelope::try_deser(buf) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(?sender, len=buf.len(), "dropping datagram: {}", e);
                return;
            }
        };

        trace!(?sender, ?envelope, "received");

        if envelope.is_ack {
            self.on_ack(sender, envelope).await;
        }
        else {
            self.on_message(sender, envelope).await;
        }
    }
}
