use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::P2pConfig;
use crate::messaging::messenger::{Messenger, MessengerError, Receipt};
use crate::messaging::transport::udp::UdpTransport;
use crate::messaging::transport::{MessageHandler, Transport};
use crate::session::session_events::SessionEvent;
use crate::util::event_notifier::EventNotifier;

enum Lifecycle {
    Created,
    Running {
        receive_loop: JoinHandle<()>,
        watchdog: JoinHandle<()>,
    },
    Stopped,
}

/// A session on a single local port: a [Transport] and a [Messenger] on top of it, with
///  the messenger's callbacks republished as [SessionEvent]s.
pub struct P2pManager {
    config: Arc<P2pConfig>,
    is_host: bool,
    local_addr: SocketAddr,
    transport: Arc<dyn Transport>,
    messenger: Arc<Messenger>,
    events: Arc<EventNotifier<SessionEvent>>,
    watchdog_cancel: broadcast::Sender<()>,
    lifecycle: Mutex<Lifecycle>,
}

impl P2pManager {
    pub async fn bind(config: Arc<P2pConfig>, is_host: bool) -> anyhow::Result<P2pManager> {
        config.validate()?;
        let transport = UdpTransport::bind(config.bind_addr).await?;
        Self::with_transport(config, is_host, Arc::new(transport))
    }

    pub fn with_transport(config: Arc<P2pConfig>, is_host: bool, transport: Arc<dyn Transport>) -> anyhow::Result<P2pManager> {
        config.validate()?;
        let local_addr = transport.local_addr()?;
        let events = Arc::new(EventNotifier::new());
        let messenger = Arc::new(Messenger::new(transport.clone(), events.clone(), config.ack_timeout));
        let (watchdog_cancel, _) = broadcast::channel(1);

        Ok(P2pManager {
            config,
            is_host,
            local_addr,
            transport,
            messenger,
            events,
            watchdog_cancel,
            lifecycle: Mutex::new(Lifecycle::Created),
        })
    }

    pub fn config(&self) -> &P2pConfig {
        &self.config
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Spawns the receive loop and the watchdog. A session can be started only once.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Created) {
            anyhow::bail!("session on {} was started before", self.local_addr);
        }

        let receive_loop = {
            let transport = self.transport.clone();
            let handler: Arc<dyn MessageHandler> = self.messenger.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.recv_loop(handler).await {
                    error!("receive loop terminated: {}", e);
                    events.send_event(SessionEvent::SocketDied);
                }
            })
        };

        let watchdog = {
            let messenger = self.messenger.clone();
            let interval = self.config.watchdog_interval;
            let cancel = self.watchdog_cancel.subscribe();
            tokio::spawn(async move {
                messenger.run_watchdog(interval, cancel).await
            })
        };

        *lifecycle = Lifecycle::Running { receive_loop, watchdog };
        info!(local_addr=?self.local_addr, is_host=self.is_host, "session started");
        Ok(())
    }

    /// Stops the watchdog, resolves all pending sends as abandoned, then closes the transport.
    ///  Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Stopped => return,
            Lifecycle::Created => {
                self.messenger.close();
                self.messenger.abandon_pending().await;
                self.transport.close();
            }
            Lifecycle::Running { receive_loop, watchdog } => {
                // no receiver means the watchdog is gone already
                let _ = self.watchdog_cancel.send(());
                if let Err(e) = watchdog.await {
                    warn!("watchdog failed: {}", e);
                }

                self.messenger.close();
                let num_abandoned = self.messenger.abandon_pending().await;
                if num_abandoned > 0 {
                    debug!(num_abandoned, "abandoned pending sends on stop");
                }
                self.transport.close();
                if let Err(e) = receive_loop.await {
                    warn!("receive loop failed: {}", e);
                }
            }
        }

        self.events.close();
        info!(local_addr=?self.local_addr, "session stopped");
    }

    pub async fn greet(&self, peer: SocketAddr) -> Result<Receipt, MessengerError> {
        self.messenger.greet(peer).await
    }

    pub async fn farewell(&self, peer: SocketAddr) -> Result<Receipt, MessengerError> {
        self.messenger.farewell(peer).await
    }

    pub async fn ping(&self, peer: SocketAddr) -> Result<Receipt, MessengerError> {
        self.messenger.ping(peer).await
    }

    pub async fn send(&self, peer: SocketAddr, payload: Bytes) -> Result<Receipt, MessengerError> {
        self.messenger.send_data(peer, payload).await
    }
}
