use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::messaging::envelope::Envelope;
use crate::messaging::transport::{MessageHandler, Transport};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum TransportState {
    Open,
    Closed,
    Died,
}

/// In-memory [Transport] that records everything that is sent. Incoming datagrams are injected
///  by calling the message handler directly.
pub struct TrackingTransport {
    myself: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Envelope)>>,
    fail_sends: AtomicBool,
    state: watch::Sender<TransportState>,
}
impl TrackingTransport {
    pub fn new(myself: SocketAddr) -> TrackingTransport {
        let (state, _) = watch::channel(TransportState::Open);
        TrackingTransport {
            myself,
            sent: Default::default(),
            fail_sends: AtomicBool::new(false),
            state,
        }
    }

    /// returns sent datagrams (sent datagrams are always well-formed envelopes), clearing the
    ///  internal buffer
    pub fn take_sent(&self) -> Vec<(SocketAddr, Envelope)> {
        let mut sent = self.sent.lock()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *sent)
    }

    /// waits until at least `n` datagrams were sent (e.g. by spawned tasks), then takes them
    pub async fn wait_for_sent(&self, n: usize) -> Vec<(SocketAddr, Envelope)> {
        loop {
            {
                let mut sent = self.sent.lock()
                    .unwrap_or_else(|e| e.into_inner());
                if sent.len() >= n {
                    return std::mem::take(&mut *sent);
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn set_fail_sends(&self, fail_sends: bool) {
        self.fail_sends.store(fail_sends, Ordering::SeqCst);
    }

    /// simulate a socket failure: a running receive loop terminates with an error
    pub fn die(&self) {
        self.state.send_replace(TransportState::Died);
    }
}

#[async_trait::async_trait]
impl Transport for TrackingTransport {
    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.myself)
    }

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("simulated send failure");
        }

        let envelope = Envelope::try_deser(buf)?;
        self.sent.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((to, envelope));
        Ok(())
    }

    async fn recv_loop(&self, _handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let mut state = self.state.subscribe();
        state.wait_for(|s| *s != TransportState::Open).await?;
        let final_state = *self.state.borrow();
        match final_state {
            TransportState::Died => anyhow::bail!("simulated socket failure"),
            _ => Ok(()),
        }
    }

    fn close(&self) {
        self.state.send_if_modified(|s| {
            if *s == TransportState::Open {
                *s = TransportState::Closed;
                true
            }
            else {
                false
            }
        });
    }

    fn is_closed(&self) -> bool {
        *self.state.borrow() != TransportState::Open
    }
}
