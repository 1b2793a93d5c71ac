use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use crate::messaging::transport::{MessageHandler, Transport};

pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// A single UDP socket that is used both for sending and in the receive loop.
pub struct UdpTransport {
    local_addr: SocketAddr,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    closed: AtomicBool,
    cancel_sender: broadcast::Sender<()>,
}
impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (cancel_sender, _) = broadcast::channel(1);

        debug!(?local_addr, "bound UDP socket");

        Ok(UdpTransport {
            local_addr,
            socket: Mutex::new(Some(Arc::new(socket))),
            closed: AtomicBool::new(false),
            cancel_sender,
        })
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        match self.socket.lock() {
            Ok(socket) => socket.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn release_socket(&self) -> Option<Arc<UdpSocket>> {
        match self.socket.lock() {
            Ok(mut socket) => socket.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// errors reported for a previous datagram to an unreachable peer (ICMP), which do not affect
///  the socket's usability
fn is_transient(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::Interrupted)
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        let socket = match self.socket() {
            Some(socket) => socket,
            None => {
                debug!(?to, "transport is closed - dropping outgoing datagram");
                return Ok(());
            }
        };

        trace!(from=?self.local_addr, ?to, len=buf.len(), "sending datagram");
        match socket.send_to(buf, to).await {
            Ok(_) => Ok(()),
            Err(e) if self.is_closed() => {
                debug!(?to, error=?e, "send failed while shutting down");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        // NB: subscribe before checking for 'closed' so a concurrent close() can not slip in between
        let mut cancel_receiver = self.cancel_sender.subscribe();
        let socket = match self.socket() {
            Some(socket) if !self.is_closed() => socket,
            _ => return Ok(()),
        };

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        trace!(local_addr=?self.local_addr, "starting UDP receive loop");

        loop {
            tokio::select! {
                r = socket.recv_from(&mut buf) => {
                    match r {
                        Ok((0, from)) => {
                            trace!(?from, "skipping empty datagram");
                        }
                        Ok((len, from)) if len == buf.len() => {
                            warn!(?from, "datagram exceeds the receive buffer - skipping");
                        }
                        Ok((len, from)) => {
                            trace!(?from, len, "received datagram");
                            let data = Bytes::copy_from_slice(&buf[..len]);
                            let handler = handler.clone();
                            // the handler runs in a separate task, so a panic is contained to a single datagram
                            let handled = tokio::spawn(async move {
                                handler.handle_message(&data, from).await
                            }).await;
                            if let Err(e) = handled {
                                error!(?from, error=?e, "message handler failed");
                            }
                        }
                        Err(_) if self.is_closed() => break,
                        Err(e) if is_transient(&e) => {
                            debug!(error=?e, "transient socket error - continuing");
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        trace!(local_addr=?self.local_addr, "UDP receive loop terminated");
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(local_addr=?self.local_addr, "closing UDP transport");

        drop(self.release_socket());
        // no receivers means no running receive loop
        let _ = self.cancel_sender.send(());
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
