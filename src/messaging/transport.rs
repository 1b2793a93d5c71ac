pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

/// Best-effort datagram delivery. Implementations never retry - retry and timeout handling is
///  the [crate::messaging::messenger::Messenger]'s job.
#[async_trait::async_trait]
pub trait Transport : Sync + Send {
    fn local_addr(&self) -> anyhow::Result<SocketAddr>;

    /// Errors after [Transport::close] are swallowed, all other errors are propagated.
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    /// Runs until the transport is closed (returning `Ok`) or the socket fails (returning `Err`).
    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()>;

    /// idempotent
    fn close(&self);

    fn is_closed(&self) -> bool;
}


/// This trait decouples the transport from the handling of a message once it is received.
///
/// It is passed around as an `Arc<dyn ...>` to minimize dependencies of [Transport] implementations.
#[async_trait::async_trait]
pub trait MessageHandler : Sync + Send {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr);
}
