use std::net::SocketAddr;

use bytes::Bytes;
use tracing::trace;

use crate::messaging::envelope::MessageKind;
use crate::messaging::messenger::MessengerListener;
use crate::util::event_notifier::EventNotifier;

/// Coarse-grained events of a session. Events are produced by the receive loop and by the
///  watchdog, so consumers must not make assumptions about ordering between the two.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    PeerGreets(ConnectionData),
    GreetSucceeded(ConnectionData),
    GreetFailed(ConnectionData),
    PeerFarewells(ConnectionData),
    FarewellSucceeded(ConnectionData),
    FarewellFailed(ConnectionData),
    MessageReceived(ConnectionData),
    SendSucceeded(ConnectionData),
    /// carries the original payload
    SendFailed(ConnectionData),
    /// the socket failed irrecoverably, the session should be torn down
    SocketDied,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionData {
    pub peer: SocketAddr,
    pub id: u64,
    pub payload: Bytes,
}

impl MessengerListener for EventNotifier<SessionEvent> {
    fn on_received(&self, kind: MessageKind, peer: SocketAddr, id: u64, payload: Bytes) {
        let data = ConnectionData { peer, id, payload };
        match kind {
            MessageKind::Greet => self.send_event(SessionEvent::PeerGreets(data)),
            MessageKind::Farewell => self.send_event(SessionEvent::PeerFarewells(data)),
            MessageKind::Data => self.send_event(SessionEvent::MessageReceived(data)),
            MessageKind::Ping => trace!(?peer, id, "pinged"),
        }
    }

    fn on_delivered(&self, kind: MessageKind, peer: SocketAddr, id: u64, payload: Bytes) {
        let data = ConnectionData { peer, id, payload };
        match kind {
            MessageKind::Greet => self.send_event(SessionEvent::GreetSucceeded(data)),
            MessageKind::Farewell => self.send_event(SessionEvent::FarewellSucceeded(data)),
            MessageKind::Data => self.send_event(SessionEvent::SendSucceeded(data)),
            MessageKind::Ping => trace!(?peer, id, "ping acknowledged"),
        }
    }

    fn on_failed(&self, kind: MessageKind, peer: SocketAddr, id: u64, payload: Bytes) {
        let data = ConnectionData { peer, id, payload };
        match kind {
            MessageKind::Greet => self.send_event(SessionEvent::GreetFailed(data)),
            MessageKind::Farewell => self.send_event(SessionEvent::FarewellFailed(data)),
            MessageKind::Data => self.send_event(SessionEvent::SendFailed(data)),
            MessageKind::Ping => trace!(?peer, id, "ping timed out"),
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::test_util::peers::test_peer;

    use super::*;

    fn data(id: u64) -> ConnectionData {
        ConnectionData { peer: test_peer(1), id, payload: Bytes::from_static(b"p") }
    }

    #[rstest]
    #[case::greet(MessageKind::Greet, Some(SessionEvent::PeerGreets(data(1))), Some(SessionEvent::GreetSucceeded(data(1))), Some(SessionEvent::GreetFailed(data(1))))]
    #[case::farewell(MessageKind::Farewell, Some(SessionEvent::PeerFarewells(data(1))), Some(SessionEvent::FarewellSucceeded(data(1))), Some(SessionEvent::FarewellFailed(data(1))))]
    #[case::data(MessageKind::Data, Some(SessionEvent::MessageReceived(data(1))), Some(SessionEvent::SendSucceeded(data(1))), Some(SessionEvent::SendFailed(data(1))))]
    #[case::ping(MessageKind::Ping, None, None, None)]
    fn test_event_mapping(#[case] kind: MessageKind, #[case] received: Option<SessionEvent>, #[case] delivered: Option<SessionEvent>, #[case] failed: Option<SessionEvent>) {
        let notifier = EventNotifier::new();
        let mut events = notifier.subscribe();

        notifier.on_received(kind, test_peer(1), 1, Bytes::from_static(b"p"));
        assert_eq!(events.try_recv().ok(), received);
        notifier.on_delivered(kind, test_peer(1), 1, Bytes::from_static(b"p"));
        assert_eq!(events.try_recv().ok(), delivered);
        notifier.on_failed(kind, test_peer(1), 1, Bytes::from_static(b"p"));
        assert_eq!(events.try_recv().ok(), failed);
    }
}
