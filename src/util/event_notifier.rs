use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::trace;

/// Fans out events to any number of subscribers, each with their own unbounded channel, so a
///  slow subscriber neither loses events nor blocks the producer. A subscriber unsubscribes by
///  dropping its receiver.
pub struct EventNotifier<E> {
    subscribers: Mutex<Subscribers<E>>,
}

struct Subscribers<E> {
    senders: Vec<mpsc::UnboundedSender<E>>,
    is_closed: bool,
}

impl <E: Clone + Debug + Send> EventNotifier<E> {
    pub fn new() -> EventNotifier<E> {
        EventNotifier {
            subscribers: Mutex::new(Subscribers {
                senders: Vec::new(),
                is_closed: false,
            }),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers<E>> {
        self.subscribers.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// After [EventNotifier::close], the returned receiver is at end-of-stream immediately
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers();
        if !subscribers.is_closed {
            subscribers.senders.push(sender);
        }
        receiver
    }

    pub fn send_event(&self, event: E) {
        trace!("event: {:?}", event);
        self.subscribers().senders
            .retain(|s| s.send(event.clone()).is_ok());
    }

    /// Drops all subscriptions, signalling end-of-stream to subscribers
    pub fn close(&self) {
        let mut subscribers = self.subscribers();
        subscribers.is_closed = true;
        subscribers.senders.clear();
    }

    pub fn num_subscribers(&self) -> usize {
        self.subscribers().senders.len()
    }
}

impl <E: Clone + Debug + Send> Default for EventNotifier<E> {
    fn default() -> Self {
        Self::new()
    }
}
