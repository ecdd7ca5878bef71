//! Fan-out of process and debug events to independent subscribers.
//!
//! Sources push into a single inbound queue; one dispatch task copies each
//! event into every interested subscriber's own unbounded queue. A subscriber
//! that stops reading only grows its own queue. Order is preserved per source
//! because each source pushes through one sender and the dispatcher is
//! sequential.

use std::sync::Arc;

use parking_lot::Mutex;
use pyra_process::{ProcessEvent, RunId};
use tokio::sync::mpsc;

use crate::session::{DebugEvent, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Program output: process streams, completion, and adapter `output`.
    Console,
    /// Everything a debug session reports.
    DebugPanel,
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    Process { run: RunId, event: ProcessEvent },
    Debug { session: SessionId, event: DebugEvent },
}

impl RouterEvent {
    fn matches(&self, topic: Topic) -> bool {
        match (topic, self) {
            (Topic::All, _) => true,
            (Topic::Console, RouterEvent::Process { .. }) => true,
            (
                Topic::Console,
                RouterEvent::Debug {
                    event: DebugEvent::Output { .. },
                    ..
                },
            ) => true,
            (Topic::DebugPanel, RouterEvent::Debug { .. }) => true,
            _ => false,
        }
    }
}

struct Subscriber {
    topic: Topic,
    tx: mpsc::UnboundedSender<RouterEvent>,
}

type Subscribers = Arc<Mutex<Vec<Subscriber>>>;

/// Cloneable producer side of the router.
#[derive(Debug, Clone)]
pub struct RouterSender {
    tx: mpsc::UnboundedSender<RouterEvent>,
}

impl RouterSender {
    /// Returns `false` once the router is gone.
    pub fn publish(&self, event: RouterEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn process(&self, run: RunId, event: ProcessEvent) -> bool {
        self.publish(RouterEvent::Process { run, event })
    }

    pub fn debug(&self, session: SessionId, event: DebugEvent) -> bool {
        self.publish(RouterEvent::Debug { session, event })
    }
}

pub struct EventRouter {
    sender: RouterSender,
    subscribers: Subscribers,
}

impl EventRouter {
    /// Spawn the dispatch task. It runs until every [`RouterSender`]
    /// (including the router's own) is dropped.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(dispatch(rx, subscribers.clone()));
        Self {
            sender: RouterSender { tx },
            subscribers,
        }
    }

    pub fn sender(&self) -> RouterSender {
        self.sender.clone()
    }

    pub fn publish(&self, event: RouterEvent) -> bool {
        self.sender.publish(event)
    }

    /// Receive events published after this call that match `topic`.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { topic, tx });
        Subscription { topic, rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    rx: mpsc::UnboundedReceiver<RouterEvent>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// `None` once the router has shut down and the queue is drained.
    pub async fn recv(&mut self) -> Option<RouterEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RouterEvent> {
        self.rx.try_recv().ok()
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<RouterEvent>, subscribers: Subscribers) {
    while let Some(event) = rx.recv().await {
        let mut subs = subscribers.lock();
        let before = subs.len();
        subs.retain(|sub| !event.matches(sub.topic) || sub.tx.send(event.clone()).is_ok());
        let pruned = before - subs.len();
        if pruned > 0 {
            tracing::trace!(target: "pyra.router", pruned, "dropped closed subscribers");
        }
    }
    tracing::debug!(target: "pyra.router", "event router stopped");
}
