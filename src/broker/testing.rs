//! In-memory `Channel` for exercising the router without sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::broker::channel::Channel;
use crate::broker::matcher::matches;
use crate::broker::message::{EndPoint, Listener, Message, SiteInfo};

pub(crate) struct TestChannel {
    name: String,
    listeners: Vec<Listener>,
    peer: Option<u32>,
    to_remote: mpsc::Sender<Message>,
    from_remote: Mutex<Option<mpsc::Receiver<Message>>>,
    pub(crate) closed: AtomicBool,
}

impl TestChannel {
    /// Returns the channel, its outbound receiver, and a sender that feeds
    /// messages "from the wire" toward the router.
    pub(crate) fn new(
        name: &str,
        listeners: Vec<Listener>,
        depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>, mpsc::Sender<Message>) {
        Self::with_peer(name, listeners, depth, None)
    }

    pub(crate) fn with_peer(
        name: &str,
        listeners: Vec<Listener>,
        depth: usize,
        peer: Option<u32>,
    ) -> (Arc<Self>, mpsc::Receiver<Message>, mpsc::Sender<Message>) {
        let (to_remote, out_rx) = mpsc::channel(depth);
        let (in_tx, from_remote) = mpsc::channel(8);
        let ch = Arc::new(Self {
            name: name.to_string(),
            listeners,
            peer,
            to_remote,
            from_remote: Mutex::new(Some(from_remote)),
            closed: AtomicBool::new(false),
        });
        (ch, out_rx, in_tx)
    }
}

impl Channel for TestChannel {
    fn listening_for(&self, msg: &Message) -> bool {
        self.listeners.iter().any(|l| matches(l, msg, 0))
    }

    fn send_queue(&self) -> mpsc::Sender<Message> {
        self.to_remote.clone()
    }

    fn recv(&self) -> Option<mpsc::Receiver<Message>> {
        self.from_remote.lock().unwrap().take()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn site_info(&self) -> Option<SiteInfo> {
        None
    }

    fn endpoint(&self) -> Option<EndPoint> {
        None
    }

    fn peer_site(&self) -> Option<u32> {
        self.peer
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn debug_json(&self) -> serde_json::Value {
        serde_json::json!({ "name": self.name })
    }
}
