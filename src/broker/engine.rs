//! Router engine
//!
//! The router owns every live `Channel` and a single bounded inbox. One
//! processing task drains the inbox and, for each message:
//! - records it in a short history ring used for introspection
//! - offers it to every channel whose subscriptions match, never blocking:
//!   a full channel queue drops the message for that channel only
//! - answers the sender with a FAILED `DeliveryReport` when nobody took it
//!   and the sender asked to be notified
//!
//! Each channel also gets a listen task that feeds its inbound messages into
//! the inbox and tears the channel down when its receive side ends.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::channel::Channel;
use crate::broker::message::{
    Body, ConnectionStatus, DeliveryReport, DeliveryStatus, EndPoint, Message, ServiceInfo,
    SiteInfo, SiteStatus,
};

pub const HISTORY_SIZE: usize = 50;
pub const INBOX_DEPTH: usize = 32;
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

pub type ChannelId = u64;

struct ChannelEntry {
    channel: Arc<dyn Channel>,
    queue: mpsc::Sender<Message>,
    was_full: bool,
}

#[derive(Default)]
struct RouterState {
    channels: HashMap<ChannelId, ChannelEntry>,
    history: VecDeque<Message>,
}

/// Result of one dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Channels whose subscriptions matched.
    pub matched: usize,
    /// Channels that accepted the message into their queue.
    pub queued: usize,
}

pub struct Router {
    local: SiteInfo,
    state: Mutex<RouterState>,
    inbox: mpsc::Sender<Message>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    cancel: CancellationToken,
    next_id: AtomicU64,
    total_routed: AtomicU64,
    since_report: AtomicU64,
}

impl Router {
    /// Create a router without starting its processing task.
    pub fn new(local_site: u32, local_name: &str, cancel: CancellationToken) -> Arc<Self> {
        let (inbox, inbox_rx) = mpsc::channel(INBOX_DEPTH);
        Arc::new(Self {
            local: SiteInfo {
                id: local_site,
                name: local_name.to_string(),
                local: true,
                ..SiteInfo::default()
            },
            state: Mutex::new(RouterState::default()),
            inbox,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            cancel,
            next_id: AtomicU64::new(1),
            total_routed: AtomicU64::new(0),
            since_report: AtomicU64::new(0),
        })
    }

    /// Create a router and spawn its processing task.
    pub fn start(local_site: u32, local_name: &str, cancel: CancellationToken) -> Arc<Self> {
        let router = Self::new(local_site, local_name, cancel);
        let rx = router.inbox_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(rx) = rx {
            tokio::spawn(router.clone().process(rx));
        }
        router
    }

    pub fn local(&self) -> &SiteInfo {
        &self.local
    }

    pub fn local_id(&self) -> u32 {
        self.local.id
    }

    pub fn total_routed(&self) -> u64 {
        self.total_routed.load(Ordering::Relaxed)
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn process(self: Arc<Self>, mut inbox: mpsc::Receiver<Message>) {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let recent = self.since_report.swap(0, Ordering::Relaxed);
                    let rate = recent as f64 / REPORT_INTERVAL.as_secs_f64();
                    debug!(total = self.total_routed(), rate, "router throughput");
                }
                msg = inbox.recv() => match msg {
                    Some(msg) => {
                        self.handle(msg);
                    }
                    None => return,
                },
            }
        }
    }

    /// Queue a message for routing, waiting for inbox space.
    pub async fn recv(&self, msg: Message) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            res = self.inbox.send(msg) => {
                if res.is_err() {
                    debug!("router inbox closed, dropping message");
                }
            }
        }
    }

    /// Route one message to every matching channel.
    pub fn handle(&self, msg: Message) -> Dispatch {
        self.total_routed.fetch_add(1, Ordering::Relaxed);
        self.since_report.fetch_add(1, Ordering::Relaxed);

        let mut dispatch = Dispatch {
            matched: 0,
            queued: 0,
        };
        {
            let mut state = self.state();
            state.history.push_back(msg.clone());
            while state.history.len() > HISTORY_SIZE {
                state.history.pop_front();
            }

            for entry in state.channels.values_mut() {
                if !entry.channel.listening_for(&msg) {
                    continue;
                }
                dispatch.matched += 1;
                match entry.queue.try_send(msg.clone()) {
                    Ok(()) => {
                        dispatch.queued += 1;
                        if entry.was_full {
                            debug!(channel = %entry.channel.name(), "send queue drained");
                        }
                        entry.was_full = false;
                    }
                    Err(TrySendError::Full(_)) => {
                        if !entry.was_full {
                            warn!(
                                channel = %entry.channel.name(),
                                "send queue is full, dropping messages for it"
                            );
                        }
                        entry.was_full = true;
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(channel = %entry.channel.name(), "send queue closed");
                    }
                }
            }
        }

        if dispatch.matched == 0 || dispatch.queued == 0 {
            debug!(
                matched = dispatch.matched,
                queued = dispatch.queued,
                msg_type = msg.message_type(),
                "message dropped, no listener took it"
            );
            if let Some(report) = self.delivery_report(&msg, DeliveryStatus::Failed) {
                self.handle(report);
            }
        }
        dispatch
    }

    /// Build a delivery report for `msg`, if its sender asked for one and it
    /// originated at this site.
    pub fn delivery_report(&self, msg: &Message, status: DeliveryStatus) -> Option<Message> {
        let source = msg.source?;
        if msg.notify_sent == 0 || source.site != self.local.id {
            return None;
        }
        Some(Message::new(
            vec![source],
            Body::DeliveryReport(DeliveryReport {
                notify_id: msg.notify_sent,
                status,
            }),
        ))
    }

    /// Send a delivery report for `msg` through the inbox.
    pub async fn notify(&self, msg: &Message, status: DeliveryStatus) {
        if let Some(report) = self.delivery_report(msg, status) {
            self.recv(report).await;
        }
    }

    fn service_info(&self) -> ServiceInfo {
        let state = self.state();
        let mut sites = vec![self.local.clone()];
        sites.extend(state.channels.values().filter_map(|e| e.channel.site_info()));
        ServiceInfo { sites }
    }

    fn site_status(&self, site_id: u32, connection: ConnectionStatus) -> Message {
        Message::new(
            vec![EndPoint::site(self.local.id)],
            Body::SiteStatus(SiteStatus {
                site_id,
                connection,
            }),
        )
    }

    /// Register a channel: send it the site table, then start draining it.
    pub fn add_channel(self: &Arc<Self>, channel: Arc<dyn Channel>) -> ChannelId {
        let queue = channel.send_queue();
        let info = Message::new(Vec::new(), Body::ServiceInfo(self.service_info()));
        if let Err(e) = queue.try_send(info) {
            warn!(channel = %channel.name(), error = %e, "could not send service info");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state().channels.insert(
            id,
            ChannelEntry {
                channel: channel.clone(),
                queue,
                was_full: false,
            },
        );
        tokio::spawn(self.clone().listen(id, channel));
        id
    }

    async fn listen(self: Arc<Self>, id: ChannelId, channel: Arc<dyn Channel>) {
        debug!(channel = %channel.name(), "opening channel");
        if let Some(mut rx) = channel.recv() {
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => self.recv(msg).await,
                        None => break,
                    },
                }
            }
        }
        debug!(channel = %channel.name(), "closing channel");

        if let Some(site) = channel.peer_site() {
            self.handle(self.site_status(site, ConnectionStatus::Bad));
        }
        channel.close();
        self.state().channels.remove(&id);
    }

    /// Routed messages, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.state().history.iter().cloned().collect()
    }

    pub fn channel_table(&self) -> Vec<serde_json::Value> {
        self.state()
            .channels
            .values()
            .map(|e| e.channel.debug_json())
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        self.state().channels.len()
    }

    /// Whether the channel with `id` is flagged as having a full queue.
    pub fn is_full(&self, id: ChannelId) -> bool {
        self.state().channels.get(&id).is_some_and(|e| e.was_full)
    }
}
