//! Channel standing for a configured peer site.
//!
//! Messages the router hands to a `RemoteSite` go to a small internal queue
//! drained by the send workers. When that queue is full, or every route of a
//! worker fails, the message is saved to the backlog and retried later.
//! Real-time messages are never saved; their sender gets a FAILED report
//! instead.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::broker::Router;
use crate::broker::channel::Channel;
use crate::broker::message::{DeliveryStatus, EndPoint, Message, Route, RouteStatus, SiteInfo};
use crate::persistence::{BacklogRecord, BacklogStore};
use crate::remote::worker::SendWorker;
use crate::transport::deliverer::{Deliverer, StatusCallback};
use crate::utils::error::GatewayError;

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_SEND_QUEUE: usize = 8;
pub const TO_REMOTE_DEPTH: usize = 32;
const QUEUE_LISTING_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct RemoteSiteOptions {
    pub workers: usize,
    pub send_queue_depth: usize,
}

impl Default for RemoteSiteOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            send_queue_depth: DEFAULT_SEND_QUEUE,
        }
    }
}

/// State the receive task and every worker share.
pub(crate) struct SiteShared {
    pub(crate) info: SiteInfo,
    pub(crate) router: Arc<Router>,
    backlog: Arc<dyn BacklogStore>,
    // Serializes find/remove/save cycles across workers.
    backlog_lock: Mutex<()>,
}

impl SiteShared {
    fn lock_backlog(&self) -> MutexGuard<'_, ()> {
        self.backlog_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) async fn store(&self, msg: Message) {
        if msg.real_time {
            debug!(site = %self.info.name, "real-time message not deliverable");
            self.router.notify(&msg, DeliveryStatus::Failed).await;
            return;
        }

        {
            let _guard = self.lock_backlog();
            if let Err(e) = self.backlog.save(self.info.id, &msg) {
                error!(site = %self.info.name, error = %e, "could not save message to backlog");
                return;
            }
        }

        // Flushing blocks on disk I/O.
        let backlog = self.backlog.clone();
        match tokio::task::spawn_blocking(move || backlog.sync()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(site = %self.info.name, error = %e, "could not sync backlog"),
            Err(e) => warn!(site = %self.info.name, error = %e, "backlog sync task failed"),
        }
    }

    /// Remove and return the oldest stored message for this site.
    pub(crate) fn take_oldest(&self) -> Option<Message> {
        let _guard = self.lock_backlog();
        let record = match self.backlog.find_oldest(self.info.id) {
            Ok(record) => record?,
            Err(e) => {
                error!(site = %self.info.name, error = %e, "could not read backlog");
                return None;
            }
        };
        if let Err(e) = self.backlog.remove(&record.id) {
            error!(site = %self.info.name, error = %e, "could not remove backlog record");
            return None;
        }
        Some(record.message)
    }
}

pub struct RemoteSite {
    shared: Arc<SiteShared>,
    to_remote: mpsc::Sender<Message>,
    from_remote: Mutex<Option<mpsc::Receiver<Message>>>,
    // Held so the router's listen task stays up until close.
    from_remote_tx: Mutex<Option<mpsc::Sender<Message>>>,
    workers: Vec<Arc<SendWorker>>,
    cancel: CancellationToken,
}

impl RemoteSite {
    /// Build the workers, start every task, and register with the router.
    ///
    /// `make_deliverer` is called once per route per worker. It receives the
    /// callback that keeps that worker's route status current.
    pub fn start<F>(
        info: SiteInfo,
        router: Arc<Router>,
        backlog: Arc<dyn BacklogStore>,
        opts: RemoteSiteOptions,
        cancel: CancellationToken,
        make_deliverer: F,
    ) -> Result<Arc<Self>, GatewayError>
    where
        F: Fn(&Route, StatusCallback) -> Result<Arc<dyn Deliverer>, GatewayError>,
    {
        let workers = (0..opts.workers.max(1))
            .map(|i| SendWorker::new(i, &info.routes, &make_deliverer).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let (to_remote, to_remote_rx) = mpsc::channel(TO_REMOTE_DEPTH);
        let (from_remote_tx, from_remote) = mpsc::channel(1);
        let (internal_tx, internal_rx) = mpsc::channel(opts.send_queue_depth.max(1));
        let internal_rx = Arc::new(tokio::sync::Mutex::new(internal_rx));

        let shared = Arc::new(SiteShared {
            info,
            router: router.clone(),
            backlog,
            backlog_lock: Mutex::new(()),
        });

        tokio::spawn(receive(
            shared.clone(),
            to_remote_rx,
            internal_tx,
            cancel.clone(),
        ));
        for worker in &workers {
            tokio::spawn(worker.clone().run(
                shared.clone(),
                internal_rx.clone(),
                cancel.clone(),
            ));
        }

        let site = Arc::new(Self {
            shared,
            to_remote,
            from_remote: Mutex::new(Some(from_remote)),
            from_remote_tx: Mutex::new(Some(from_remote_tx)),
            workers,
            cancel,
        });
        router.add_channel(site.clone());
        info!(site = %site.shared.info.name, id = site.shared.info.id, "added remote site");
        Ok(site)
    }

    pub fn id(&self) -> u32 {
        self.shared.info.id
    }

    pub fn workers(&self) -> &[Arc<SendWorker>] {
        &self.workers
    }

    pub fn pending(&self) -> usize {
        match self.shared.backlog.pending(self.shared.info.id) {
            Ok(n) => n,
            Err(e) => {
                warn!(site = %self.shared.info.name, error = %e, "could not count backlog");
                0
            }
        }
    }

    /// Stored messages awaiting delivery, oldest first.
    pub fn queue_json(&self) -> serde_json::Value {
        let _guard = self.shared.lock_backlog();
        let records: Vec<BacklogRecord> = self
            .shared
            .backlog
            .records(self.shared.info.id, QUEUE_LISTING_LIMIT)
            .unwrap_or_else(|e| {
                warn!(site = %self.shared.info.name, error = %e, "could not list backlog");
                Vec::new()
            });
        serde_json::to_value(records).unwrap_or_default()
    }
}

async fn receive(
    site: Arc<SiteShared>,
    mut to_remote: mpsc::Receiver<Message>,
    internal: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = to_remote.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        // The router's site table greeting has no destination and stays local.
        if msg.destination.is_empty() {
            trace!(site = %site.info.name, msg_type = msg.message_type(), "dropping undirected message");
            continue;
        }
        match internal.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) | Err(TrySendError::Closed(msg)) => {
                site.store(msg).await;
            }
        }
    }
}

impl Channel for RemoteSite {
    fn listening_for(&self, msg: &Message) -> bool {
        msg.destination.iter().any(|d| d.site == self.shared.info.id)
    }

    fn send_queue(&self) -> mpsc::Sender<Message> {
        self.to_remote.clone()
    }

    fn recv(&self) -> Option<mpsc::Receiver<Message>> {
        self.from_remote
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn close(&self) {
        self.cancel.cancel();
        self.from_remote_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    fn site_info(&self) -> Option<SiteInfo> {
        let mut info = self.shared.info.clone();
        for (pos, route) in info.routes.iter_mut().enumerate() {
            let up = self
                .workers
                .iter()
                .any(|w| w.routes().get(pos).is_some_and(|r| r.status == RouteStatus::Up));
            route.status = if up { RouteStatus::Up } else { RouteStatus::Down };
        }
        Some(info)
    }

    fn endpoint(&self) -> Option<EndPoint> {
        None
    }

    fn name(&self) -> String {
        format!("Site:{}", self.shared.info.name)
    }

    fn debug_json(&self) -> serde_json::Value {
        json!({
            "name": self.name(),
            "remote_site_name": self.shared.info.name,
            "site_info": self.site_info(),
            "pending": self.pending(),
            "send_workers": self.workers.iter().map(|w| w.debug_json()).collect::<Vec<_>>(),
        })
    }
}
