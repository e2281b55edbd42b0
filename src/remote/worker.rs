use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::broker::message::{DeliveryStatus, Message, Route, RouteStatus};
use crate::remote::site::SiteShared;
use crate::transport::deliverer::{Deliverer, StatusCallback};
use crate::utils::error::GatewayError;

pub const BACKLOG_POLL: Duration = Duration::from_secs(1);

/// One of the concurrent senders of a remote site. Owns a deliverer per
/// route and tries them in order.
pub struct SendWorker {
    index: usize,
    deliverers: Vec<Arc<dyn Deliverer>>,
    routes: Arc<Mutex<Vec<Route>>>,
    sent: AtomicU64,
    saved: AtomicU64,
    not_sent: AtomicU64,
}

impl SendWorker {
    pub fn new<F>(index: usize, routes: &[Route], make_deliverer: &F) -> Result<Self, GatewayError>
    where
        F: Fn(&Route, StatusCallback) -> Result<Arc<dyn Deliverer>, GatewayError>,
    {
        let state = Arc::new(Mutex::new(routes.to_vec()));
        let deliverers = routes
            .iter()
            .enumerate()
            .map(|(pos, route)| {
                let state = state.clone();
                let callback: StatusCallback = Box::new(move |status| {
                    let mut routes = state.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(route) = routes.get_mut(pos) {
                        route.status = status;
                    }
                });
                make_deliverer(route, callback)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            index,
            deliverers,
            routes: state,
            sent: AtomicU64::new(0),
            saved: AtomicU64::new(0),
            not_sent: AtomicU64::new(0),
        })
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_up(&self) -> bool {
        self.routes().iter().any(|r| r.status == RouteStatus::Up)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn saved(&self) -> u64 {
        self.saved.load(Ordering::Relaxed)
    }

    pub fn not_sent(&self) -> u64 {
        self.not_sent.load(Ordering::Relaxed)
    }

    pub fn debug_json(&self) -> serde_json::Value {
        json!({
            "worker": self.index,
            "up": self.is_up(),
            "routes": self.routes(),
            "msgs_sent": self.sent(),
            "msgs_saved": self.saved(),
            "msgs_not_sent": self.not_sent(),
        })
    }

    pub(crate) async fn run(
        self: Arc<Self>,
        site: Arc<SiteShared>,
        queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(BACKLOG_POLL);
        loop {
            self.send_stored(&site).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                msg = async { queue.lock().await.recv().await } => match msg {
                    Some(msg) => self.send_or_store(&site, msg).await,
                    None => break,
                },
            }
        }
        debug!(site = %site.info.name, worker = self.index, "send worker stopped");
    }

    /// Deliver the oldest backlog record for the site, if any.
    async fn send_stored(&self, site: &SiteShared) {
        if let Some(msg) = site.take_oldest() {
            trace!(site = %site.info.name, worker = self.index, "retrying stored message");
            self.send_or_store(site, msg).await;
        }
    }

    async fn send_or_store(&self, site: &SiteShared, msg: Message) {
        if !self.send(site, &msg).await {
            self.saved.fetch_add(1, Ordering::Relaxed);
            site.store(msg).await;
        }
    }

    /// First deliverer to accept the message wins.
    async fn send(&self, site: &SiteShared, msg: &Message) -> bool {
        for deliverer in &self.deliverers {
            if deliverer.deliver(msg).await {
                site.router.notify(msg, DeliveryStatus::Sent).await;
                self.sent.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            debug!(
                site = %site.info.name,
                worker = self.index,
                url = deliverer.url(),
                "route did not take message"
            );
        }
        self.not_sent.fetch_add(1, Ordering::Relaxed);
        false
    }
}
