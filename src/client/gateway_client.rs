//! Application-side handle to a gateway.
//!
//! A `GatewayClient` is created once and passed to whatever needs the bus.
//! It keeps one TCP link to the gateway alive, re-announcing its registry on
//! every connect, and demultiplexes incoming traffic to local listeners,
//! delivery-report waiters and pending requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broker::matcher;
use crate::broker::message::{
    APP_GATEWAY, Body, DeliveryReport, DeliveryStatus, EndPoint, LOCAL_SITE, Listener, Message,
    Registry, ServiceInfo, SiteInfo, Status, UNKNOWN_SITE,
};
use crate::transport::codec::{EncodeOptions, FrameReader, FrameWriter};
use crate::utils::error::{ClientError, CodecError};

pub const DEFAULT_GATEWAY_ADDR: &str = "127.0.0.1:31228";
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
const OUTBOX_DEPTH: usize = 32;
const LISTENER_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Gateway `host:port`.
    pub addr: String,
    pub app: u32,
    pub entry: u32,
    pub pid: u32,
}

impl ClientOptions {
    /// Options for application `app`, with the entry id defaulting to
    /// `app * 1000`.
    pub fn new(addr: impl Into<String>, app: u32) -> Self {
        Self {
            addr: addr.into(),
            app,
            entry: app.saturating_mul(1000),
            pid: std::process::id(),
        }
    }
}

struct ClientState {
    site: u32,
    sites: HashMap<String, SiteInfo>,
    service_info: Option<ServiceInfo>,
    entries: Vec<Listener>,
    listeners: Vec<(Listener, mpsc::Sender<Message>)>,
    notify: HashMap<i32, oneshot::Sender<DeliveryReport>>,
    requests: HashMap<u32, oneshot::Sender<Message>>,
}

pub struct GatewayClient {
    opts: ClientOptions,
    state: Mutex<ClientState>,
    outbox: mpsc::Sender<Message>,
    cmd_seq: AtomicU32,
    ready: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl GatewayClient {
    /// Start the connection task and return the handle. Use `ready` to wait
    /// for the gateway's site table.
    pub fn connect(opts: ClientOptions, cancel: CancellationToken) -> Arc<Self> {
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
        let (ready, _) = watch::channel(false);
        let client = Arc::new(Self {
            opts,
            state: Mutex::new(ClientState {
                site: LOCAL_SITE,
                sites: HashMap::new(),
                service_info: None,
                entries: Vec::new(),
                listeners: Vec::new(),
                notify: HashMap::new(),
                requests: HashMap::new(),
            }),
            outbox,
            cmd_seq: AtomicU32::new(1),
            ready,
            cancel,
        });
        {
            let mut state = client.state();
            let app = EndPoint {
                site: LOCAL_SITE,
                aid: client.opts.app,
                ..EndPoint::default()
            };
            let local = client.endpoint_for(LOCAL_SITE);
            state.entries.push(Listener {
                destination: Some(app),
                ..Listener::default()
            });
            state.entries.push(Listener {
                destination: Some(local),
                ..Listener::default()
            });
        }
        tokio::spawn(client.clone().run(outbox_rx));
        client
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoint_for(&self, site: u32) -> EndPoint {
        EndPoint {
            site,
            aid: self.opts.app,
            eid: self.opts.entry,
            pid: self.opts.pid,
        }
    }

    /// This process's endpoint.
    pub fn local(&self) -> EndPoint {
        self.endpoint_for(self.state().site)
    }

    pub fn local_router(&self) -> EndPoint {
        EndPoint {
            site: self.state().site,
            aid: APP_GATEWAY,
            ..EndPoint::default()
        }
    }

    pub fn site_id(&self) -> u32 {
        self.state().site
    }

    pub fn service_info(&self) -> Option<ServiceInfo> {
        self.state().service_info.clone()
    }

    /// Wait until the gateway has sent its site table.
    pub async fn ready(&self) -> Result<(), ClientError> {
        let mut rx = self.ready.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClientError::Closed),
            res = rx.wait_for(|ready| *ready) => res.map(|_| ()).map_err(|_| ClientError::Closed),
        }
    }

    /// Site id for a site name. `""` is this site, `"local"` the local alias.
    pub fn resolve_site(&self, name: &str) -> u32 {
        let state = self.state();
        match name {
            "" => state.site,
            "local" => LOCAL_SITE,
            _ => state.sites.get(name).map_or(UNKNOWN_SITE, |s| s.id),
        }
    }

    pub async fn send(&self, mut msg: Message) -> Result<(), ClientError> {
        msg.source = Some(self.local());
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClientError::Closed),
            res = self.outbox.send(msg) => res.map_err(|_| ClientError::Closed),
        }
    }

    pub async fn send_to(&self, endpoint: EndPoint, body: Body) -> Result<(), ClientError> {
        let mut msg = Message::new(vec![endpoint], body);
        msg.request_time = msg.write_time;
        self.send(msg).await
    }

    /// Send to every listener for this site.
    pub async fn broadcast_local(&self, body: Body) -> Result<(), ClientError> {
        let site = self.site_id();
        let mut msg = Message::new(vec![EndPoint::site(site)], body);
        msg.request_time = msg.write_time;
        self.send(msg).await
    }

    fn register_notify(&self) -> (i32, oneshot::Receiver<DeliveryReport>) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state();
        loop {
            let id = rand::random::<i32>() & i32::MAX;
            if id != 0 && !state.notify.contains_key(&id) {
                state.notify.insert(id, tx);
                return (id, rx);
            }
        }
    }

    /// Send `msg` asking for a delivery report.
    pub async fn send_notify(
        &self,
        mut msg: Message,
    ) -> Result<oneshot::Receiver<DeliveryReport>, ClientError> {
        let (id, rx) = self.register_notify();
        msg.notify_sent = id;
        if let Err(e) = self.send(msg).await {
            self.state().notify.remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Receive messages matching `listener`. The gateway is told to forward
    /// them here.
    pub async fn listen(&self, listener: Listener) -> Result<mpsc::Receiver<Message>, ClientError> {
        let (tx, rx) = mpsc::channel(LISTENER_DEPTH);
        {
            let mut state = self.state();
            state.listeners.push((listener.clone(), tx));
            state.entries.push(listener);
        }
        self.send(self.registry_message()).await?;
        Ok(rx)
    }

    /// Call `endpoint` and wait for its reply.
    pub async fn request(
        &self,
        endpoint: EndPoint,
        body: Body,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let seq = self.cmd_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.state().requests.insert(seq, reply_tx);

        let mut msg = Message::new(vec![endpoint], body);
        msg.status = Status::Request;
        msg.real_time = true;
        msg.command_sequence = Some(seq);
        msg.request_time = msg.write_time;

        let (notify_id, mut report_rx) = self.register_notify();
        msg.notify_sent = notify_id;

        let outcome = match self.send(msg).await {
            Ok(()) => {
                let wait = async {
                    let mut report_done = false;
                    loop {
                        tokio::select! {
                            reply = &mut reply_rx => return reply.map_err(|_| ClientError::Closed),
                            report = &mut report_rx, if !report_done => match report {
                                Ok(r) if r.status != DeliveryStatus::Sent => {
                                    return Err(ClientError::Delivery(r.status));
                                }
                                _ => report_done = true,
                            },
                        }
                    }
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(ClientError::Closed),
                    res = tokio::time::timeout(timeout, wait) => {
                        res.unwrap_or(Err(ClientError::Timeout(timeout)))
                    }
                }
            }
            Err(e) => Err(e),
        };

        let mut state = self.state();
        state.requests.remove(&seq);
        state.notify.remove(&notify_id);
        outcome
    }

    /// Answer `request` with `body`.
    pub async fn reply(&self, request: &Message, body: Body) -> Result<(), ClientError> {
        let mut msg = Message::new(request.source.into_iter().collect(), body);
        msg.status = Status::Reply;
        msg.command_sequence = request.command_sequence;
        self.send(msg).await
    }

    fn registry_message(&self) -> Message {
        let local = self.local();
        let entries = self.state().entries.clone();
        let mut msg = Message::new(
            vec![self.local_router()],
            Body::Registry(Registry {
                source_service: Some(local),
                entries,
            }),
        );
        msg.source = Some(local);
        msg
    }

    async fn run(self: Arc<Self>, mut outbox: mpsc::Receiver<Message>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match TcpStream::connect(&self.opts.addr).await {
                Ok(stream) => {
                    info!(addr = %self.opts.addr, "connected to gateway");
                    self.serve(stream, &mut outbox).await;
                }
                Err(e) => warn!(addr = %self.opts.addr, error = %e, "could not connect to gateway"),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
            }
        }
        debug!("gateway client stopped");
    }

    async fn serve(&self, stream: TcpStream, outbox: &mut mpsc::Receiver<Message>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }
        let (r, w) = stream.into_split();
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);

        let registry = self.registry_message();
        if let Err(e) = writer.write_frame(&registry, EncodeOptions::random()).await {
            warn!(error = %e, "could not send registry");
            return;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if let Err(e) = writer.shutdown().await {
                        debug!(error = %e, "shutdown after cancel");
                    }
                    return;
                }
                msg = outbox.recv() => {
                    let Some(mut msg) = msg else { return };
                    msg.send_time = chrono::Utc::now().timestamp_millis();
                    if let Err(e) = writer.write_frame(&msg, EncodeOptions::random()).await {
                        warn!(error = %e, "lost connection to gateway");
                        return;
                    }
                }
                frame = reader.next_frame() => match frame {
                    Ok(frame) => {
                        if self.handle(frame.message).await {
                            let registry = self.registry_message();
                            if let Err(e) = writer.write_frame(&registry, EncodeOptions::random()).await {
                                warn!(error = %e, "lost connection to gateway");
                                return;
                            }
                        }
                    }
                    Err(CodecError::Closed) => {
                        warn!("gateway closed the connection");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "lost connection to gateway");
                        return;
                    }
                },
            }
        }
    }

    /// Dispatch one incoming message. Returns true when the registry must be
    /// re-sent.
    async fn handle(&self, msg: Message) -> bool {
        if msg.status == Status::Ack {
            return false;
        }
        trace!(msg_type = msg.message_type(), "received");

        let mut resend = false;
        let targets = {
            let mut state = self.state();
            match &msg.body {
                Some(Body::ServiceInfo(info)) => {
                    resend = self.update_sites(&mut state, info);
                }
                Some(Body::DeliveryReport(report)) => {
                    if let Some(tx) = state.notify.remove(&report.notify_id) {
                        let _ = tx.send(*report);
                    }
                }
                _ => {}
            }

            if msg.status == Status::Reply {
                if let Some(tx) = msg.command_sequence.and_then(|s| state.requests.remove(&s)) {
                    let _ = tx.send(msg);
                    return resend;
                }
            }

            let site = state.site;
            state.listeners.retain(|(_, tx)| !tx.is_closed());
            state
                .listeners
                .iter()
                .filter(|(l, _)| matcher::matches(l, &msg, site))
                .map(|(_, tx)| tx.clone())
                .collect::<Vec<_>>()
        };

        for tx in targets {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tx.send(msg.clone()) => {}
            }
        }
        resend
    }

    fn update_sites(&self, state: &mut ClientState, info: &ServiceInfo) -> bool {
        debug!(sites = info.sites.len(), "received service info");
        let old_site = state.site;
        for site in &info.sites {
            if site.local {
                state.site = site.id;
            }
            state.sites.insert(site.name.clone(), site.clone());
        }
        state.service_info = Some(info.clone());
        self.ready.send_replace(true);

        if state.site == old_site {
            return false;
        }
        let site = state.site;
        state.entries.push(Listener {
            destination: Some(EndPoint {
                site,
                aid: self.opts.app,
                ..EndPoint::default()
            }),
            ..Listener::default()
        });
        state.entries.push(Listener {
            destination: Some(self.endpoint_for(site)),
            ..Listener::default()
        });
        true
    }
}
