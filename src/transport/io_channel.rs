//! Channel over one attached socket.
//!
//! A read task decodes frames, answers each with an ACK, consumes `Registry`
//! bodies and forwards everything else toward the router. A write task drains
//! pending ACKs first, then the outbound queue the router fills.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::channel::Channel;
use crate::broker::matcher;
use crate::broker::message::{
    APP_GATEWAY, Body, ConnectionStatus, EndPoint, Message, Registry, SiteInfo, SiteStatus,
    Status, app_name,
};
use crate::transport::codec::{EncodeOptions, FrameReader, FrameWriter};
use crate::utils::error::CodecError;

pub const CLIENT_BUFFER: usize = 128;
const INBOUND_DEPTH: usize = 8;
const ACK_DEPTH: usize = 8;

#[derive(Default)]
struct Peer {
    registry: Option<Registry>,
    gateway_site: Option<u32>,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    written: AtomicU64,
}

pub struct IoChannel {
    local_site: u32,
    peer_addr: String,
    to_remote: mpsc::Sender<Message>,
    from_remote: Mutex<Option<mpsc::Receiver<Message>>>,
    peer: Arc<Mutex<Peer>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

fn lock(peer: &Mutex<Peer>) -> MutexGuard<'_, Peer> {
    peer.lock().unwrap_or_else(|e| e.into_inner())
}

impl IoChannel {
    /// Start the read and write tasks for `stream` and return the channel.
    pub fn spawn<S>(
        stream: S,
        peer_addr: impl Into<String>,
        local_site: u32,
        cancel: CancellationToken,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (to_remote, outbound) = mpsc::channel(CLIENT_BUFFER);
        let (inbound, from_remote) = mpsc::channel(INBOUND_DEPTH);
        let (ack_tx, ack_rx) = mpsc::channel(ACK_DEPTH);

        let channel = Arc::new(Self {
            local_site,
            peer_addr: peer_addr.into(),
            to_remote,
            from_remote: Mutex::new(Some(from_remote)),
            peer: Arc::new(Mutex::new(Peer::default())),
            counters: Arc::new(Counters::default()),
            cancel,
        });

        tokio::spawn(read_loop(
            FrameReader::new(read_half),
            ReadCtx {
                local_site,
                peer: channel.peer.clone(),
                counters: channel.counters.clone(),
                inbound,
                acks: ack_tx,
                cancel: channel.cancel.clone(),
            },
        ));
        tokio::spawn(write_loop(
            FrameWriter::new(write_half),
            outbound,
            ack_rx,
            channel.counters.clone(),
            channel.cancel.clone(),
        ));
        channel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Channel for IoChannel {
    fn listening_for(&self, msg: &Message) -> bool {
        lock(&self.peer).registry.as_ref().is_some_and(|r| {
            r.entries
                .iter()
                .any(|l| matcher::matches(l, msg, self.local_site))
        })
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
    }

    fn site_info(&self) -> Option<SiteInfo> {
        None
    }

    fn endpoint(&self) -> Option<EndPoint> {
        lock(&self.peer)
            .registry
            .as_ref()
            .and_then(|r| r.source_service)
    }

    fn peer_site(&self) -> Option<u32> {
        lock(&self.peer).gateway_site
    }

    fn name(&self) -> String {
        let peer = lock(&self.peer);
        if let Some(site) = peer.gateway_site {
            return format!("Remote Site ({site})");
        }
        match peer.registry.as_ref().and_then(|r| r.source_service) {
            Some(ep) => match app_name(ep.aid) {
                Some(app) => format!("{app}-{}", ep.eid),
                None => format!("{:#04x}-{}", ep.aid, ep.eid),
            },
            None => self.peer_addr.clone(),
        }
    }

    fn debug_json(&self) -> serde_json::Value {
        let listeners = lock(&self.peer)
            .registry
            .as_ref()
            .map(|r| serde_json::to_value(&r.entries).unwrap_or_default())
            .unwrap_or_else(|| json!([]));
        json!({
            "name": self.name(),
            "peer": self.peer_addr,
            "received": self.counters.received.load(Ordering::Relaxed),
            "written": self.counters.written.load(Ordering::Relaxed),
            "listeners": listeners,
        })
    }
}

struct ReadCtx {
    local_site: u32,
    peer: Arc<Mutex<Peer>>,
    counters: Arc<Counters>,
    inbound: mpsc::Sender<Message>,
    acks: mpsc::Sender<u64>,
    cancel: CancellationToken,
}

impl ReadCtx {
    /// Queue `msg` toward the router. Returns false once the channel is gone.
    async fn forward(&self, msg: Message) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = self.inbound.send(msg) => res.is_ok(),
        }
    }

    fn register(&self, registry: Registry) -> Option<Message> {
        let mut peer = lock(&self.peer);
        let mut notice = None;
        if let Some(ep) = registry.source_service {
            if ep.aid == APP_GATEWAY && peer.gateway_site != Some(ep.site) {
                info!(site = ep.site, "peer gateway connected");
                peer.gateway_site = Some(ep.site);
                notice = Some(Message::new(
                    vec![EndPoint::site(self.local_site)],
                    Body::SiteStatus(SiteStatus {
                        site_id: ep.site,
                        connection: ConnectionStatus::Ok,
                    }),
                ));
            }
        } else if registry.entries.is_empty() {
            warn!("registry without source service or entries");
        }
        debug!(entries = registry.entries.len(), "registry updated");
        peer.registry = Some(registry);
        notice
    }
}

async fn read_loop<R>(mut reader: FrameReader<R>, ctx: ReadCtx)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            frame = reader.next_frame() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(CodecError::Closed) => {
                debug!("peer closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "read failed, closing channel");
                break;
            }
        };
        ctx.counters.received.fetch_add(1, Ordering::Relaxed);

        let msg = frame.message;
        match msg.status {
            Status::Ack => continue,
            Status::Keepalive => {}
            _ => {
                let forward = match msg.body {
                    Some(Body::Registry(registry)) => ctx.register(registry),
                    _ => Some(msg),
                };
                if let Some(msg) = forward {
                    if !ctx.forward(msg).await {
                        break;
                    }
                }
            }
        }
        if ctx.acks.send(frame.id).await.is_err() {
            break;
        }
    }
    ctx.cancel.cancel();
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Message>,
    mut acks: mpsc::Receiver<u64>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(id) = acks.recv() => {
                let ack = Message::with_status(Status::Ack);
                writer.write_frame(&ack, EncodeOptions { id, compress: false }).await
            }
            msg = outbound.recv() => match msg {
                Some(mut msg) => {
                    msg.send_time = chrono::Utc::now().timestamp_millis();
                    writer.write_frame(&msg, EncodeOptions::random()).await
                }
                None => break,
            },
        };
        match result {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(CodecError::TooLarge(size)) => {
                warn!(size, "message too large to frame, dropped");
            }
            Err(e) => {
                warn!(error = %e, "write failed, closing channel");
                break;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "shutdown after close");
    }
    cancel.cancel();
}
