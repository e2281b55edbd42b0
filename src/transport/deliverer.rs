//! Outbound transport to one route of a peer gateway.
//!
//! A `NetDeliverer` owns at most one connection. `deliver` sends one frame
//! and waits for the ACK carrying the same random id; any failure drops the
//! connection and reports the route `Down`. A maintenance task reconnects
//! when disconnected and pings with KEEPALIVE frames otherwise.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::message::{
    APP_GATEWAY, Body, EndPoint, Message, Registry, RouteStatus, Status,
};
use crate::transport::BoxedStream;
use crate::transport::codec::{EncodeOptions, FrameReader, FrameWriter};
use crate::transport::tls::TlsContext;
use crate::utils::error::{DeliveryError, GatewayError};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const PING_INTERVAL: Duration = Duration::from_secs(15);
pub const ACK_TIMEOUT: Duration = Duration::from_secs(30);

pub type StatusCallback = Box<dyn Fn(RouteStatus) + Send + Sync>;

#[async_trait]
pub trait Deliverer: Send + Sync {
    /// Send one message and wait for its ACK. Never retries.
    async fn deliver(&self, msg: &Message) -> bool;

    fn set_status_callback(&self, callback: StatusCallback);

    fn url(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    Any,
    V4,
    V6,
}

/// Parsed route url, `<scheme>:<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub secure: bool,
    pub family: AddrFamily,
    pub addr: String,
}

impl RouteTarget {
    pub fn parse(url: &str) -> Result<Self, GatewayError> {
        let (scheme, rest) = url
            .split_once(':')
            .ok_or_else(|| GatewayError::RouteUrl(url.to_string()))?;
        let addr = rest.trim_start_matches("//");
        if addr.is_empty() {
            return Err(GatewayError::RouteUrl(url.to_string()));
        }
        let (secure, family) = match scheme.to_ascii_lowercase().as_str() {
            "tcp" => (false, AddrFamily::Any),
            "tcp4" => (false, AddrFamily::V4),
            "tcp6" => (false, AddrFamily::V6),
            "tcps" => (true, AddrFamily::Any),
            _ => return Err(GatewayError::RouteUrl(url.to_string())),
        };
        Ok(Self {
            secure,
            family,
            addr: addr.to_string(),
        })
    }
}

struct Connection {
    reader: FrameReader<ReadHalf<BoxedStream>>,
    writer: FrameWriter<WriteHalf<BoxedStream>>,
}

impl Connection {
    fn new(stream: BoxedStream) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(r),
            writer: FrameWriter::new(w),
        }
    }

    async fn exchange(&mut self, msg: &Message, id: u64) -> Result<(), DeliveryError> {
        self.writer
            .write_frame(msg, EncodeOptions { id, compress: true })
            .await?;
        loop {
            let frame = self.reader.read_frame().await?;
            // Frames with a body are the peer's own traffic, not replies.
            if frame.message.body.is_some() {
                continue;
            }
            if frame.message.status != Status::Ack || frame.id != id {
                return Err(DeliveryError::UnexpectedReply {
                    expected: id,
                    got: frame.id,
                    status: frame.message.status,
                });
            }
            return Ok(());
        }
    }
}

pub struct NetDeliverer {
    url: String,
    target: RouteTarget,
    local: EndPoint,
    tls: Option<TlsContext>,
    conn: tokio::sync::Mutex<Option<Connection>>,
    counter: AtomicU64,
    status: Mutex<StatusCallback>,
    latency: Mutex<Duration>,
    cancel: CancellationToken,
}

impl NetDeliverer {
    /// Build a deliverer for `url`. `local_site` is announced in the hello
    /// registry sent on every connect.
    pub fn new(
        url: &str,
        local_site: u32,
        tls: Option<TlsContext>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, GatewayError> {
        let target = RouteTarget::parse(url)?;
        if target.secure && tls.is_none() {
            return Err(GatewayError::Tls(format!(
                "route {url} needs ca, cert and key to be configured"
            )));
        }
        Ok(Arc::new(Self {
            url: url.to_string(),
            target,
            local: EndPoint {
                site: local_site,
                aid: APP_GATEWAY,
                ..EndPoint::default()
            },
            tls,
            conn: tokio::sync::Mutex::new(None),
            counter: AtomicU64::new(rand::random::<u32>() as u64),
            status: Mutex::new(Box::new(|_| {})),
            latency: Mutex::new(Duration::ZERO),
            cancel,
        }))
    }

    /// Spawn the connection maintenance task.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(self.clone().maintain());
    }

    pub fn last_latency(&self) -> Duration {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    fn report(&self, status: RouteStatus) {
        let callback = self.status.lock().unwrap_or_else(|e| e.into_inner());
        callback(status);
    }

    async fn maintain(self: Arc<Self>) {
        self.try_connect().await;
        let start = tokio::time::Instant::now() + PING_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, PING_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.is_connected().await {
                        self.ping().await;
                    } else {
                        self.try_connect().await;
                    }
                }
            }
        }
        self.conn.lock().await.take();
        debug!(url = %self.url, "deliverer stopped");
    }

    async fn ping(&self) {
        if self.deliver(&Message::with_status(Status::Keepalive)).await {
            debug!(url = %self.url, latency = ?self.last_latency(), "ping");
        }
    }

    /// Dial the route and send the hello registry. Returns whether the
    /// route is up afterwards.
    pub async fn try_connect(&self) -> bool {
        match self.dial().await {
            Ok(stream) => {
                *self.conn.lock().await = Some(Connection::new(stream));
                info!(url = %self.url, "connected to remote site");
                self.report(RouteStatus::Up);
                self.deliver(&self.hello()).await
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "could not connect to remote site");
                self.conn.lock().await.take();
                self.report(RouteStatus::Down);
                false
            }
        }
    }

    fn hello(&self) -> Message {
        let mut msg = Message::new(
            Vec::new(),
            Body::Registry(Registry {
                source_service: Some(self.local),
                entries: Vec::new(),
            }),
        );
        msg.source = Some(self.local);
        msg
    }

    async fn dial(&self) -> std::io::Result<BoxedStream> {
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, self.dial_tcp())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        match &self.tls {
            Some(tls) if self.target.secure => {
                let stream = tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    tls.connector().connect(tls.server_name(), tcp),
                )
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "tls handshake timed out")
                })??;
                Ok(Box::new(stream))
            }
            _ => Ok(Box::new(tcp)),
        }
    }

    async fn dial_tcp(&self) -> std::io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&self.target.addr)
            .await?
            .filter(|a| match self.target.family {
                AddrFamily::Any => true,
                AddrFamily::V4 => a.is_ipv4(),
                AddrFamily::V6 => a.is_ipv6(),
            })
            .collect();

        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {}", self.target.addr),
        );
        for addr in addrs {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(true)?;
            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl Deliverer for NetDeliverer {
    async fn deliver(&self, msg: &Message) -> bool {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return false;
        };
        let id = self.counter.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        let result = match tokio::time::timeout(ACK_TIMEOUT, conn.exchange(msg, id)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(ACK_TIMEOUT)),
        };
        match result {
            Ok(()) => {
                *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = start.elapsed();
                true
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "delivery failed, dropping connection");
                guard.take();
                drop(guard);
                self.report(RouteStatus::Down);
                false
            }
        }
    }

    fn set_status_callback(&self, callback: StatusCallback) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = callback;
    }

    fn url(&self) -> &str {
        &self.url
    }
}
