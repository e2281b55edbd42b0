//! Listening sockets that turn accepted connections into router channels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Router;
use crate::transport::io_channel::IoChannel;
use crate::transport::tls::TlsContext;
use crate::utils::error::GatewayError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

async fn bind(addr: &str) -> Result<TcpListener, GatewayError> {
    TcpListener::bind(addr).await.map_err(|source| GatewayError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Accept loop shared by both acceptors. `attach` takes ownership of each
/// accepted socket.
async fn accept_loop<F>(listener: TcpListener, cancel: CancellationToken, mut attach: F)
where
    F: FnMut(TcpStream, SocketAddr),
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "could not set TCP_NODELAY");
                    }
                    attach(stream, peer);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

/// Plain TCP acceptor.
pub struct NetAcceptor {
    listener: TcpListener,
    router: Arc<Router>,
    cancel: CancellationToken,
}

impl NetAcceptor {
    pub async fn bind(
        addr: &str,
        router: Arc<Router>,
        cancel: CancellationToken,
    ) -> Result<Self, GatewayError> {
        let listener = bind(addr).await?;
        info!(addr, "listening");
        Ok(Self {
            listener,
            router,
            cancel,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        let Self {
            listener,
            router,
            cancel,
        } = self;
        let local_site = router.local_id();
        let scope = cancel.clone();
        accept_loop(listener, cancel, move |stream, peer| {
            debug!(%peer, "accepted connection");
            let channel = IoChannel::spawn(stream, peer.to_string(), local_site, scope.child_token());
            router.add_channel(channel);
        })
        .await;
        info!("acceptor stopped");
    }
}

/// TLS acceptor. Requires a client certificate signed by the configured CA.
pub struct TlsNetAcceptor {
    listener: TcpListener,
    tls: TlsAcceptor,
    router: Arc<Router>,
    cancel: CancellationToken,
}

impl TlsNetAcceptor {
    pub async fn bind(
        addr: &str,
        tls: &TlsContext,
        router: Arc<Router>,
        cancel: CancellationToken,
    ) -> Result<Self, GatewayError> {
        let listener = bind(addr).await?;
        info!(addr, "listening (tls)");
        Ok(Self {
            listener,
            tls: tls.acceptor(),
            router,
            cancel,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        let Self {
            listener,
            tls,
            router,
            cancel,
        } = self;
        let scope = cancel.clone();
        accept_loop(listener, cancel, move |stream, peer| {
            let tls = tls.clone();
            let router = router.clone();
            let token = scope.child_token();
            // Handshake runs off the accept loop.
            tokio::spawn(async move {
                let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, tls.accept(stream)).await;
                match handshake {
                    Ok(Ok(stream)) => {
                        debug!(%peer, "accepted tls connection");
                        let channel =
                            IoChannel::spawn(stream, peer.to_string(), router.local_id(), token);
                        router.add_channel(channel);
                    }
                    Ok(Err(e)) => error!(%peer, error = %e, "tls handshake failed"),
                    Err(_) => warn!(%peer, "tls handshake timed out"),
                }
            });
        })
        .await;
        info!("tls acceptor stopped");
    }
}
