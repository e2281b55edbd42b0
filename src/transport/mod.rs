//! The `transport` module is responsible for moving framed messages over
//! sockets.
//!
//! It defines the wire codec, the channel that serves one attached
//! connection, the TCP and TLS acceptors that create those channels, and the
//! outbound deliverer used to reach peer gateways.

use tokio::io::{AsyncRead, AsyncWrite};

pub mod acceptor;
pub mod codec;
pub mod deliverer;
pub mod io_channel;
pub mod tls;

pub use acceptor::{NetAcceptor, TlsNetAcceptor};
pub use deliverer::{Deliverer, NetDeliverer};
pub use io_channel::IoChannel;

/// Any bidirectional byte stream a channel or deliverer can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[cfg(test)]
mod tests;
