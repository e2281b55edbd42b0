//! The capability set the router needs from a live connection.
//!
//! Two implementations exist: `transport::IoChannel` for a socket attached to
//! the gateway, and `remote::RemoteSite` for a configured peer site.

use tokio::sync::mpsc;

use crate::broker::message::{EndPoint, Message, SiteInfo};

pub trait Channel: Send + Sync {
    /// Whether this channel's subscriptions select `msg`.
    fn listening_for(&self, msg: &Message) -> bool;

    /// Bounded queue of messages headed out through this channel.
    fn send_queue(&self) -> mpsc::Sender<Message>;

    /// Messages arriving from this channel toward the router. Yields the
    /// receiver once; later calls return `None`.
    fn recv(&self) -> Option<mpsc::Receiver<Message>>;

    /// Stop the channel's tasks and release its connection. Idempotent.
    fn close(&self);

    /// Site description when the channel stands for a remote site.
    fn site_info(&self) -> Option<SiteInfo>;

    /// Source endpoint announced by the peer, if any.
    fn endpoint(&self) -> Option<EndPoint>;

    /// Site id of a peer gateway on the other end of this channel.
    fn peer_site(&self) -> Option<u32> {
        None
    }

    fn name(&self) -> String;

    fn debug_json(&self) -> serde_json::Value;
}
