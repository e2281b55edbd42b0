//! The `remote` module links this gateway to its configured peer sites.
//!
//! Each `RemoteSite` is a router channel backed by a pool of `SendWorker`s,
//! a deliverer per route in each worker, and the durable backlog.

pub mod site;
pub mod worker;

pub use site::{RemoteSite, RemoteSiteOptions};
pub use worker::SendWorker;
