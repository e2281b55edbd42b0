pub mod channel;
pub mod engine;
pub mod matcher;
pub mod message;

pub use channel::Channel;
pub use engine::Router;

#[cfg(test)]
pub(crate) mod testing;
