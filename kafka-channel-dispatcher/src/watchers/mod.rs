//! K8s watchers.

mod channel;
mod queue;

pub use channel::ChannelWatcher;
