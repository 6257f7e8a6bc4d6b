//! Thread management shared by the service, producers and the listener

pub mod thread_pool;

pub use thread_pool::{Action, ThreadPool, ThreadPoolOptions};
