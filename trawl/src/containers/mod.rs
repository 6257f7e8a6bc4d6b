//! Containers tuned for capture-time appends

pub mod block_chain;

pub use block_chain::{BlockChain, DEFAULT_BLOCK_CAPACITY};
