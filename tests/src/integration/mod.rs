//! Cross-node scenarios over loopback UDP.

mod bootstrap;
mod convergence;
mod nat;
mod sleep;
mod storage;
mod timeouts;
