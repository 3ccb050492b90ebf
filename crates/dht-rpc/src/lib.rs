//! # dht-rpc
//!
//! A Kademlia-based DHT substrate carrying application-defined RPC
//! commands over UDP. The crate provides the routing fabric — k-bucket
//! routing table, request/response transport with retries and round-trip
//! tokens, α-parallel iterative lookups with an optional commit phase,
//! and ephemeral/persistent identity management — while applications
//! define what the commands mean.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dht_rpc::{Dht, DhtConfig, DhtEvent};
//!
//! # async fn run() -> Result<(), dht_rpc::DhtError> {
//! let (node, mut events) = Dht::bind(DhtConfig {
//!     bootstrap: vec!["203.0.113.7:49737".parse().unwrap()],
//!     ..DhtConfig::default()
//! })
//! .await?;
//! node.ready().await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let DhtEvent::Request(request) = event {
//!         // Application commands start at dht_rpc::commands::APP_BASE.
//!         request.reply(None);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod identity;
pub mod node;
pub mod query;
pub mod rpc;
pub mod time;
pub mod wire;

pub use config::{DhtConfig, DEFAULT_ALPHA, DEFAULT_K};
pub use domain::{NodeEntry, NodeId, Peer, RoutingTable, Token};
pub use error::{status, DecodeError, DhtError};
pub use node::{
    Dht, DhtEvent, DhtEvents, InboundRequest, NodeStatus, OutboundRequest, RequestOptions,
};
pub use query::{Commit, CommitRequest, Query, QueryOptions, QueryResult, QuerySpec};
pub use rpc::{Reply, SocketSel};
pub use time::{Clock, ManualClock, SystemClock};
pub use wire::{commands, Frame};
