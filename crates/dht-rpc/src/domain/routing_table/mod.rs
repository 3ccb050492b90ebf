//! K-bucket routing table keyed by XOR distance.

mod bucket;
mod table;


pub use table::{Insertion, RoutingTable};
