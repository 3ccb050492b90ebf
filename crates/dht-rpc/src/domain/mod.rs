//! Pure protocol state: identifiers, peers, tokens, and the routing
//! table. Nothing in this layer performs I/O.

pub mod id;
pub mod peer;
pub mod routing_table;
pub mod token;

pub use id::{bucket_index, random_id_in_bucket, Distance, NodeId, ID_BITS, ID_BYTES};
pub use peer::{NodeEntry, Peer};
pub use routing_table::{Insertion, RoutingTable};
pub use token::{Token, TokenManager, TOKEN_LEN};
