//! Node-network: UDP multicast object replication between peers on a LAN.
//!
//! Each node owns a set of local objects (sensor readings, actuator
//! state, arbitrary user payloads) and periodically multicasts the parts
//! that changed. Every node listens on the same group and maintains a
//! directory mirroring every other node's objects as datagrams arrive.
//! There is no handshake and no reliability layer: a node that misses a
//! datagram just keeps the last value it saw until the next update
//! covers the same byte range.
//!
//! [`NodeHandle`] is the entry point: [`NodeHandle::spawn`] binds the
//! socket, joins the multicast group, and starts the background task
//! that owns all node state.

mod directory;
mod error;
mod node;
mod object_table;
mod tx_buffer;

pub use directory::ObjectEntry;
pub use error::{NnError, RegisterError, RequestError, UpdateError};
pub use node::{NodeConfig, NodeHandle, MULTICAST_GROUP};
pub use nn_wire::ObjectKind;
