//! Domain error types.
//!
//! Kept as small, closed `thiserror` enums rather than a type-erased
//! `BoxError` — the node-network core has a fixed, enumerable set of
//! failure modes and callers are expected to match on them (`Full` to
//! back off registering objects, `Oversize` to shrink a payload, and so
//! on), unlike a generic middleware boundary.

use std::io;

/// Failure to bring up the socket driver during [`crate::NodeHandle::spawn`].
#[derive(Debug, thiserror::Error)]
pub enum NnError {
    #[error("failed to bind multicast socket on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to join multicast group {group}: {source}")]
    JoinMulticast {
        group: std::net::Ipv4Addr,
        #[source]
        source: io::Error,
    },
}

/// Wraps a component-level error with the one extra failure mode that
/// crossing the actor's channel can introduce: the node task is gone.
#[derive(Debug, thiserror::Error)]
pub enum RequestError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Failed(#[from] E),
    #[error("node actor shut down before completing the request")]
    ActorGone,
}

/// Failure to register a new local object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("all {} local object slots are in use", nn_wire::MAX_OBJECTS)]
    Full,
}

/// Failure to append an update to the transmit buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error("record does not fit in a single datagram even with an empty buffer")]
    Oversize,
}
