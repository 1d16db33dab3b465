//! The node context: binds the wire codec, transmit buffer, object table,
//! directory, and socket driver together behind the public API.
//!
//! The original C-shaped API splits bringing up the socket from arming the
//! event loop. Here both collapse into [`NodeHandle::spawn`]: there is no
//! useful intermediate state between "socket bound and joined" and "the
//! actor task is polling it" once the actor model owns the event loop, so
//! one async constructor does both and hands back a handle that is always
//! ready to use.
//!
//! Concurrency model: all mutable state (`ObjectTable`, `TxBuffer`,
//! `Directory`) lives on one spawned task, the [`NodeActor`]. Every public
//! method on [`NodeHandle`] is a request sent over an `mpsc` channel and
//! answered over a `oneshot`, the same single-threaded cooperative work
//! queue the original runs, carried over to `tokio`.
//!
//! Coalescing can't be reproduced by racing a self-sent message against
//! the command channel: every public method round-trips through its
//! `oneshot` reply, so a caller issuing updates one at a time via
//! sequential `.await`s never has a second command sitting in `cmd_rx`
//! for a just-processed update to "ride along" with — there is nothing
//! there yet to ride with. Instead the first update to a clean buffer
//! arms a short deadline ([`NodeConfig::flush_debounce`]); the buffer
//! only flushes once that deadline elapses, so any further updates that
//! land in the meantime land in the same datagram.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nn_wire::{DatagramCodec, ObjectKind, Outbound};
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::udp::UdpFramed;
use uuid::Uuid;

use crate::directory::{Directory, ObjectEntry};
use crate::error::{NnError, RegisterError, RequestError, UpdateError};
use crate::object_table::ObjectTable;
use crate::tx_buffer::TxBuffer;

/// The multicast group every node joins and sends to.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 1, 2);

/// Socket and queue configuration for one node.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    /// UDP port to bind and to send to; same port is used both ways.
    pub port: u16,
    /// Multicast group to join. Defaults to [`MULTICAST_GROUP`]; overriding
    /// it is mainly useful to run more than one independent network on the
    /// same host in tests.
    pub group: Ipv4Addr,
    /// Local interface to join on. `INADDR_ANY`, matching the original's
    /// `IP_MULTICAST_IF = INADDR_ANY`.
    pub interface: Ipv4Addr,
    /// Depth of the command channel between [`NodeHandle`] and the actor.
    pub command_capacity: usize,
    /// How long the transmit buffer waits after its first dirty write
    /// before flushing, giving any updates issued in quick succession a
    /// chance to land in the same datagram.
    pub flush_debounce: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 0,
            group: MULTICAST_GROUP,
            interface: Ipv4Addr::UNSPECIFIED,
            command_capacity: 256,
            flush_debounce: Duration::from_millis(5),
        }
    }
}

impl NodeConfig {
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }
}

enum Command {
    AddObject {
        kind: ObjectKind,
        size: u16,
        reply: oneshot::Sender<Result<u8, RegisterError>>,
    },
    UpdateObject {
        idx: u8,
        offset: u16,
        payload: Bytes,
        reply: oneshot::Sender<Result<(), UpdateError>>,
    },
    ReadUuids {
        after: Option<Uuid>,
        reply: oneshot::Sender<Option<Uuid>>,
    },
    ReadObjects {
        uuid: Uuid,
        prev_idx: Option<u8>,
        reply: oneshot::Sender<Option<Arc<ObjectEntry>>>,
    },
}

/// A cloneable, cheap-to-share handle to a running node. Dropping the last
/// clone lets the actor task's channel close and the task exit.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    uuid: Uuid,
    cmd_tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    /// Binds the multicast socket, joins [`NodeConfig::group`], and spawns
    /// the actor task that owns the rest of the node's state.
    pub async fn spawn(uuid: Uuid, config: NodeConfig) -> Result<Self, NnError> {
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let socket = Self::bind_socket(bind_addr).map_err(|source| NnError::Bind {
            addr: bind_addr,
            source,
        })?;
        let socket = UdpSocket::from_std(socket).map_err(|source| NnError::Bind {
            addr: bind_addr,
            source,
        })?;
        socket
            .join_multicast_v4(config.group, config.interface)
            .map_err(|source| NnError::JoinMulticast {
                group: config.group,
                source,
            })?;
        tracing::debug!(%uuid, port = config.port, group = %config.group, "node socket bound and joined");

        let send_addr = SocketAddr::from((config.group, config.port));
        let framed = UdpFramed::new(socket, DatagramCodec);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity);

        let actor = NodeActor {
            uuid,
            send_addr,
            framed,
            outbound: VecDeque::new(),
            table: ObjectTable::new(),
            tx_buffer: TxBuffer::new(uuid),
            flush_scheduled: false,
            flush_deadline: Instant::now(),
            flush_debounce: config.flush_debounce,
            directory: Directory::new(),
            cmd_rx,
        };
        tokio::spawn(actor.run());

        Ok(Self { uuid, cmd_tx })
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Builds the listening socket with `SO_REUSEADDR` (and, on unix,
    /// `SO_REUSEPORT`) set before binding, so more than one node can share
    /// a port on the same host — the common case for a group's well-known
    /// port with every node otherwise on its own machine.
    fn bind_socket(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        Ok(socket.into())
    }

    /// Registers a new local object, returning its assigned slot index.
    pub async fn add_object(
        &self,
        kind: ObjectKind,
        size: u16,
    ) -> Result<u8, RequestError<RegisterError>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddObject { kind, size, reply })
            .await
            .map_err(|_| RequestError::ActorGone)?;
        rx.await.map_err(|_| RequestError::ActorGone)?.map_err(Into::into)
    }

    /// Appends a byte-range update for the object at `idx` to the transmit
    /// buffer, scheduling a flush if one is not already pending.
    pub async fn update_object(
        &self,
        idx: u8,
        offset: u16,
        payload: &[u8],
    ) -> Result<(), RequestError<UpdateError>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::UpdateObject {
                idx,
                offset,
                payload: Bytes::copy_from_slice(payload),
                reply,
            })
            .await
            .map_err(|_| RequestError::ActorGone)?;
        rx.await.map_err(|_| RequestError::ActorGone)?.map_err(Into::into)
    }

    /// Returns the UUID after `after` in arrival order, or the first UUID
    /// when `after` is `None`.
    pub async fn read_uuids(&self, after: Option<Uuid>) -> Option<Uuid> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::ReadUuids { after, reply }).await.ok()?;
        rx.await.ok()?
    }

    /// Returns the next non-empty object slot for `uuid` after `prev_idx`.
    pub async fn read_objects(
        &self,
        uuid: Uuid,
        prev_idx: Option<u8>,
    ) -> Option<Arc<ObjectEntry>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ReadObjects {
                uuid,
                prev_idx,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }
}

type Framed = UdpFramed<DatagramCodec>;

struct NodeActor {
    uuid: Uuid,
    send_addr: SocketAddr,
    framed: Framed,
    outbound: VecDeque<Outbound>,
    table: ObjectTable,
    tx_buffer: TxBuffer,
    flush_scheduled: bool,
    /// When the armed flush fires. Only meaningful while `flush_scheduled`
    /// is `true`; left stale otherwise.
    flush_deadline: Instant,
    flush_debounce: Duration,
    directory: Directory,
    cmd_rx: mpsc::Receiver<Command>,
}

impl NodeActor {
    async fn run(mut self) {
        loop {
            let next_send = self.outbound.front().cloned();
            let have_send = next_send.is_some();
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                Some(frame) = self.framed.next() => {
                    match frame {
                        Ok((datagram, _from)) => self.directory.apply_update(datagram),
                        Err(err) => tracing::warn!(error = %err, "multicast recv failed, datagram dropped"),
                    }
                }
                res = Self::send_one(&mut self.framed, next_send, self.send_addr), if have_send => {
                    self.outbound.pop_front();
                    if let Err(err) = res {
                        tracing::warn!(error = %err, "multicast send failed, datagram dropped");
                    }
                }
                () = tokio::time::sleep_until(self.flush_deadline), if self.flush_scheduled => {
                    self.flush();
                }
            }
        }
    }

    /// Sends `item` if present, otherwise never resolves. Only called with
    /// a guard that already established `item.is_some()`; the `None` arm
    /// exists so the match stays exhaustive without panicking.
    async fn send_one(
        framed: &mut Framed,
        item: Option<Outbound>,
        addr: SocketAddr,
    ) -> std::io::Result<()> {
        match item {
            Some(item) => framed.send((item, addr)).await,
            None => std::future::pending().await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddObject { kind, size, reply } => {
                let _ = reply.send(self.table.add(kind, size));
            }
            Command::UpdateObject {
                idx,
                offset,
                payload,
                reply,
            } => {
                let result = self.update_object(idx, offset, &payload);
                let _ = reply.send(result);
            }
            Command::ReadUuids { after, reply } => {
                let _ = reply.send(self.directory.next_uuid(after));
            }
            Command::ReadObjects {
                uuid,
                prev_idx,
                reply,
            } => {
                let _ = reply.send(self.directory.next_object(uuid, prev_idx));
            }
        }
    }

    fn update_object(&mut self, idx: u8, offset: u16, payload: &[u8]) -> Result<(), UpdateError> {
        let Some(obj) = self.table.get(idx) else {
            // An idx the caller never registered: nothing to send. A
            // well-behaved caller only updates objects it registered.
            tracing::debug!(idx, "update_object for unregistered idx, ignored");
            return Ok(());
        };
        let kind = obj.kind;

        if self.tx_buffer.append(idx, kind, offset, payload).is_err() {
            self.flush();
            self.tx_buffer
                .append(idx, kind, offset, payload)
                .map_err(|_| UpdateError::Oversize)?;
        }

        if !self.flush_scheduled {
            self.flush_scheduled = true;
            self.flush_deadline = Instant::now() + self.flush_debounce;
        }
        Ok(())
    }

    fn flush(&mut self) {
        self.flush_scheduled = false;
        if self.tx_buffer.is_empty() {
            return;
        }
        let bytes = self.tx_buffer.finalise();
        self.tx_buffer.reset();
        tracing::debug!(uuid = %self.uuid, len = bytes.len(), "flushing coalesced datagram");
        self.outbound.push_back(Outbound(bytes));
    }
}
