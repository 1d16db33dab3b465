//! Wire format for the node-network multicast replication datagram.
//!
//! A datagram is a 32-byte header (sender UUID, object record count, 15
//! reserved bytes) followed by zero or more object records, each an 8-byte
//! record header plus its payload. See the crate-level constants for sizes.
//!
//! All multi-byte integers are little-endian. The original C sources this
//! protocol is based on left the wire integers host-endian (undefined
//! across architectures); little-endian is the resolution picked here.
#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ops::Range;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

/// Maximum size of a single datagram.
pub const MTU: usize = 1500;
/// Size of the datagram header: 16-byte UUID + 1-byte count + 15 reserved.
pub const HEADER_SIZE: usize = 32;
/// Size of a single object record header (excludes payload).
pub const RECORD_HEADER_SIZE: usize = 8;
/// Local object slots per node, and per remote node in the directory.
pub const MAX_OBJECTS: usize = 32;

/// The object-type tag carried in a record header.
///
/// A newtype over the raw `u16` rather than a closed enum: the wire format
/// reserves `0x8000` and above for user-defined types, so unknown values
/// must round-trip rather than be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKind(pub u16);

impl ObjectKind {
    pub const RAW: Self = Self(0x0000);
    pub const TOUCH: Self = Self(0x0001);
    pub const GYRO: Self = Self(0x0002);
    pub const COLOUR: Self = Self(0x0003);
    pub const LIGHT: Self = Self(0x0004);
    pub const ULTRASONIC: Self = Self(0x0005);
    pub const TACHO_MOTOR: Self = Self(0x0400);
    pub const COLOUR_LIGHT: Self = Self(0x0401);
    /// Start of the user-defined range; every value `>=` this is a user type.
    pub const USER_BASE: u16 = 0x8000;

    #[must_use]
    pub fn is_user_defined(self) -> bool {
        self.0 >= Self::USER_BASE
    }
}

impl From<u16> for ObjectKind {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<ObjectKind> for u16 {
    fn from(value: ObjectKind) -> Self {
        value.0
    }
}

/// Header of a single object record on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub idx: u16,
    pub kind: ObjectKind,
    pub offset: u16,
    pub size: u16,
}

impl RecordHeader {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.idx);
        dst.put_u16_le(self.kind.0);
        dst.put_u16_le(self.offset);
        dst.put_u16_le(self.size);
    }

    fn decode(mut bytes: &[u8]) -> Self {
        let idx = bytes.get_u16_le();
        let kind = ObjectKind(bytes.get_u16_le());
        let offset = bytes.get_u16_le();
        let size = bytes.get_u16_le();
        Self {
            idx,
            kind,
            offset,
            size,
        }
    }
}

/// A decoded record borrowing its payload from the source datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView<'a> {
    pub header: RecordHeader,
    pub payload: &'a [u8],
}

/// A fully-validated, borrowed view of an inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDatagram<'a> {
    pub sender: Uuid,
    pub records: Vec<RecordView<'a>>,
}

/// Errors raised while appending a record to an in-progress datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AppendError {
    /// The record would not fit before the next flush; caller must flush
    /// and retry.
    #[error("record does not fit in the remaining datagram space")]
    BufferFull,
}

/// Writes the 32-byte datagram header (sender UUID, zero record count, 15
/// reserved bytes) to an empty buffer.
pub fn encode_header(dst: &mut BytesMut, sender: Uuid) {
    debug_assert!(dst.is_empty());
    dst.put_slice(sender.as_bytes());
    dst.put_u8(0);
    dst.put_bytes(0, 15);
}

/// Overwrites the one-byte object-record count field of an already-encoded
/// header in place.
pub fn set_object_count(dst: &mut BytesMut, count: u8) {
    dst[16] = count;
}

/// Appends one object record (header + payload) to `dst`, which must
/// already contain an encoded datagram header followed by zero or more
/// complete records. Fails with [`AppendError::BufferFull`] without
/// mutating `dst` when the record would push the datagram past [`MTU`].
pub fn append_record(dst: &mut BytesMut, header: RecordHeader, payload: &[u8]) -> Result<(), AppendError> {
    debug_assert_eq!(header.size as usize, payload.len());
    let needed = RECORD_HEADER_SIZE + payload.len();
    if dst.len() + needed > MTU {
        return Err(AppendError::BufferFull);
    }
    header.encode(dst);
    dst.put_slice(payload);
    Ok(())
}

struct RecordLayout {
    header: RecordHeader,
    payload: Range<usize>,
}

/// Walks the record stream of a datagram, validating it in full before
/// returning anything. Returns `None` for any truncated or ill-formed
/// datagram rather than yielding a partial record set.
fn layout(bytes: &[u8]) -> Option<(Uuid, Vec<RecordLayout>)> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let sender = Uuid::from_slice(&bytes[0..16]).ok()?;
    let count = bytes[16];

    let mut records = Vec::with_capacity(count as usize);
    let mut offset = HEADER_SIZE;
    for _ in 0..count {
        let header_end = offset.checked_add(RECORD_HEADER_SIZE)?;
        if header_end > bytes.len() {
            return None;
        }
        let header = RecordHeader::decode(&bytes[offset..header_end]);
        let payload_end = header_end.checked_add(header.size as usize)?;
        if payload_end > bytes.len() {
            return None;
        }
        records.push(RecordLayout {
            header,
            payload: header_end..payload_end,
        });
        offset = payload_end;
    }
    Some((sender, records))
}

/// Parses a full datagram into its header and records, borrowing payloads
/// from `bytes`. Returns `None` if the datagram is truncated or otherwise
/// ill-formed; such datagrams are discarded whole by the caller.
pub fn parse(bytes: &[u8]) -> Option<ParsedDatagram<'_>> {
    let (sender, records) = layout(bytes)?;
    let records = records
        .into_iter()
        .map(|r| RecordView {
            header: r.header,
            payload: &bytes[r.payload],
        })
        .collect();
    Some(ParsedDatagram { sender, records })
}

/// An owned record, sharing its payload's backing allocation with the
/// datagram it was decoded from via [`Bytes::slice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedRecord {
    pub header: RecordHeader,
    pub payload: Bytes,
}

/// An owned, fully-validated inbound datagram, suitable for crossing an
/// `mpsc` channel into the node actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub sender: Uuid,
    pub records: Vec<OwnedRecord>,
}

/// A finalised outbound datagram ready to be written to the socket.
#[derive(Debug, Clone)]
pub struct Outbound(pub Bytes);

/// [`tokio_util::codec`] adapter pairing [`Inbound`]/[`Outbound`] with a
/// `UdpFramed`-driven socket. Each `decode` call consumes exactly one
/// received datagram (UDP is message-oriented, so `UdpFramed` hands the
/// whole datagram to the buffer before calling `decode` once).
#[derive(Debug, Default)]
pub struct DatagramCodec;

impl Encoder<Outbound> for DatagramCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(&item.0);
        Ok(())
    }
}

impl Decoder for DatagramCodec {
    type Item = Inbound;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let bytes = src.split().freeze();
        let Some((sender, records)) = layout(&bytes) else {
            return Ok(None);
        };
        let records = records
            .into_iter()
            .map(|r| OwnedRecord {
                header: r.header,
                payload: bytes.slice(r.payload),
            })
            .collect();
        Ok(Some(Inbound { sender, records }))
    }
}
