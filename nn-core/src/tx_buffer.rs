//! The coalescing transmit buffer.

use bytes::{Bytes, BytesMut};
use nn_wire::{append_record, encode_header, set_object_count, AppendError, ObjectKind, RecordHeader, MTU};
use uuid::Uuid;

/// Accumulates object-delta records from the local node into a single
/// in-progress datagram, bounded to [`MTU`].
#[derive(Debug)]
pub(crate) struct TxBuffer {
    sender: Uuid,
    buf: BytesMut,
    object_count: u8,
}

impl TxBuffer {
    pub(crate) fn new(sender: Uuid) -> Self {
        let mut buf = BytesMut::with_capacity(MTU);
        encode_header(&mut buf, sender);
        Self {
            sender,
            buf,
            object_count: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.object_count == 0
    }

    /// Clears the buffer back to a freshly-encoded empty header, as if
    /// just constructed.
    pub(crate) fn reset(&mut self) {
        self.buf.clear();
        encode_header(&mut self.buf, self.sender);
        self.object_count = 0;
    }

    /// Appends one record. Returns [`AppendError::BufferFull`] when the
    /// record does not fit in the remaining space; the caller is expected
    /// to flush and retry.
    pub(crate) fn append(
        &mut self,
        idx: u8,
        kind: ObjectKind,
        offset: u16,
        payload: &[u8],
    ) -> Result<(), AppendError> {
        let header = RecordHeader {
            idx: u16::from(idx),
            kind,
            offset,
            size: payload.len() as u16,
        };
        append_record(&mut self.buf, header, payload)?;
        self.object_count += 1;
        set_object_count(&mut self.buf, self.object_count);
        Ok(())
    }

    /// Returns the encoded bytes of the datagram as it currently stands,
    /// without resetting the buffer — the caller resets separately once
    /// the bytes have been handed to the socket driver.
    pub(crate) fn finalise(&self) -> Bytes {
        self.buf.clone().freeze()
    }
}
