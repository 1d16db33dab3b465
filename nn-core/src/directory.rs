//! The UUID-keyed directory of remote nodes and their objects.
//!
//! The C original backs this with slab-allocated entries, an intrusive
//! hash of 256 buckets, and manual reference counting so a pointer handed
//! out to a caller survives concurrent mutation. None of that is needed
//! here: the directory lives inside a single actor task (see
//! [`crate::node`]), so there is exactly one owner of the
//! [`indexmap::IndexMap`] at any instant, and [`std::sync::Arc`] gives a
//! handed-out [`ObjectEntry`] the same lifetime guarantee the original's
//! refcounting provides, for free — the last clone's `Drop` *is* the
//! release call. Object slots are replaced wholesale on update rather than
//! mutated in place, so a handle taken before an update keeps reading its
//! own consistent snapshot afterwards.

use std::sync::Arc;

use indexmap::IndexMap;
use nn_wire::{Inbound, ObjectKind, MAX_OBJECTS};
use uuid::Uuid;

/// A remote node's object, as last reconciled from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub uuid: Uuid,
    pub idx: u8,
    pub kind: ObjectKind,
    /// High-water mark across all applied ranges.
    pub size: u32,
    pub payload: Box<[u8]>,
}

#[derive(Debug, Default)]
struct UuidEntry {
    objects: [Option<Arc<ObjectEntry>>; MAX_OBJECTS],
}

/// The process-local mirror of every other node's objects. Owned
/// exclusively by one [`crate::node::NodeActor`]; see the module docs for
/// why no locking is needed.
#[derive(Debug, Default)]
pub(crate) struct Directory {
    entries: IndexMap<Uuid, UuidEntry>,
}

impl Directory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reconciles one inbound datagram into the directory: creates the
    /// sender's entry if unseen, then applies each record in order.
    /// Records naming a slot outside `0..32` are dropped individually —
    /// framing-level malformation is rejected earlier, by the wire codec,
    /// which discards the whole datagram instead.
    pub(crate) fn apply_update(&mut self, datagram: Inbound) {
        let entry = self.entries.entry(datagram.sender).or_default();
        for record in datagram.records {
            let idx = record.header.idx;
            if idx as usize >= MAX_OBJECTS {
                tracing::debug!(sender = %datagram.sender, idx, "dropping record with out-of-range idx");
                continue;
            }
            let slot = &mut entry.objects[idx as usize];
            let needed = u32::from(record.header.offset) + u32::from(record.header.size);
            let mut payload = match slot {
                Some(existing) if existing.payload.len() as u32 >= needed => existing.payload.clone(),
                Some(existing) => {
                    let mut grown = vec![0u8; needed as usize].into_boxed_slice();
                    grown[..existing.payload.len()].copy_from_slice(&existing.payload);
                    grown
                }
                None => vec![0u8; needed as usize].into_boxed_slice(),
            };
            let start = record.header.offset as usize;
            let end = start + record.header.size as usize;
            payload[start..end].copy_from_slice(&record.payload);

            let size = (slot.as_ref().map_or(0, |e| e.size)).max(needed);
            *slot = Some(Arc::new(ObjectEntry {
                uuid: datagram.sender,
                idx: idx as u8,
                kind: record.header.kind,
                size,
                payload,
            }));
        }
    }

    /// Returns the UUID immediately after `after` in insertion order, or
    /// the first UUID when `after` is `None`. Used by `read_uuids`.
    pub(crate) fn next_uuid(&self, after: Option<Uuid>) -> Option<Uuid> {
        match after {
            None => self.entries.keys().next().copied(),
            Some(uuid) => {
                let pos = self.entries.get_index_of(&uuid)?;
                self.entries.get_index(pos + 1).map(|(uuid, _)| *uuid)
            }
        }
    }

    /// Returns the next non-empty object slot for `uuid` strictly after
    /// `prev_idx` (or from slot 0 when `prev_idx` is `None`). An unknown
    /// UUID is just `None` here, same as any other not-found case.
    pub(crate) fn next_object(&self, uuid: Uuid, prev_idx: Option<u8>) -> Option<Arc<ObjectEntry>> {
        let start = match prev_idx {
            None => 0u8,
            Some(idx) => idx.checked_add(1)?,
        };
        (start..MAX_OBJECTS as u8).find_map(|idx| self.object_at(uuid, idx))
    }

    /// Looks up a single known slot directly, bypassing the ascending scan
    /// `next_object` does. Used there per candidate index, and directly by
    /// tests that want one specific slot without walking from the start.
    pub(crate) fn object_at(&self, uuid: Uuid, idx: u8) -> Option<Arc<ObjectEntry>> {
        if idx as usize >= MAX_OBJECTS {
            return None;
        }
        self.entries.get(&uuid)?.objects[idx as usize].clone()
    }

    #[cfg(test)]
    pub(crate) fn uuid_count(&self) -> usize {
        self.entries.len()
    }
}
