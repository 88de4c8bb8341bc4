//! Fragments: pieces of one large data element.
//!
//! A large element can travel as several fragments, either because a query
//! page cap split it or because a client uploaded it in pieces. The
//! assembler rebuilds the element once every byte is covered.

use crate::element::{DataElement, DataElementKind};
use cellstore_common::ExtendedId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Largest element the assembler will reserve space for.
pub const MAX_ELEMENT_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub element_id: ExtendedId,
    pub kind: DataElementKind,
    #[serde(default)]
    pub references: Vec<ExtendedId>,
    /// Byte offset of `bytes` within the element payload.
    pub offset: u64,
    /// Length of the complete payload.
    pub total_len: u64,
    pub bytes: Vec<u8>,
}

impl Fragment {
    /// Cut the byte range `[offset, offset + max_len)` out of `element`.
    pub fn split(element: &DataElement, offset: u64, max_len: u64) -> Self {
        let total = element.payload.len() as u64;
        let start = offset.min(total);
        let end = start.saturating_add(max_len).min(total);
        Self {
            element_id: element.id,
            kind: element.kind,
            references: element.references.clone(),
            offset: start,
            total_len: total,
            bytes: element.payload[start as usize..end as usize].to_vec(),
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.bytes.len() as u64
    }

    pub fn is_last(&self) -> bool {
        self.end() == self.total_len
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment of {id} at {offset}+{len} exceeds total length {total}")]
    OutOfRange {
        id: ExtendedId,
        offset: u64,
        len: u64,
        total: u64,
    },
    #[error("fragment of {id} disagrees with earlier fragments on kind, references or length")]
    HeaderMismatch { id: ExtendedId },
    #[error("fragment of {id} overlaps earlier bytes at {offset} with different content")]
    ConflictingBytes { id: ExtendedId, offset: u64 },
}

#[derive(Debug)]
struct Pending {
    kind: DataElementKind,
    references: Vec<ExtendedId>,
    total_len: u64,
    buf: Vec<u8>,
    /// Covered byte ranges, sorted and merged.
    covered: Vec<(u64, u64)>,
}

impl Pending {
    fn is_complete(&self) -> bool {
        self.total_len == 0 || self.covered == [(0, self.total_len)]
    }

    fn cover(&mut self, start: u64, end: u64) {
        if start == end {
            return;
        }
        self.covered.push((start, end));
        self.covered.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.covered.len());
        for &(s, e) in &self.covered {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.covered = merged;
    }
}

/// Rebuilds data elements from fragments arriving in any order.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    pending: HashMap<ExtendedId, Pending>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment. Returns the element once all its bytes are present.
    pub fn add(&mut self, fragment: Fragment) -> Result<Option<DataElement>, FragmentError> {
        let id = fragment.element_id;
        let len = fragment.bytes.len() as u64;
        if fragment.total_len > MAX_ELEMENT_BYTES
            || fragment.offset.saturating_add(len) > fragment.total_len
        {
            return Err(FragmentError::OutOfRange {
                id,
                offset: fragment.offset,
                len,
                total: fragment.total_len,
            });
        }

        let pending = self.pending.entry(id).or_insert_with(|| Pending {
            kind: fragment.kind,
            references: fragment.references.clone(),
            total_len: fragment.total_len,
            buf: vec![0u8; fragment.total_len as usize],
            covered: Vec::new(),
        });

        if pending.kind != fragment.kind
            || pending.references != fragment.references
            || pending.total_len != fragment.total_len
        {
            return Err(FragmentError::HeaderMismatch { id });
        }

        let start = fragment.offset;
        let end = start + len;
        for &(s, e) in &pending.covered {
            let lo = s.max(start);
            let hi = e.min(end);
            if lo < hi {
                let existing = &pending.buf[lo as usize..hi as usize];
                let incoming = &fragment.bytes[(lo - start) as usize..(hi - start) as usize];
                if existing != incoming {
                    return Err(FragmentError::ConflictingBytes { id, offset: lo });
                }
            }
        }

        pending.buf[start as usize..end as usize].copy_from_slice(&fragment.bytes);
        pending.cover(start, end);

        if !pending.is_complete() {
            return Ok(None);
        }
        let done = self
            .pending
            .remove(&id)
            .map(|p| DataElement::new(id, p.kind, p.references, p.buf));
        Ok(done)
    }

    /// Ids of elements still missing bytes.
    pub fn incomplete(&self) -> Vec<ExtendedId> {
        self.pending.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
