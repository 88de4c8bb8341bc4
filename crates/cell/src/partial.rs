//! Partial puts: changes buffered across several PutChanges sub-requests.
//!
//! Every piece before the last is held here under a server-assigned id and
//! nothing is committed. The last piece carries the real mappings; its
//! elements and fragments are merged with the buffered ones and the whole
//! set goes through the normal put path.

use cellstore_common::{CellErrorCode, ErrorKind};
use cellstore_storage::{DataElement, Fragment, FragmentAssembler};
use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

fn fragments_incomplete() -> ErrorKind {
    ErrorKind::cell(CellErrorCode::FragmentsIncomplete)
}

/// Elements gathered so far for one put.
#[derive(Debug)]
pub struct PendingPut {
    elements: Vec<DataElement>,
    assembler: FragmentAssembler,
    last_touched: Instant,
}

impl Default for PendingPut {
    fn default() -> Self {
        Self {
            elements: Vec::new(),
            assembler: FragmentAssembler::new(),
            last_touched: Instant::now(),
        }
    }
}

impl PendingPut {
    pub fn absorb(
        &mut self,
        elements: Vec<DataElement>,
        fragments: Vec<Fragment>,
    ) -> Result<(), ErrorKind> {
        self.last_touched = Instant::now();
        self.elements.extend(elements);
        for fragment in fragments {
            let done = self.assembler.add(fragment).map_err(|e| {
                tracing::debug!(error = %e, "rejected fragment");
                ErrorKind::cell(CellErrorCode::FragmentInvalid)
            })?;
            if let Some(element) = done {
                self.elements.push(element);
            }
        }
        Ok(())
    }

    /// All elements, provided every fragmented element is complete.
    pub fn into_elements(self) -> Result<Vec<DataElement>, ErrorKind> {
        if !self.assembler.is_empty() {
            tracing::debug!(missing = ?self.assembler.incomplete(), "put ended with incomplete elements");
            return Err(fragments_incomplete());
        }
        Ok(self.elements)
    }
}

/// Pending partial puts of one file.
#[derive(Debug, Default)]
pub struct PartialPuts {
    pending: HashMap<Uuid, PendingPut>,
}

impl PartialPuts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a non-final piece. Starts a new partial put when `id` is None.
    pub fn buffer(
        &mut self,
        id: Option<Uuid>,
        elements: Vec<DataElement>,
        fragments: Vec<Fragment>,
    ) -> Result<Uuid, ErrorKind> {
        let id = match id {
            Some(id) if self.pending.contains_key(&id) => id,
            Some(_) => return Err(fragments_incomplete()),
            None => {
                let id = Uuid::new_v4();
                self.pending.insert(id, PendingPut::default());
                id
            }
        };
        let result = match self.pending.get_mut(&id) {
            Some(put) => put.absorb(elements, fragments),
            None => Err(fragments_incomplete()),
        };
        if let Err(e) = result {
            self.pending.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Take the final piece and return the complete element set.
    ///
    /// With no `id` this is a single-request put whose fragments must be
    /// complete on their own.
    pub fn finish(
        &mut self,
        id: Option<Uuid>,
        elements: Vec<DataElement>,
        fragments: Vec<Fragment>,
    ) -> Result<Vec<DataElement>, ErrorKind> {
        let mut put = match id {
            Some(id) => self.pending.remove(&id).ok_or_else(fragments_incomplete)?,
            None => PendingPut::default(),
        };
        put.absorb(elements, fragments)?;
        put.into_elements()
    }

    /// Drop partial puts untouched for `max_idle`. Returns how many.
    pub fn expire(&mut self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending
            .retain(|_, put| now.duration_since(put.last_touched) < max_idle);
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
