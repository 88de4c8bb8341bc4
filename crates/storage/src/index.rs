//! Storage index and per-file head records.
//!
//! A `StorageIndex` maps cell keys to data element ids. It is never mutated
//! after commit: every successful write produces a new index with a fresh
//! id, and the index itself is persisted as a `StorageIndex` data element.

use crate::element::{DataElement, DataElementKind};
use cellstore_common::{CellKey, ExtendedId, UserName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageIndex {
    /// Version token of this index.
    pub id: ExtendedId,
    pub mappings: BTreeMap<CellKey, ExtendedId>,
}

impl StorageIndex {
    /// The index of a file that has never been written.
    pub fn empty() -> Self {
        Self {
            id: ExtendedId::NIL,
            mappings: BTreeMap::new(),
        }
    }

    pub fn new(id: ExtendedId, mappings: BTreeMap<CellKey, ExtendedId>) -> Self {
        Self { id, mappings }
    }

    pub fn get(&self, key: &CellKey) -> Option<ExtendedId> {
        self.mappings.get(key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Distinct element ids this index points at.
    pub fn roots(&self) -> BTreeSet<ExtendedId> {
        self.mappings.values().copied().collect()
    }

    /// Encode as a data element whose references are the mapped ids.
    pub fn to_element(&self) -> Result<DataElement, serde_json::Error> {
        let payload = serde_json::to_vec(&self.mappings)?;
        Ok(DataElement::new(
            self.id,
            DataElementKind::StorageIndex,
            self.roots().into_iter().collect(),
            payload,
        ))
    }

    /// Decode an index previously produced by [`StorageIndex::to_element`].
    pub fn from_element(element: &DataElement) -> Option<Self> {
        if element.kind != DataElementKind::StorageIndex {
            return None;
        }
        let mappings = serde_json::from_slice(&element.payload).ok()?;
        Some(Self {
            id: element.id,
            mappings,
        })
    }
}

/// The committed state of one partition of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionHead {
    /// Current storage index id.
    pub index_id: ExtendedId,
    /// Superseded index ids, oldest first, bounded by the retention setting.
    #[serde(default)]
    pub history: Vec<ExtendedId>,
}

impl PartitionHead {
    /// Every index id this head keeps alive.
    pub fn live_indexes(&self) -> impl Iterator<Item = ExtendedId> + '_ {
        self.history
            .iter()
            .copied()
            .chain(std::iter::once(self.index_id))
    }

    /// Whether `id` is the current or a retained index of this partition.
    pub fn knows(&self, id: &ExtendedId) -> bool {
        self.index_id == *id || self.history.contains(id)
    }

    /// Advance to `next`, keeping at most `retain` superseded versions.
    pub fn advance(&mut self, next: ExtendedId, retain: usize) {
        self.history.push(self.index_id);
        if self.history.len() > retain {
            let excess = self.history.len() - retain;
            self.history.drain(..excess);
        }
        self.index_id = next;
    }
}

/// Committed state of one file: one head per partition plus file properties.
/// Persisted as a whole on every commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHead {
    pub url: String,
    /// File version; changes on every committed write to any partition.
    pub etag: String,
    pub created_ms: u64,
    pub modified_ms: u64,
    pub modified_by: Option<UserName>,
    pub partitions: BTreeMap<Uuid, PartitionHead>,
}

impl FileHead {
    pub fn new(url: String, now_ms: u64) -> Self {
        Self {
            url,
            etag: String::new(),
            created_ms: now_ms,
            modified_ms: now_ms,
            modified_by: None,
            partitions: BTreeMap::new(),
        }
    }

    pub fn partition(&self, partition: &Uuid) -> Option<&PartitionHead> {
        self.partitions.get(partition)
    }

    /// Every index id kept alive by this file.
    pub fn live_indexes(&self) -> Vec<ExtendedId> {
        self.partitions
            .values()
            .flat_map(|p| p.live_indexes())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_element_roundtrip() {
        let mut mappings = BTreeMap::new();
        let shared = ExtendedId::random();
        mappings.insert(ExtendedId::random(), shared);
        mappings.insert(ExtendedId::random(), shared);
        mappings.insert(ExtendedId::random(), ExtendedId::random());
        let index = StorageIndex::new(ExtendedId::random(), mappings);

        let element = index.to_element().unwrap();
        assert_eq!(element.kind, DataElementKind::StorageIndex);
        // references are deduplicated
        assert_eq!(element.references.len(), 2);

        let decoded = StorageIndex::from_element(&element).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_from_element_rejects_other_kinds() {
        let blob = DataElement::blob(ExtendedId::random(), b"{}".to_vec());
        assert!(StorageIndex::from_element(&blob).is_none());
    }

    #[test]
    fn test_partition_head_retention() {
        let first = ExtendedId::random();
        let mut head = PartitionHead {
            index_id: first,
            history: Vec::new(),
        };
        let ids: Vec<ExtendedId> = (0..5).map(|_| ExtendedId::random()).collect();
        for id in &ids {
            head.advance(*id, 2);
        }
        assert_eq!(head.index_id, ids[4]);
        assert_eq!(head.history, vec![ids[2], ids[3]]);
        assert!(head.knows(&ids[3]));
        assert!(!head.knows(&first));
        assert_eq!(head.live_indexes().count(), 3);
    }
}
