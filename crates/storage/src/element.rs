//! Data element format.

use cellstore_common::{ContentDigest, ExtendedId};
use serde::{Deserialize, Serialize};

/// What a data element holds. Filters in QueryChanges select on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataElementKind {
    StorageIndex,
    StorageManifest,
    CellManifest,
    RevisionManifest,
    ObjectGroup,
}

/// An immutable payload keyed by an `ExtendedId`.
///
/// `references` are the outgoing edges of the element in the object graph;
/// a committed storage index must be able to reach every one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataElement {
    pub id: ExtendedId,
    pub kind: DataElementKind,
    #[serde(default)]
    pub references: Vec<ExtendedId>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl DataElement {
    pub fn new(
        id: ExtendedId,
        kind: DataElementKind,
        references: Vec<ExtendedId>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id,
            kind,
            references,
            payload,
        }
    }

    /// An object-group leaf holding raw bytes.
    pub fn blob(id: ExtendedId, payload: Vec<u8>) -> Self {
        Self::new(id, DataElementKind::ObjectGroup, Vec::new(), payload)
    }

    /// Digest over kind, references and payload. Two elements with the same
    /// id and the same digest name the same content.
    pub fn digest(&self) -> ContentDigest {
        let kind = [self.kind as u8];
        let refs: Vec<u8> = self
            .references
            .iter()
            .flat_map(|r| {
                r.guid()
                    .as_bytes()
                    .iter()
                    .copied()
                    .chain(r.n().to_le_bytes())
                    .collect::<Vec<u8>>()
            })
            .collect();
        ContentDigest::of_parts([kind.as_slice(), refs.as_slice(), self.payload.as_slice()])
    }

    /// Approximate wire size, used for query page caps.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64 + 20 * self.references.len() as u64 + 20
    }
}
