//! In-memory tables for data elements and file heads.
//!
//! Elements are write-once: the first element stored under an id stays
//! until it is reclaimed. File heads are replaced wholesale on each commit.

use crate::element::DataElement;
use crate::index::FileHead;
use crate::wal::WalEntry;
use cellstore_common::{ContentDigest, ExtendedId};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct StoredElement {
    pub element: DataElement,
    pub digest: ContentDigest,
}

#[derive(Debug, Default)]
pub struct Memtable {
    elements: HashMap<ExtendedId, StoredElement>,
    heads: HashMap<String, FileHead>,
    payload_bytes: u64,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ExtendedId) -> Option<&StoredElement> {
        self.elements.get(id)
    }

    pub fn contains(&self, id: &ExtendedId) -> bool {
        self.elements.contains_key(id)
    }

    /// Insert an element unless its id is already taken. Returns whether it
    /// was inserted.
    pub fn insert(&mut self, element: DataElement) -> bool {
        if self.elements.contains_key(&element.id) {
            return false;
        }
        let digest = element.digest();
        self.payload_bytes += element.payload.len() as u64;
        self.elements
            .insert(element.id, StoredElement { element, digest });
        true
    }

    pub fn remove(&mut self, id: &ExtendedId) -> Option<DataElement> {
        let stored = self.elements.remove(id)?;
        self.payload_bytes -= stored.element.payload.len() as u64;
        Some(stored.element)
    }

    pub fn head(&self, url: &str) -> Option<&FileHead> {
        self.heads.get(url)
    }

    pub fn set_head(&mut self, head: FileHead) {
        self.heads.insert(head.url.clone(), head);
    }

    pub fn heads(&self) -> impl Iterator<Item = &FileHead> {
        self.heads.values()
    }

    pub fn element_ids(&self) -> impl Iterator<Item = &ExtendedId> {
        self.elements.keys()
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.heads.len()
    }

    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    /// Apply a WAL entry during replay. Entries arrive in WAL order, so a
    /// later head for the same url wins.
    pub fn load_from_wal(&mut self, entry: WalEntry) {
        match entry {
            WalEntry::Element(element) => {
                self.insert(element);
            }
            WalEntry::Head(head) => self.set_head(head),
            WalEntry::Reclaim { id } => {
                self.remove(&id);
            }
        }
    }
}
