//! Content store: WAL + memtable behind one handle.
//!
//! All writes go through the WAL first, then into the memtable. Elements
//! are immutable once stored; an attempt to store different content under
//! an existing id is reported as a collision and nothing is written.

use crate::element::DataElement;
use crate::index::{FileHead, StorageIndex};
use crate::memtable::Memtable;
use crate::wal::{FsyncPolicy, Wal, WalEntry, WalError};
use cellstore_common::ExtendedId;
use std::collections::{HashSet, VecDeque};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of storing one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Same id, same content. Nothing written.
    AlreadyPresent,
    /// Same id, different content. Nothing written.
    Collision,
}

/// Elements reachable from a set of roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Closure {
    /// Reached ids in breadth-first order, roots first.
    pub reached: Vec<ExtendedId>,
    /// Ids referenced somewhere in the walk that could not be resolved.
    pub missing: Vec<ExtendedId>,
}

impl Closure {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Breadth-first walk over element references.
///
/// `lookup` resolves an id to its element; ids it cannot resolve are
/// reported in `missing` and not descended into. Ids in `skip` are treated
/// as already known: they are neither reported nor descended into.
pub fn walk_references<'a, F>(
    roots: impl IntoIterator<Item = ExtendedId>,
    skip: &HashSet<ExtendedId>,
    lookup: F,
) -> Closure
where
    F: Fn(&ExtendedId) -> Option<&'a DataElement>,
{
    let mut seen: HashSet<ExtendedId> = HashSet::new();
    let mut queue: VecDeque<ExtendedId> = VecDeque::new();
    let mut closure = Closure::default();

    for root in roots {
        if !skip.contains(&root) && seen.insert(root) {
            queue.push_back(root);
        }
    }

    while let Some(id) = queue.pop_front() {
        let Some(element) = lookup(&id) else {
            closure.missing.push(id);
            continue;
        };
        closure.reached.push(id);
        for next in &element.references {
            if !skip.contains(next) && seen.insert(*next) {
                queue.push_back(*next);
            }
        }
    }
    closure
}

/// The content store. All operations are synchronous (blocking I/O);
/// the async boundary is at the caller.
#[derive(Debug)]
pub struct ContentStore {
    memtable: Memtable,
    wal: Wal,
}

impl ContentStore {
    /// Open or create a content store in the given directory.
    pub fn open(data_dir: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join("wal.log");

        let (wal, entries) = Wal::recover(&wal_path, fsync)?;
        let replayed = entries.len();
        let mut memtable = Memtable::new();
        for entry in entries {
            memtable.load_from_wal(entry);
        }

        tracing::info!(
            entries = replayed,
            elements = memtable.len(),
            files = memtable.file_count(),
            "content store opened from WAL at {:?}",
            wal_path
        );

        Ok(Self { memtable, wal })
    }

    pub fn get(&self, id: &ExtendedId) -> Option<&DataElement> {
        self.memtable.get(id).map(|s| &s.element)
    }

    pub fn contains(&self, id: &ExtendedId) -> bool {
        self.memtable.contains(id)
    }

    /// What `put` would report for `element`, without writing.
    pub fn check(&self, element: &DataElement) -> PutOutcome {
        match self.memtable.get(&element.id) {
            None => PutOutcome::Inserted,
            Some(stored) if stored.digest == element.digest() => PutOutcome::AlreadyPresent,
            Some(_) => PutOutcome::Collision,
        }
    }

    /// Store an element. Only `Inserted` writes anything.
    pub fn put(&mut self, element: DataElement) -> Result<PutOutcome, StorageError> {
        let outcome = self.check(&element);
        if outcome == PutOutcome::Inserted {
            let entry = WalEntry::Element(element);
            self.wal.append(&entry)?;
            if let WalEntry::Element(element) = entry {
                self.memtable.insert(element);
            }
        } else if outcome == PutOutcome::Collision {
            tracing::warn!(id = %element.id, "element id reused with different content");
        }
        Ok(outcome)
    }

    /// Load a committed storage index by its version token.
    pub fn load_index(&self, id: &ExtendedId) -> Option<StorageIndex> {
        self.get(id).and_then(StorageIndex::from_element)
    }

    /// Persist a storage index as a data element.
    pub fn put_index(&mut self, index: &StorageIndex) -> Result<PutOutcome, StorageError> {
        self.put(index.to_element()?)
    }

    pub fn head(&self, url: &str) -> Option<&FileHead> {
        self.memtable.head(url)
    }

    pub fn heads(&self) -> impl Iterator<Item = &FileHead> {
        self.memtable.heads()
    }

    /// Make `head` the committed state of its file.
    pub fn commit_head(&mut self, head: FileHead) -> Result<(), StorageError> {
        let entry = WalEntry::Head(head);
        self.wal.append(&entry)?;
        if let WalEntry::Head(head) = entry {
            self.memtable.set_head(head);
        }
        Ok(())
    }

    /// Elements reachable from `roots`, skipping ids in `known`.
    pub fn closure(
        &self,
        roots: impl IntoIterator<Item = ExtendedId>,
        known: &HashSet<ExtendedId>,
    ) -> Closure {
        walk_references(roots, known, |id| self.get(id))
    }

    /// Drop every element not reachable from a live index of any file.
    /// Returns the number of elements reclaimed.
    pub fn reclaim_unreachable(&mut self) -> Result<usize, StorageError> {
        let roots: Vec<ExtendedId> = self
            .memtable
            .heads()
            .flat_map(|h| h.live_indexes())
            .collect();
        let live: HashSet<ExtendedId> = self
            .closure(roots, &HashSet::new())
            .reached
            .into_iter()
            .collect();

        let dead: Vec<ExtendedId> = self
            .memtable
            .element_ids()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();

        for id in &dead {
            self.wal.append(&WalEntry::Reclaim { id: *id })?;
            self.memtable.remove(id);
        }
        if !dead.is_empty() {
            tracing::debug!(reclaimed = dead.len(), "reclaimed unreachable elements");
        }
        Ok(dead.len())
    }

    /// Number of stored elements.
    pub fn element_count(&self) -> usize {
        self.memtable.len()
    }

    pub fn payload_bytes(&self) -> u64 {
        self.memtable.payload_bytes()
    }

    /// WAL entries appended since the store was opened.
    pub fn wal_entries_written(&self) -> u64 {
        self.wal.entries_written()
    }

    /// Sync the WAL to disk (for batch fsync mode).
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.wal.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::DataElementKind;
    use crate::index::PartitionHead;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn node(refs: Vec<ExtendedId>) -> DataElement {
        DataElement::new(
            ExtendedId::random(),
            DataElementKind::CellManifest,
            refs,
            Vec::new(),
        )
    }

    fn commit_file(store: &mut ContentStore, url: &str, root: ExtendedId) -> StorageIndex {
        let mut mappings = BTreeMap::new();
        mappings.insert(ExtendedId::NIL, root);
        let index = StorageIndex::new(ExtendedId::random(), mappings);
        store.put_index(&index).unwrap();
        let mut head = FileHead::new(url.to_string(), 0);
        head.partitions.insert(
            Uuid::nil(),
            PartitionHead {
                index_id: index.id,
                history: Vec::new(),
            },
        );
        store.commit_head(head).unwrap();
        index
    }

    #[test]
    fn test_put_outcomes() {
        let dir = TempDir::new().unwrap();
        let mut store = ContentStore::open(dir.path(), FsyncPolicy::None).unwrap();
        let id = ExtendedId::random();

        let el = DataElement::blob(id, b"v1".to_vec());
        assert_eq!(store.put(el.clone()).unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put(el).unwrap(), PutOutcome::AlreadyPresent);
        assert_eq!(
            store.put(DataElement::blob(id, b"v2".to_vec())).unwrap(),
            PutOutcome::Collision
        );
        // write-once: first content stays
        assert_eq!(store.get(&id).unwrap().payload, b"v1");
        assert_eq!(store.element_count(), 1);
    }

    #[test]
    fn test_crash_recovery() {
        let dir = TempDir::new().unwrap();
        let leaf = DataElement::blob(ExtendedId::random(), b"leaf".to_vec());
        let index;
        {
            let mut store = ContentStore::open(dir.path(), FsyncPolicy::Always).unwrap();
            store.put(leaf.clone()).unwrap();
            index = commit_file(&mut store, "/doc", leaf.id);
        }
        // reopen: state rebuilt from the WAL
        let store = ContentStore::open(dir.path(), FsyncPolicy::Always).unwrap();
        assert_eq!(store.get(&leaf.id), Some(&leaf));
        assert_eq!(store.load_index(&index.id), Some(index.clone()));
        assert_eq!(
            store.head("/doc").unwrap().partition(&Uuid::nil()).unwrap().index_id,
            index.id
        );
    }

    #[test]
    fn test_writes_after_corrupt_tail_survive_restart() {
        let dir = TempDir::new().unwrap();
        let a = DataElement::blob(ExtendedId::random(), b"a".to_vec());
        let b = DataElement::blob(ExtendedId::random(), b"b".to_vec());
        {
            let mut store = ContentStore::open(dir.path(), FsyncPolicy::Always).unwrap();
            store.put(a.clone()).unwrap();
        }
        {
            use std::io::Write;
            let mut wal = std::fs::OpenOptions::new()
                .append(true)
                .open(dir.path().join("wal.log"))
                .unwrap();
            wal.write_all(b"junk!").unwrap();
        }
        {
            let mut store = ContentStore::open(dir.path(), FsyncPolicy::Always).unwrap();
            assert!(store.contains(&a.id));
            assert_eq!(store.put(b.clone()).unwrap(), PutOutcome::Inserted);
            assert_eq!(store.wal_entries_written(), 1);
        }
        let store = ContentStore::open(dir.path(), FsyncPolicy::Always).unwrap();
        assert_eq!(store.get(&a.id), Some(&a));
        assert_eq!(store.get(&b.id), Some(&b));
    }

    #[test]
    fn test_closure_walks_references() {
        let dir = TempDir::new().unwrap();
        let mut store = ContentStore::open(dir.path(), FsyncPolicy::None).unwrap();
        let leaf = DataElement::blob(ExtendedId::random(), b"x".to_vec());
        let dangling = ExtendedId::random();
        let mid = node(vec![leaf.id, dangling]);
        let root = node(vec![mid.id, leaf.id]);
        for el in [leaf.clone(), mid.clone(), root.clone()] {
            store.put(el).unwrap();
        }

        let closure = store.closure([root.id], &HashSet::new());
        assert_eq!(closure.reached, vec![root.id, mid.id, leaf.id]);
        assert_eq!(closure.missing, vec![dangling]);
        assert!(!closure.is_complete());

        // known ids are not descended into
        let known: HashSet<ExtendedId> = [mid.id].into_iter().collect();
        let closure = store.closure([root.id], &known);
        assert_eq!(closure.reached, vec![root.id, leaf.id]);
        assert!(closure.is_complete());
    }

    #[test]
    fn test_reclaim_unreachable() {
        let dir = TempDir::new().unwrap();
        let kept = DataElement::blob(ExtendedId::random(), b"kept".to_vec());
        let orphan = DataElement::blob(ExtendedId::random(), b"orphan".to_vec());
        {
            let mut store = ContentStore::open(dir.path(), FsyncPolicy::None).unwrap();
            store.put(kept.clone()).unwrap();
            store.put(orphan.clone()).unwrap();
            let index = commit_file(&mut store, "/doc", kept.id);

            assert_eq!(store.reclaim_unreachable().unwrap(), 1);
            assert!(store.contains(&kept.id));
            assert!(store.contains(&index.id));
            assert!(!store.contains(&orphan.id));
            assert_eq!(store.reclaim_unreachable().unwrap(), 0);
        }
        let store = ContentStore::open(dir.path(), FsyncPolicy::None).unwrap();
        assert!(!store.contains(&orphan.id));
        assert_eq!(store.element_count(), 2);
    }
}
