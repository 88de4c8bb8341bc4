//! Storage index coherency: planning of PutChanges and QueryChanges.
//!
//! Both planners are pure functions of the committed state and the request.
//! A put plan is only applied by the processor after every check passed, so
//! a rejected put never leaves a trace in the content store.

use crate::request::{Knowledge, PutOptions, QueryChanges};
use cellstore_common::{CellErrorCode, CellKey, ErrorKind, ExtendedId};
use cellstore_storage::{
    walk_references, ContentStore, DataElement, Fragment, PutOutcome, StorageIndex,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// The caller's view of the index it wrote against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    /// No expected index was sent.
    Unspecified,
    /// A version this server still remembers (the nil token is the empty index).
    Known(StorageIndex),
    /// A version older than the retained history, or never issued.
    Unknown(ExtendedId),
}

/// Everything a successful put will write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutPlan {
    /// Mappings of the next storage index.
    pub mappings: BTreeMap<CellKey, ExtendedId>,
    /// Elements not yet in the store, in request order.
    pub to_insert: Vec<DataElement>,
    /// Entries whose value differs from the current index. Removed keys
    /// appear with the nil id.
    pub applied: BTreeMap<CellKey, ExtendedId>,
    pub added: Vec<ExtendedId>,
}

fn coherency_failure() -> ErrorKind {
    ErrorKind::cell(CellErrorCode::CoherencyFailure)
}

/// Plan a PutChanges against the committed `current` index.
///
/// A mapping to the nil id removes the key.
pub fn plan_put(
    store: &ContentStore,
    current: &StorageIndex,
    expected: &Expected,
    elements: &[DataElement],
    mappings: &BTreeMap<CellKey, ExtendedId>,
    options: &PutOptions,
) -> Result<PutPlan, ErrorKind> {
    let bundle: HashMap<ExtendedId, &DataElement> = elements.iter().map(|e| (e.id, e)).collect();

    let applied: BTreeMap<CellKey, ExtendedId> = {
        let mut applied: BTreeMap<CellKey, ExtendedId> = mappings
            .iter()
            .filter(|(k, v)| current.get(k).unwrap_or(ExtendedId::NIL) != **v)
            .map(|(k, v)| (*k, *v))
            .collect();
        if options.full_file_replace {
            for key in current.mappings.keys() {
                if !mappings.contains_key(key) {
                    applied.insert(*key, ExtendedId::NIL);
                }
            }
        }
        applied
    };

    let not_found = find_missing(store, &bundle, elements, &applied);
    let incoherent = !is_coherent(current, expected, mappings, &applied, options);

    match (incoherent, not_found) {
        (true, Some(_)) if options.favor_coherency_failure_over_not_found => {
            return Err(coherency_failure())
        }
        (_, Some(id)) => {
            tracing::debug!(%id, "put references an element that was not supplied");
            return Err(ErrorKind::cell(CellErrorCode::ReferencedDataElementNotFound));
        }
        (true, None) => return Err(coherency_failure()),
        (false, None) => {}
    }

    let mut next = if options.full_file_replace {
        BTreeMap::new()
    } else {
        current.mappings.clone()
    };
    for (key, value) in mappings {
        if value.is_nil() {
            next.remove(key);
        } else {
            next.insert(*key, *value);
        }
    }

    if options.require_storage_mappings_rooted {
        let roots: Vec<ExtendedId> = next.values().copied().collect();
        let reached: HashSet<ExtendedId> = walk_references(roots, &HashSet::new(), |id| {
            bundle.get(id).copied().or_else(|| store.get(id))
        })
        .reached
        .into_iter()
        .collect();
        if let Some(orphan) = elements.iter().find(|e| !reached.contains(&e.id)) {
            tracing::debug!(id = %orphan.id, "put supplies an unrooted element");
            return Err(coherency_failure());
        }
    }

    let mut plan = PutPlan {
        mappings: next,
        applied,
        ..PutPlan::default()
    };
    let mut seen: HashMap<ExtendedId, &DataElement> = HashMap::new();
    for element in elements {
        if let Some(first) = seen.get(&element.id) {
            if first.digest() != element.digest() {
                if options.check_for_id_reuse {
                    return Err(ErrorKind::cell(CellErrorCode::ExtendedGuidCollision));
                }
                tracing::warn!(id = %element.id, "id repeated in one put with different content; keeping the first");
            }
            continue;
        }
        seen.insert(element.id, element);
        match store.check(element) {
            PutOutcome::Inserted => {
                plan.added.push(element.id);
                plan.to_insert.push(element.clone());
            }
            PutOutcome::AlreadyPresent => {}
            PutOutcome::Collision if options.check_for_id_reuse => {
                return Err(ErrorKind::cell(CellErrorCode::ExtendedGuidCollision));
            }
            PutOutcome::Collision => {
                tracing::warn!(id = %element.id, "id reused with different content; keeping stored content");
            }
        }
    }
    Ok(plan)
}

/// First id the put needs but cannot resolve.
fn find_missing(
    store: &ContentStore,
    bundle: &HashMap<ExtendedId, &DataElement>,
    elements: &[DataElement],
    applied: &BTreeMap<CellKey, ExtendedId>,
) -> Option<ExtendedId> {
    let mapped = applied
        .values()
        .filter(|v| !v.is_nil())
        .find(|v| !bundle.contains_key(*v));
    if let Some(id) = mapped {
        return Some(*id);
    }
    elements
        .iter()
        .flat_map(|e| e.references.iter())
        .find(|r| !bundle.contains_key(*r) && !store.contains(r))
        .copied()
}

fn is_coherent(
    current: &StorageIndex,
    expected: &Expected,
    mappings: &BTreeMap<CellKey, ExtendedId>,
    applied: &BTreeMap<CellKey, ExtendedId>,
    options: &PutOptions,
) -> bool {
    let empty = StorageIndex::empty();
    let expected = match expected {
        Expected::Unknown(id) => {
            tracing::debug!(%id, "expected index is not a retained version");
            return false;
        }
        Expected::Known(index) => index,
        Expected::Unspecified if options.imply_null_expected_if_no_mapping => &empty,
        Expected::Unspecified => return true,
    };

    let keys: BTreeSet<CellKey> = if options.coherency_check_only_applied_index_entries {
        applied.keys().copied().collect()
    } else if options.full_file_replace {
        mappings
            .keys()
            .chain(current.mappings.keys())
            .copied()
            .collect()
    } else {
        mappings.keys().copied().collect()
    };

    keys.iter().all(|key| {
        let server = current.get(key);
        match expected.get(key) {
            Some(believed) => server == Some(believed),
            None if options.imply_null_expected_if_no_mapping => server.is_none(),
            None => true,
        }
    })
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// One page of a QueryChanges answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPage {
    pub elements: Vec<DataElement>,
    pub fragments: Vec<Fragment>,
    pub partial: bool,
    /// The caller's knowledge after receiving this page.
    pub knowledge: Knowledge,
}

/// Collect what the caller is missing of `index`, up to `page_bytes`.
///
/// The walk descends through elements the caller already has, so new
/// content under known elements is still found. The first element of a page
/// is always sent whole (or as a fragment when fragments are allowed) so a
/// caller always makes progress.
pub fn plan_query(
    store: &ContentStore,
    index: &StorageIndex,
    query: &QueryChanges,
    page_bytes: u64,
) -> QueryPage {
    let roots: Vec<ExtendedId> = if query.filter.element_ids.is_empty() {
        index.roots().into_iter().collect()
    } else {
        query.filter.element_ids.clone()
    };
    let closure = store.closure(roots, &HashSet::new());

    let mut page = QueryPage {
        knowledge: query.knowledge.clone(),
        ..QueryPage::default()
    };
    let mut used = 0u64;
    let mut sent_any = false;

    for id in closure.reached {
        if page.knowledge.elements.contains(&id) {
            continue;
        }
        let Some(element) = store.get(&id) else {
            continue;
        };
        if !query.filter.admits(element.kind) {
            if query.include_filtered_out_data_elements_in_knowledge {
                page.knowledge.elements.insert(id);
            }
            continue;
        }

        let resume = if query.allow_fragments {
            page.knowledge.fragments.get(&id).copied().unwrap_or(0)
        } else {
            0
        };
        let cost = if resume > 0 {
            element.size().saturating_sub(resume)
        } else {
            element.size()
        };

        if resume == 0 && (used + cost <= page_bytes || (!sent_any && !query.allow_fragments)) {
            used += cost;
            sent_any = true;
            page.knowledge.fragments.remove(&id);
            page.knowledge.elements.insert(id);
            page.elements.push(element.clone());
            continue;
        }

        if query.allow_fragments {
            let room = page_bytes.saturating_sub(used);
            if room > 0 || !sent_any {
                let fragment = Fragment::split(element, resume, room.max(1));
                used += fragment.bytes.len() as u64;
                sent_any = true;
                if fragment.is_last() {
                    page.knowledge.fragments.remove(&id);
                    page.knowledge.elements.insert(id);
                    page.fragments.push(fragment);
                    continue;
                }
                page.knowledge.fragments.insert(id, fragment.end());
                page.fragments.push(fragment);
            }
        }
        page.partial = true;
        break;
    }
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellstore_common::ExtendedId;
    use cellstore_storage::{DataElementKind, FsyncPolicy};
    use tempfile::TempDir;

    fn store() -> (TempDir, ContentStore) {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path(), FsyncPolicy::None).unwrap();
        (dir, store)
    }

    fn blob(bytes: &[u8]) -> DataElement {
        DataElement::blob(ExtendedId::random(), bytes.to_vec())
    }

    fn map(pairs: &[(CellKey, ExtendedId)]) -> BTreeMap<CellKey, ExtendedId> {
        pairs.iter().copied().collect()
    }

    fn apply(
        store: &mut ContentStore,
        current: &StorageIndex,
        elements: &[DataElement],
        mappings: BTreeMap<CellKey, ExtendedId>,
    ) -> StorageIndex {
        let plan = plan_put(
            store,
            current,
            &Expected::Known(current.clone()),
            elements,
            &mappings,
            &PutOptions::default(),
        )
        .unwrap();
        commit(store, plan)
    }

    fn commit(store: &mut ContentStore, plan: PutPlan) -> StorageIndex {
        for e in plan.to_insert {
            store.put(e).unwrap();
        }
        let index = StorageIndex::new(ExtendedId::random(), plan.mappings);
        store.put_index(&index).unwrap();
        index
    }

    #[test]
    fn test_unconditional_put_applies() {
        let (_d, mut s) = store();
        let key = ExtendedId::random();
        let first = blob(b"one");
        let plan = plan_put(
            &s,
            &StorageIndex::empty(),
            &Expected::Unspecified,
            std::slice::from_ref(&first),
            &map(&[(key, first.id)]),
            &PutOptions::default(),
        )
        .unwrap();
        assert_eq!(plan.added, vec![first.id]);
        let current = commit(&mut s, plan);

        let second = blob(b"two");
        let plan = plan_put(
            &s,
            &current,
            &Expected::Unspecified,
            std::slice::from_ref(&second),
            &map(&[(key, second.id)]),
            &PutOptions::default(),
        )
        .unwrap();
        assert_eq!(plan.mappings.get(&key), Some(&second.id));
        assert_eq!(plan.applied.get(&key), Some(&second.id));
    }

    #[test]
    fn test_stale_expected_is_coherency_failure() {
        let (_d, mut s) = store();
        let key = ExtendedId::random();
        let a = blob(b"a");
        let v1 = apply(&mut s, &StorageIndex::empty(), std::slice::from_ref(&a), map(&[(key, a.id)]));
        let b = blob(b"b");
        let v2 = apply(&mut s, &v1, std::slice::from_ref(&b), map(&[(key, b.id)]));

        let c = blob(b"c");
        let err = plan_put(&s, &v2, &Expected::Known(v1), &[c.clone()], &map(&[(key, c.id)]), &PutOptions::default())
            .unwrap_err();
        assert!(err.is_coherency_failure());

        let err = plan_put(&s, &v2, &Expected::Unknown(ExtendedId::random()), &[c.clone()], &map(&[(key, c.id)]), &PutOptions::default())
            .unwrap_err();
        assert!(err.is_coherency_failure());
    }

    #[test]
    fn test_imply_null_expected() {
        let (_d, mut s) = store();
        let key = ExtendedId::random();
        let a = blob(b"a");
        let current = apply(&mut s, &StorageIndex::empty(), std::slice::from_ref(&a), map(&[(key, a.id)]));
        let imply = PutOptions {
            imply_null_expected_if_no_mapping: true,
            ..PutOptions::default()
        };
        let b = blob(b"b");

        // Expected index without the key: applies only if the server has none.
        let expected = Expected::Known(StorageIndex::empty());
        assert!(plan_put(&s, &current, &expected, &[b.clone()], &map(&[(key, b.id)]), &imply)
            .unwrap_err()
            .is_coherency_failure());
        assert!(plan_put(&s, &current, &expected, &[b.clone()], &map(&[(key, b.id)]), &PutOptions::default()).is_ok());

        let fresh = ExtendedId::random();
        assert!(plan_put(&s, &current, &expected, &[b.clone()], &map(&[(fresh, b.id)]), &imply).is_ok());
        assert!(plan_put(&s, &current, &Expected::Unspecified, &[b.clone()], &map(&[(key, b.id)]), &imply)
            .unwrap_err()
            .is_coherency_failure());
    }

    #[test]
    fn test_not_found_and_precedence() {
        let (_d, s) = store();
        let key = ExtendedId::random();
        let current = StorageIndex::new(ExtendedId::random(), map(&[(key, ExtendedId::random())]));
        let absent = ExtendedId::random();

        let err = plan_put(&s, &current, &Expected::Unspecified, &[], &map(&[(key, absent)]), &PutOptions::default())
            .unwrap_err();
        assert_eq!(err, ErrorKind::cell(CellErrorCode::ReferencedDataElementNotFound));

        let stale = Expected::Known(StorageIndex::new(ExtendedId::random(), map(&[(key, ExtendedId::random())])));
        let err = plan_put(&s, &current, &stale, &[], &map(&[(key, absent)]), &PutOptions::default()).unwrap_err();
        assert_eq!(err, ErrorKind::cell(CellErrorCode::ReferencedDataElementNotFound));

        let favor = PutOptions {
            favor_coherency_failure_over_not_found: true,
            ..PutOptions::default()
        };
        let err = plan_put(&s, &current, &stale, &[], &map(&[(key, absent)]), &favor).unwrap_err();
        assert!(err.is_coherency_failure());
    }

    #[test]
    fn test_dangling_reference_is_not_found() {
        let (_d, s) = store();
        let parent = DataElement::new(
            ExtendedId::random(),
            DataElementKind::CellManifest,
            vec![ExtendedId::random()],
            Vec::new(),
        );
        let err = plan_put(
            &s,
            &StorageIndex::empty(),
            &Expected::Unspecified,
            std::slice::from_ref(&parent),
            &map(&[(ExtendedId::NIL, parent.id)]),
            &PutOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, ErrorKind::cell(CellErrorCode::ReferencedDataElementNotFound));
    }

    #[test]
    fn test_require_rooted() {
        let (_d, s) = store();
        let key = ExtendedId::random();
        let root = blob(b"root");
        let orphan = blob(b"orphan");
        let rooted = PutOptions {
            require_storage_mappings_rooted: true,
            ..PutOptions::default()
        };
        let elements = [root.clone(), orphan];
        let err = plan_put(&s, &StorageIndex::empty(), &Expected::Unspecified, &elements, &map(&[(key, root.id)]), &rooted)
            .unwrap_err();
        assert!(err.is_coherency_failure());
        assert!(plan_put(&s, &StorageIndex::empty(), &Expected::Unspecified, &elements, &map(&[(key, root.id)]), &PutOptions::default()).is_ok());
    }

    #[test]
    fn test_id_reuse() {
        let (_d, mut s) = store();
        let key = ExtendedId::random();
        let original = blob(b"original");
        let current = apply(&mut s, &StorageIndex::empty(), std::slice::from_ref(&original), map(&[(key, original.id)]));
        let forged = DataElement::blob(original.id, b"forged".to_vec());
        let check = PutOptions {
            check_for_id_reuse: true,
            ..PutOptions::default()
        };
        let other = ExtendedId::random();
        let err = plan_put(&s, &current, &Expected::Unspecified, std::slice::from_ref(&forged), &map(&[(other, forged.id)]), &check)
            .unwrap_err();
        assert_eq!(err, ErrorKind::cell(CellErrorCode::ExtendedGuidCollision));

        let plan = plan_put(&s, &current, &Expected::Unspecified, &[forged.clone()], &map(&[(other, forged.id)]), &PutOptions::default())
            .unwrap();
        assert!(plan.to_insert.is_empty());
        assert_eq!(s.get(&original.id).unwrap().payload, b"original");
    }

    #[test]
    fn test_full_file_replace_and_removal() {
        let (_d, mut s) = store();
        let (k1, k2) = (ExtendedId::random(), ExtendedId::random());
        let (a, b) = (blob(b"a"), blob(b"b"));
        let current = apply(&mut s, &StorageIndex::empty(), &[a.clone(), b.clone()], map(&[(k1, a.id), (k2, b.id)]));

        let removal = plan_put(&s, &current, &Expected::Unspecified, &[], &map(&[(k2, ExtendedId::NIL)]), &PutOptions::default()).unwrap();
        assert_eq!(removal.mappings, map(&[(k1, a.id)]));
        assert_eq!(removal.applied, map(&[(k2, ExtendedId::NIL)]));

        let replace = PutOptions {
            full_file_replace: true,
            ..PutOptions::default()
        };
        let c = blob(b"c");
        let plan = plan_put(&s, &current, &Expected::Known(current.clone()), std::slice::from_ref(&c), &map(&[(k1, c.id)]), &replace).unwrap();
        assert_eq!(plan.mappings, map(&[(k1, c.id)]));
        assert_eq!(plan.applied.get(&k2), Some(&ExtendedId::NIL));
    }

    #[test]
    fn test_check_only_applied_entries() {
        let (_d, mut s) = store();
        let (k1, k2) = (ExtendedId::random(), ExtendedId::random());
        let (a, b) = (blob(b"a"), blob(b"b"));
        let current = apply(&mut s, &StorageIndex::empty(), &[a.clone(), b.clone()], map(&[(k1, a.id), (k2, b.id)]));
        // The caller believes k1 maps elsewhere but resends the current value.
        let stale = Expected::Known(StorageIndex::new(ExtendedId::random(), map(&[(k1, ExtendedId::random())])));
        let c = blob(b"c");
        let mappings = map(&[(k1, a.id), (k2, c.id)]);
        assert!(plan_put(&s, &current, &stale, std::slice::from_ref(&c), &mappings, &PutOptions::default())
            .unwrap_err()
            .is_coherency_failure());
        let only_applied = PutOptions {
            coherency_check_only_applied_index_entries: true,
            ..PutOptions::default()
        };
        let plan = plan_put(&s, &current, &stale, std::slice::from_ref(&c), &mappings, &only_applied).unwrap();
        assert_eq!(plan.applied, map(&[(k2, c.id)]));
    }

    fn chain(store: &mut ContentStore, sizes: &[usize]) -> StorageIndex {
        let leaves: Vec<DataElement> = sizes.iter().map(|n| blob(&vec![7u8; *n])).collect();
        let manifest = DataElement::new(
            ExtendedId::random(),
            DataElementKind::CellManifest,
            leaves.iter().map(|l| l.id).collect(),
            Vec::new(),
        );
        let mut elements = leaves;
        elements.push(manifest.clone());
        let plan = plan_put(
            store,
            &StorageIndex::empty(),
            &Expected::Unspecified,
            &elements,
            &map(&[(ExtendedId::NIL, manifest.id)]),
            &PutOptions::default(),
        )
        .unwrap();
        commit(store, plan)
    }

    #[test]
    fn test_query_pages_until_complete() {
        let (_d, mut s) = store();
        let index = chain(&mut s, &[100, 100, 100]);
        let mut query = QueryChanges::default();
        let mut received = 0;
        let mut pages = 0;
        loop {
            let page = plan_query(&s, &index, &query, 150);
            received += page.elements.len();
            pages += 1;
            query.knowledge = page.knowledge;
            if !page.partial {
                break;
            }
            assert!(pages < 10);
        }
        assert_eq!(received, 4);
        assert!(pages > 1);

        let again = plan_query(&s, &index, &query, 150);
        assert!(again.elements.is_empty());
        assert!(!again.partial);
    }

    #[test]
    fn test_query_fragments_large_element() {
        let (_d, mut s) = store();
        let index = chain(&mut s, &[1000]);
        let mut query = QueryChanges {
            allow_fragments: true,
            ..QueryChanges::default()
        };
        let mut bytes = 0u64;
        for _ in 0..50 {
            let page = plan_query(&s, &index, &query, 300);
            bytes += page.fragments.iter().map(|f| f.bytes.len() as u64).sum::<u64>();
            query.knowledge = page.knowledge;
            if !page.partial {
                break;
            }
        }
        assert_eq!(bytes, 1000);
        assert!(query.knowledge.fragments.is_empty());
        assert_eq!(query.knowledge.elements.len(), 2);
    }

    #[test]
    fn test_query_kind_filter() {
        let (_d, mut s) = store();
        let index = chain(&mut s, &[10, 10]);
        let mut query = QueryChanges::default();
        query.filter.exclude_kinds = vec![DataElementKind::ObjectGroup];
        query.include_filtered_out_data_elements_in_knowledge = true;
        let page = plan_query(&s, &index, &query, u64::MAX);
        assert_eq!(page.elements.len(), 1);
        assert_eq!(page.elements[0].kind, DataElementKind::CellManifest);
        assert_eq!(page.knowledge.elements.len(), 3);
    }
}
