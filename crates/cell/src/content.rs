//! Whole-file content as a cell: chunk leaves under one manifest.
//!
//! Upload splits the bytes into `ObjectGroup` chunks whose ids are derived
//! from their content, so unchanged chunks are shared between versions. A
//! `CellManifest` lists the chunks in order and is mapped under the default
//! cell key (the nil id).

use cellstore_common::{CellErrorCode, CellKey, ContentDigest, ErrorKind, ExtendedId};
use cellstore_storage::{DataElement, DataElementKind};
use uuid::Uuid;

/// Cell key under which whole-file content is mapped.
pub const DEFAULT_CELL: CellKey = ExtendedId::NIL;

/// Content-derived id: the first 16 digest bytes as the GUID.
pub fn content_id(parts: &[&[u8]]) -> ExtendedId {
    let digest = ContentDigest::of_parts(parts.iter().copied());
    let mut guid = [0u8; 16];
    guid.copy_from_slice(&digest.as_bytes()[..16]);
    ExtendedId::new(Uuid::from_bytes(guid), 1)
}

/// Elements for `content`: the chunks followed by their manifest.
pub fn chunk(content: &[u8], chunk_bytes: usize) -> (ExtendedId, Vec<DataElement>) {
    let mut elements: Vec<DataElement> = content
        .chunks(chunk_bytes.max(1))
        .map(|c| DataElement::blob(content_id(&[b"chunk".as_slice(), c]), c.to_vec()))
        .collect();
    let references: Vec<ExtendedId> = elements.iter().map(|e| e.id).collect();

    let total = (content.len() as u64).to_le_bytes();
    let ref_bytes: Vec<u8> = references
        .iter()
        .flat_map(|r| r.guid().into_bytes())
        .collect();
    let manifest_id = content_id(&[b"manifest".as_slice(), total.as_slice(), ref_bytes.as_slice()]);
    elements.push(DataElement::new(
        manifest_id,
        DataElementKind::CellManifest,
        references,
        total.to_vec(),
    ));
    (manifest_id, elements)
}

/// Rebuild the bytes under `manifest_id`, resolving elements with `lookup`.
pub fn assemble<'a, F>(manifest_id: &ExtendedId, lookup: F) -> Result<Vec<u8>, ErrorKind>
where
    F: Fn(&ExtendedId) -> Option<&'a DataElement>,
{
    let not_found = || ErrorKind::cell(CellErrorCode::ReferencedDataElementNotFound);
    let manifest = lookup(manifest_id).ok_or_else(not_found)?;
    if manifest.kind != DataElementKind::CellManifest {
        return Err(ErrorKind::FileNotExistsOrCannotBeCreated);
    }
    let expected = <[u8; 8]>::try_from(manifest.payload.as_slice())
        .map(u64::from_le_bytes)
        .map_err(|_| ErrorKind::cell(CellErrorCode::FragmentInvalid))?;

    let mut out = Vec::with_capacity(expected as usize);
    for id in &manifest.references {
        let chunk = lookup(id).ok_or_else(not_found)?;
        out.extend_from_slice(&chunk.payload);
    }
    if out.len() as u64 != expected {
        tracing::warn!(%manifest_id, expected, actual = out.len(), "assembled content length mismatch");
        return Err(ErrorKind::cell(CellErrorCode::FragmentInvalid));
    }
    Ok(out)
}
