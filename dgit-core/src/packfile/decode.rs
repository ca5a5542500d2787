use bytes::Bytes;
use flate2::bufread::ZlibDecoder;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::Read;

use super::{HEADER_LEN, OFS_DELTA, PackError, REF_DELTA, Result, SIGNATURE, TRAILER_LEN, apply_delta};
use crate::object::{ID_LEN, Object, ObjectId, ObjectKind};
use crate::store::{ObjectStore, StoreError};

/// Upper bound of deflate's compression ratio
const MAX_INFLATE_RATIO: usize = 1032;

/// How an entry's content is obtained
#[derive(Debug)]
enum EntryKind {
    Base(ObjectKind),
    OfsDelta(usize),
    RefDelta(ObjectId),
}

#[derive(Debug)]
struct Entry {
    offset: usize,
    kind: EntryKind,
    /// Inflated content or delta instructions
    data: Vec<u8>,
}

/// Parse a complete pack and resolve all of its deltas
///
/// Returns the objects in pack order.
pub(super) async fn parse_pack(data: &[u8], store: &dyn ObjectStore) -> Result<Vec<Object>> {
    if data.len() < HEADER_LEN + TRAILER_LEN {
        return Err(PackError::Truncated(format!("{} bytes", data.len())));
    }
    if &data[..4] != SIGNATURE {
        return Err(PackError::InvalidSignature);
    }
    let version = read_u32(&data[4..8]);
    if version != 2 && version != 3 {
        return Err(PackError::UnsupportedVersion(version));
    }
    let count = read_u32(&data[8..12]) as usize;

    let (body, trailer) = data.split_at(data.len() - TRAILER_LEN);
    let digest: [u8; TRAILER_LEN] = Sha1::digest(body).into();
    if digest != trailer {
        return Err(PackError::ChecksumMismatch);
    }

    let mut entries = Vec::with_capacity(count.min(body.len()));
    let mut pos = HEADER_LEN;
    for _ in 0..count {
        let (entry, next) = read_entry(body, pos)?;
        entries.push(entry);
        pos = next;
    }
    if pos != body.len() {
        return Err(PackError::InvalidEntry {
            offset: pos,
            reason: format!("{} unexpected bytes after last entry", body.len() - pos),
        });
    }

    resolve(entries, store).await
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

fn read_entry(body: &[u8], offset: usize) -> Result<(Entry, usize)> {
    let invalid = |reason: &str| PackError::InvalidEntry {
        offset,
        reason: reason.to_string(),
    };
    let next_byte = |pos: &mut usize| -> Result<u8> {
        let byte = *body
            .get(*pos)
            .ok_or_else(|| PackError::Truncated(format!("entry at offset {}", offset)))?;
        *pos += 1;
        Ok(byte)
    };

    let mut pos = offset;
    let mut byte = next_byte(&mut pos)?;
    let type_code = (byte >> 4) & 0x07;
    let mut size = (byte & 0x0f) as usize;
    let mut shift = 4;
    while byte & 0x80 != 0 {
        byte = next_byte(&mut pos)?;
        if shift > 57 {
            return Err(invalid("size overflow"));
        }
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
    }

    let kind = match type_code {
        OFS_DELTA => {
            // Big-endian base distance, adding one per continuation byte
            let mut byte = next_byte(&mut pos)?;
            let mut distance = (byte & 0x7f) as usize;
            while byte & 0x80 != 0 {
                byte = next_byte(&mut pos)?;
                distance = distance
                    .checked_add(1)
                    .and_then(|d| d.checked_mul(128))
                    .ok_or_else(|| invalid("delta base offset overflow"))?
                    | (byte & 0x7f) as usize;
            }
            if distance == 0 || distance > offset {
                return Err(invalid("delta base outside of pack"));
            }
            EntryKind::OfsDelta(offset - distance)
        }
        REF_DELTA => {
            let raw = body
                .get(pos..pos + ID_LEN)
                .ok_or_else(|| PackError::Truncated(format!("entry at offset {}", offset)))?;
            let mut id = [0u8; ID_LEN];
            id.copy_from_slice(raw);
            pos += ID_LEN;
            EntryKind::RefDelta(ObjectId::new(id))
        }
        code => EntryKind::Base(
            ObjectKind::from_pack_type(code)
                .ok_or_else(|| invalid(&format!("unknown type {}", code)))?,
        ),
    };

    let compressed = &body[pos..];
    if size > compressed.len().saturating_mul(MAX_INFLATE_RATIO) {
        return Err(invalid(&format!(
            "header size {} cannot inflate from {} bytes",
            size,
            compressed.len()
        )));
    }

    let mut decoder = ZlibDecoder::new(compressed);
    let mut data = Vec::with_capacity(size.min(compressed.len()));
    decoder
        .by_ref()
        .take(size as u64 + 1)
        .read_to_end(&mut data)
        .map_err(|e| invalid(&format!("inflate failed: {}", e)))?;
    if data.len() != size {
        return Err(invalid(&format!(
            "inflated to {} bytes, header says {}",
            data.len(),
            size
        )));
    }
    pos += decoder.total_in() as usize;

    Ok((Entry { offset, kind, data }, pos))
}

/// Turn entries into objects, applying deltas once their bases are known
///
/// Ref-delta bases that are not in the pack are looked up in `store`.
async fn resolve(entries: Vec<Entry>, store: &dyn ObjectStore) -> Result<Vec<Object>> {
    let by_offset: HashMap<usize, usize> = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| (entry.offset, index))
        .collect();

    let mut resolved: Vec<Option<Object>> = Vec::with_capacity(entries.len());
    let mut by_id: HashMap<ObjectId, usize> = HashMap::new();
    let mut pending = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        match &entry.kind {
            EntryKind::Base(kind) => {
                let object = Object::new(*kind, Bytes::copy_from_slice(&entry.data));
                by_id.insert(object.id(), index);
                resolved.push(Some(object));
            }
            EntryKind::OfsDelta(base) if !by_offset.contains_key(base) => {
                return Err(PackError::InvalidEntry {
                    offset: entry.offset,
                    reason: format!("no entry at base offset {}", base),
                });
            }
            _ => {
                resolved.push(None);
                pending.push(index);
            }
        }
    }

    let mut external: HashMap<ObjectId, Object> = HashMap::new();
    while !pending.is_empty() {
        let mut still_pending = Vec::new();

        for &index in &pending {
            let entry = &entries[index];
            let base = match &entry.kind {
                EntryKind::OfsDelta(base_offset) => by_offset
                    .get(base_offset)
                    .and_then(|base_index| resolved[*base_index].clone()),
                EntryKind::RefDelta(id) => match by_id.get(id) {
                    Some(base_index) => resolved[*base_index].clone(),
                    None => external.get(id).cloned(),
                },
                EntryKind::Base(_) => None,
            };

            match base {
                Some(base) => {
                    let data = apply_delta(&base.data, &entry.data)?;
                    let object = Object::new(base.kind, data);
                    by_id.insert(object.id(), index);
                    resolved[index] = Some(object);
                }
                None => still_pending.push(index),
            }
        }

        if still_pending.len() == pending.len() {
            // No progress inside the pack, try the store for one missing base
            let missing = still_pending.iter().find_map(|&index| match &entries[index].kind {
                EntryKind::RefDelta(id) if !external.contains_key(id) => Some(*id),
                _ => None,
            });
            let Some(id) = missing else {
                return Err(PackError::InvalidDelta("unresolvable delta chain".into()));
            };
            match store.object(id).await {
                Ok(object) => {
                    external.insert(id, object);
                }
                Err(StoreError::ObjectNotFound(_)) => return Err(PackError::MissingBase(id)),
                Err(e) => return Err(e.into()),
            }
        }
        pending = still_pending;
    }

    Ok(resolved.into_iter().flatten().collect())
}
