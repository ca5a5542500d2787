use flate2::Compression;
use flate2::write::ZlibEncoder;
use sha1::{Digest, Sha1};
use std::collections::{HashSet, VecDeque};
use std::io::{self, Write};

use super::{PackError, Result, SIGNATURE};
use crate::object::{Object, ObjectId};
use crate::store::{ObjectStore, StoreError};

const PACK_VERSION: u32 = 2;

/// Breadth-first walk over object links starting at `wants`
pub(super) async fn collect_reachable(
    wants: &[ObjectId],
    store: &dyn ObjectStore,
) -> Result<Vec<(ObjectId, Object)>> {
    let mut visited = HashSet::new();
    let mut queue: VecDeque<ObjectId> = wants.iter().copied().collect();
    let mut objects = Vec::new();

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }

        let object = match store.object(id).await {
            Ok(object) => object,
            Err(StoreError::ObjectNotFound(_)) => return Err(PackError::MissingObject(id)),
            Err(e) => return Err(e.into()),
        };
        queue.extend(object.links()?);
        objects.push((id, object));
    }
    Ok(objects)
}

/// Serialize `objects` as a version 2 pack with undeltified entries
pub(super) fn write_pack(objects: &[(ObjectId, Object)], out: &mut dyn Write) -> Result<()> {
    let count = u32::try_from(objects.len())
        .map_err(|_| PackError::Truncated("too many objects for one pack".into()))?;

    let mut writer = HashingWriter::new(out);
    writer.write_all(SIGNATURE)?;
    writer.write_all(&PACK_VERSION.to_be_bytes())?;
    writer.write_all(&count.to_be_bytes())?;

    for (_, object) in objects {
        writer.write_all(&entry_header(object.kind.pack_type(), object.data.len()))?;
        let mut encoder = ZlibEncoder::new(&mut writer, Compression::default());
        encoder.write_all(&object.data)?;
        encoder.finish()?;
    }

    let trailer = writer.finish();
    writer.inner.write_all(&trailer)?;
    writer.inner.flush()?;
    Ok(())
}

/// Type and inflated size, 4 bits of size in the first byte and 7 in each
/// continuation byte
pub(super) fn entry_header(type_code: u8, size: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(4);
    let mut byte = (type_code << 4) | (size & 0x0f) as u8;
    let mut rest = size >> 4;
    while rest != 0 {
        header.push(byte | 0x80);
        byte = (rest & 0x7f) as u8;
        rest >>= 7;
    }
    header.push(byte);
    header
}

/// Passes writes through while hashing them for the trailer
struct HashingWriter<'a> {
    inner: &'a mut dyn Write,
    hasher: Sha1,
}

impl<'a> HashingWriter<'a> {
    fn new(inner: &'a mut dyn Write) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
        }
    }

    fn finish(&mut self) -> [u8; 20] {
        std::mem::take(&mut self.hasher).finalize().into()
    }
}

impl Write for HashingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
