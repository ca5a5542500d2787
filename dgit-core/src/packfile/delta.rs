use super::{PackError, Result};

/// Rebuild an object from its base and a git delta instruction stream
///
/// The stream starts with the base and result sizes as little-endian varints,
/// followed by copy (high bit set) and insert (1-127 literal bytes)
/// instructions.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let invalid = |reason: &str| PackError::InvalidDelta(reason.to_string());

    let mut pos = 0;
    let base_size = read_size(delta, &mut pos)?;
    let result_size = read_size(delta, &mut pos)?;
    if base_size != base.len() {
        return Err(PackError::InvalidDelta(format!(
            "base size {} does not match delta ({})",
            base.len(),
            base_size
        )));
    }

    // Each instruction byte yields at most one copy of the whole base
    let reachable = (delta.len() - pos).saturating_mul(base.len().max(1));
    if result_size > reachable {
        return Err(PackError::InvalidDelta(format!(
            "result size {} cannot be produced by {} instruction bytes",
            result_size,
            delta.len() - pos
        )));
    }

    let mut out = Vec::with_capacity(result_size.min(base.len() + delta.len()));
    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;

        if op & 0x80 != 0 {
            let mut offset = 0usize;
            let mut size = 0usize;
            for i in 0..4 {
                if op & (1 << i) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| invalid("truncated copy offset"))?;
                    offset |= (byte as usize) << (8 * i);
                    pos += 1;
                }
            }
            for i in 0..3 {
                if op & (0x10 << i) != 0 {
                    let byte = *delta.get(pos).ok_or_else(|| invalid("truncated copy size"))?;
                    size |= (byte as usize) << (8 * i);
                    pos += 1;
                }
            }
            if size == 0 {
                size = 0x10000;
            }

            let end = offset
                .checked_add(size)
                .filter(|end| *end <= base.len())
                .ok_or_else(|| invalid("copy outside of base"))?;
            out.extend_from_slice(&base[offset..end]);
        } else if op != 0 {
            let end = pos + op as usize;
            let literal = delta.get(pos..end).ok_or_else(|| invalid("truncated insert"))?;
            out.extend_from_slice(literal);
            pos = end;
        } else {
            return Err(invalid("reserved instruction 0"));
        }

        if out.len() > result_size {
            return Err(invalid("result larger than announced"));
        }
    }

    if out.len() != result_size {
        return Err(PackError::InvalidDelta(format!(
            "result size {} does not match delta ({})",
            out.len(),
            result_size
        )));
    }
    Ok(out)
}

fn read_size(data: &[u8], pos: &mut usize) -> Result<usize> {
    let mut size = 0usize;
    let mut shift = 0;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| PackError::InvalidDelta("truncated size".into()))?;
        *pos += 1;
        if shift > 56 {
            return Err(PackError::InvalidDelta("size overflow".into()));
        }
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
    }
}
