use std::io::Write;

use super::{CAPABILITIES, Result, Service};
use crate::object::ObjectId;
use crate::pktline::PktLineWriter;
use crate::reference::{DEFAULT_BRANCH, Reference};
use crate::store::ObjectStore;

/// Write the `info/refs` advertisement for `service`
///
/// The first reference carries the capability list. References without a
/// direct id are skipped.
pub fn list_references<W: Write>(
    enc: &mut PktLineWriter<W>,
    service: Service,
    refs: &[Reference],
) -> Result<()> {
    enc.encode(format!("# service={}\n", service).as_bytes())?;
    enc.flush()?;

    let mut refs = refs
        .iter()
        .filter_map(|reference| reference.id().map(|id| (id, reference.name())));

    let Some((head_id, head_name)) = refs.next() else {
        // Empty repository
        let mut line = format!("{} capabilities^{{}}", ObjectId::null()).into_bytes();
        line.push(0);
        line.extend_from_slice(CAPABILITIES.as_bytes());
        line.push(b'\n');
        enc.encode(&line)?;
        enc.flush()?;
        return Ok(());
    };

    let mut line = format!("{} {}", head_id, head_name).into_bytes();
    line.push(0);
    line.extend_from_slice(CAPABILITIES.as_bytes());
    if service == Service::UploadPack {
        line.extend_from_slice(format!(" symref={}:{}", head_name, DEFAULT_BRANCH).as_bytes());
    }
    line.push(b'\n');
    enc.encode(&line)?;

    for (id, name) in refs {
        enc.encode(format!("{} {}\n", id, name).as_bytes())?;
    }
    enc.flush()?;
    Ok(())
}

/// References of `store` as they should be advertised
///
/// Symbolic references are replaced by their resolved value; those that do
/// not resolve are left out.
pub async fn advertised_references(store: &dyn ObjectStore) -> Result<Vec<Reference>> {
    let mut advertised = Vec::new();
    for reference in store.references().await? {
        if reference.id().is_some() {
            advertised.push(reference);
            continue;
        }
        match store.resolve(reference.name()).await {
            Ok(Some(id)) => advertised.push(Reference::direct(reference.name(), id)),
            Ok(None) => tracing::debug!("Skipping unresolved reference {}", reference.name()),
            Err(e) => tracing::debug!("Skipping reference {}: {}", reference.name(), e),
        }
    }
    Ok(advertised)
}
