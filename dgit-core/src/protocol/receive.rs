use std::io::{Read, Write};

use super::{ProtocolError, Result};
use crate::packfile::PackCodec;
use crate::pktline::{PktLineReader, PktLineWriter};
use crate::store::ObjectStore;
use crate::transaction::RefTransaction;

/// Outcome of one reference update, as reported to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefUpdateStatus {
    Ok { name: String },
    Rejected { name: String, reason: String },
}

impl RefUpdateStatus {
    pub fn name(&self) -> &str {
        match self {
            Self::Ok { name } | Self::Rejected { name, .. } => name,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// The `report-status` line for this update
    pub fn status_line(&self) -> String {
        match self {
            Self::Ok { name } => format!("ok {}\n", name),
            Self::Rejected { name, reason } => format!("ng {} {}\n", name, reason),
        }
    }
}

/// Summary of a completed push
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    /// Objects stored from the pack
    pub objects: usize,
    /// One entry per command, in the order sent
    pub updates: Vec<RefUpdateStatus>,
}

impl ReceiveReport {
    pub fn rejected(&self) -> usize {
        self.updates.iter().filter(|u| !u.is_ok()).count()
    }
}

/// Read update commands up to the first flush-pkt or end of stream
///
/// Returns the commands together with the reader positioned at the pack.
pub fn parse_commands<R: Read>(input: R) -> Result<(Vec<RefTransaction>, R)> {
    let mut dec = PktLineReader::new(input);
    let mut transactions = Vec::new();

    while let Some(line) = dec.read_line()? {
        if line.is_empty() {
            break;
        }
        tracing::debug!("[receive-pack] {}", String::from_utf8_lossy(&line).trim_end());
        transactions.push(RefTransaction::parse(&line)?);
    }

    Ok((transactions, dec.into_inner()))
}

/// Serve one push
///
/// Commands are parsed first, then the pack is stored, then every command is
/// applied independently and reported as `ok` or `ng`. When the pack cannot
/// be stored the client gets `unpack <reason>` and no reference is touched.
pub async fn receive_pack<R, W>(
    input: R,
    output: &mut W,
    store: &dyn ObjectStore,
    codec: &dyn PackCodec,
) -> Result<ReceiveReport>
where
    R: Read + Send,
    W: Write + Send,
{
    let (transactions, mut pack) = parse_commands(input)?;
    let mut enc = PktLineWriter::new(output);

    let objects = match codec.decode(&mut pack, store).await {
        Ok(objects) => objects,
        Err(e) => {
            tracing::warn!("[receive-pack] unpack failed: {}", e);
            enc.encode(format!("unpack {}\n", e).as_bytes())?;
            enc.flush()?;
            return Err(ProtocolError::Unpack(e));
        }
    };
    enc.encode(b"unpack ok\n")?;

    let mut report = ReceiveReport {
        objects,
        updates: Vec::with_capacity(transactions.len()),
    };
    for tx in &transactions {
        let status = match tx.apply(store).await {
            Ok(()) => {
                tracing::debug!("[receive-pack] {:?} {} -> {}", tx.kind(), tx.name(), tx.new_id());
                RefUpdateStatus::Ok {
                    name: tx.name().to_string(),
                }
            }
            Err(e) => {
                tracing::warn!("[receive-pack] rejected {}: {}", tx, e);
                RefUpdateStatus::Rejected {
                    name: tx.name().to_string(),
                    reason: e.to_string(),
                }
            }
        };
        enc.encode(status.status_line().as_bytes())?;
        report.updates.push(status);
    }
    enc.flush()?;

    tracing::info!(
        "Received {} objects, {} of {} reference updates applied",
        report.objects,
        report.updates.len() - report.rejected(),
        report.updates.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectId;
    use crate::packfile::PackfileCodec;
    use crate::store::MemoryStore;

    fn command(old: ObjectId, new: ObjectId, name: &str) -> Vec<u8> {
        format!("{} {} {}\n", old, new, name).into_bytes()
    }

    fn request(commands: &[Vec<u8>], pack: &[u8]) -> Vec<u8> {
        let mut enc = PktLineWriter::new(Vec::new());
        for (i, line) in commands.iter().enumerate() {
            if i == 0 {
                let mut first = line.clone();
                first.pop();
                first.extend_from_slice(b"\0report-status\n");
                enc.encode(&first).unwrap();
            } else {
                enc.encode(line).unwrap();
            }
        }
        enc.encode_flush().unwrap();
        let mut body = enc.into_inner();
        body.extend_from_slice(pack);
        body
    }

    fn read_lines(bytes: &[u8]) -> Vec<String> {
        PktLineReader::new(bytes)
            .map(|line| String::from_utf8(line.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_parse_leaves_pack_unread() {
        let a = ObjectId::from_data(b"a");
        let body = request(&[command(ObjectId::null(), a, "refs/heads/x")], b"PACKrest");
        let (transactions, rest) = parse_commands(&body[..]).unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(rest, b"PACKrest");
    }

    #[tokio::test]
    async fn test_delete_only_push_without_pack() {
        let store = MemoryStore::new();
        let a = ObjectId::from_data(b"a");
        store
            .compare_and_set("refs/heads/old", a, ObjectId::null())
            .await
            .unwrap();

        let body = request(&[command(a, ObjectId::null(), "refs/heads/old")], b"");
        let mut output = Vec::new();
        let report = receive_pack(&body[..], &mut output, &store, &PackfileCodec)
            .await
            .unwrap();

        assert_eq!(report.objects, 0);
        assert_eq!(report.rejected(), 0);
        assert_eq!(read_lines(&output), vec!["unpack ok\n", "ok refs/heads/old\n", ""]);
        assert!(store.reference("refs/heads/old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_updates_are_rejected_individually() {
        let store = MemoryStore::new();
        let (a, b, c) = (
            ObjectId::from_data(b"a"),
            ObjectId::from_data(b"b"),
            ObjectId::from_data(b"c"),
        );
        store
            .compare_and_set("refs/heads/one", a, ObjectId::null())
            .await
            .unwrap();
        store
            .compare_and_set("refs/heads/two", a, ObjectId::null())
            .await
            .unwrap();

        let body = request(
            &[
                command(a, b, "refs/heads/one"),
                command(c, b, "refs/heads/two"),
                command(ObjectId::null(), b, "refs/heads/three"),
            ],
            b"",
        );
        let mut output = Vec::new();
        let report = receive_pack(&body[..], &mut output, &store, &PackfileCodec)
            .await
            .unwrap();

        let lines = read_lines(&output);
        assert_eq!(lines[0], "unpack ok\n");
        assert_eq!(lines[1], "ok refs/heads/one\n");
        assert!(lines[2].starts_with("ng refs/heads/two reference has changed"));
        assert_eq!(lines[3], "ok refs/heads/three\n");
        assert_eq!(lines[4], "");
        assert_eq!(report.rejected(), 1);
        assert_eq!(store.resolve("refs/heads/two").await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_unpack_failure_applies_nothing() {
        let store = MemoryStore::new();
        let a = ObjectId::from_data(b"a");
        let body = request(&[command(ObjectId::null(), a, "refs/heads/x")], b"garbage");

        let mut output = Vec::new();
        let err = receive_pack(&body[..], &mut output, &store, &PackfileCodec)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Unpack(_)));

        let lines = read_lines(&output);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("unpack "));
        assert_ne!(lines[0], "unpack ok\n");
        assert!(store.reference("refs/heads/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_command_is_parse_error() {
        let store = MemoryStore::new();
        let body = request(&[b"not a valid command line\n".to_vec()], b"");
        let mut output = Vec::new();
        let err = receive_pack(&body[..], &mut output, &store, &PackfileCodec)
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(output.is_empty());
    }
}
