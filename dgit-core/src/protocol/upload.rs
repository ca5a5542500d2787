use std::io::{Read, Write};

use super::{ProtocolError, Result};
use crate::object::ObjectId;
use crate::packfile::PackCodec;
use crate::pktline::{PktLineReader, PktLineWriter, trim_newline};
use crate::store::ObjectStore;

/// Wants and haves sent by a fetching client, in the order received
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub wants: Vec<ObjectId>,
    pub haves: Vec<ObjectId>,
}

impl UploadRequest {
    /// Read negotiation lines until `done` or end of stream
    ///
    /// Flush-pkts are skipped and unknown commands ignored. Only the first
    /// token after `want`/`have` is the id; clients append capabilities to
    /// the first want.
    pub fn parse<R: Read>(input: R) -> Result<Self> {
        let mut request = Self::default();
        let mut dec = PktLineReader::new(input);

        while let Some(line) = dec.read_line()? {
            let line = trim_newline(&line);
            if line.is_empty() {
                continue;
            }
            if line == b"done" {
                break;
            }

            let line = std::str::from_utf8(line)
                .map_err(|_| ProtocolError::Parse("negotiation line is not valid UTF-8".into()))?;
            tracing::debug!("[upload-pack] {}", line);

            let (command, argument) = line.split_once(' ').unwrap_or((line, ""));
            let target = match command {
                "want" => &mut request.wants,
                "have" => &mut request.haves,
                _ => continue,
            };

            let hex = argument.split_whitespace().next().unwrap_or("");
            let id = ObjectId::from_hex(hex)
                .map_err(|_| ProtocolError::Parse(format!("invalid {} line: {}", command, line)))?;
            target.push(id);
        }

        Ok(request)
    }
}

/// Serve one fetch: parse the negotiation, answer `NAK` and stream the pack
///
/// Returns the parsed request.
pub async fn upload_pack<R, W>(
    input: R,
    output: &mut W,
    store: &dyn ObjectStore,
    codec: &dyn PackCodec,
) -> Result<UploadRequest>
where
    R: Read + Send,
    W: Write + Send,
{
    let request = UploadRequest::parse(input)?;
    tracing::debug!(
        "[upload-pack] wants={} haves={}",
        request.wants.len(),
        request.haves.len()
    );

    let mut enc = PktLineWriter::new(&mut *output);
    enc.encode(b"NAK\n")?;

    let objects = codec.encode(&request.wants, store, output).await?;
    tracing::info!("Sent {} objects for {} wants", objects, request.wants.len());
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use crate::packfile::PackfileCodec;
    use crate::store::MemoryStore;

    fn frame(lines: &[&str]) -> Vec<u8> {
        let mut enc = PktLineWriter::new(Vec::new());
        for line in lines {
            if line.is_empty() {
                enc.encode_flush().unwrap();
            } else {
                enc.encode(line.as_bytes()).unwrap();
            }
        }
        enc.into_inner()
    }

    const H1: &str = "0a53e9ddeaddad63ad106860237bbf53411d11a7";
    const H2: &str = "441b40d833fdfa93eb2908e52742248faf0ee993";

    #[test]
    fn test_wants_and_haves() {
        let input = frame(&[&format!("want {}\n", H1), &format!("have {}\n", H2), "", "done\n"]);
        let request = UploadRequest::parse(&input[..]).unwrap();
        assert_eq!(request.wants, vec![H1.parse().unwrap()]);
        assert_eq!(request.haves, vec![H2.parse().unwrap()]);
    }

    #[test]
    fn test_first_want_carries_capabilities() {
        let input = frame(&[
            &format!("want {} multi_ack side-band-64k ofs-delta\n", H1),
            &format!("want {}\n", H1),
            "shallow ignored",
            "",
            "done\n",
            &format!("want {}\n", H2),
        ]);
        let request = UploadRequest::parse(&input[..]).unwrap();
        // duplicates kept, nothing read after done
        assert_eq!(request.wants.len(), 2);
        assert!(request.haves.is_empty());
    }

    #[test]
    fn test_end_of_stream_without_done() {
        let input = frame(&[&format!("want {}", H1)]);
        let request = UploadRequest::parse(&input[..]).unwrap();
        assert_eq!(request.wants.len(), 1);
    }

    #[test]
    fn test_bad_hash_is_parse_error() {
        for line in ["want nothex\n", "want\n", "have 1234\n"] {
            let input = frame(&[line, "done\n"]);
            assert!(matches!(
                UploadRequest::parse(&input[..]),
                Err(ProtocolError::Parse(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_response_is_nak_then_pack() {
        let store = MemoryStore::new();
        let blob = store.put_object(Object::blob(&b"data"[..])).await.unwrap();
        let input = frame(&[&format!("want {}\n", blob), "", "done\n"]);

        let mut output = Vec::new();
        let request = upload_pack(&input[..], &mut output, &store, &PackfileCodec)
            .await
            .unwrap();
        assert_eq!(request.wants, vec![blob]);
        assert_eq!(&output[..8], b"0008NAK\n");
        assert_eq!(&output[8..12], b"PACK");
    }
}
