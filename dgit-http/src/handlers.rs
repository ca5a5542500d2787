//! HTTP handlers for the smart protocol endpoints

use bytes::Bytes;
use dgit_core::{
    ObjectStore, PktLineWriter, ProtocolError, Service, StoreRegistry, advertised_references,
    list_references, receive_pack, upload_pack,
};
use flate2::read::GzDecoder;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, HeaderValue};
use hyper::{Request, Response, StatusCode};
use std::fmt::Write as _;
use std::io::Read;
use std::sync::Arc;

use crate::{GitHttpError, GitHttpHandler};

fn advertisement_type(service: Service) -> &'static str {
    match service {
        Service::UploadPack => "application/x-git-upload-pack-advertisement",
        Service::ReceivePack => "application/x-git-receive-pack-advertisement",
    }
}

fn result_type(service: Service) -> &'static str {
    match service {
        Service::UploadPack => "application/x-git-upload-pack-result",
        Service::ReceivePack => "application/x-git-receive-pack-result",
    }
}

/// Response with a fixed content type
pub(crate) fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Protocol responses must never be cached by intermediaries
fn no_cache(mut response: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn lookup_store(handler: &GitHttpHandler, repo: &str) -> Result<Arc<dyn ObjectStore>, GitHttpError> {
    if repo.is_empty() {
        return Err(GitHttpError::NotFound("empty repository id".into()));
    }
    handler
        .registry()
        .get_store(repo)
        .ok_or_else(|| GitHttpError::NotFound(format!("repository '{}'", repo)))
}

/// `GET <repo>/info/refs?service=<svc>`
pub async fn info_refs(
    handler: &GitHttpHandler,
    repo: &str,
    service: Service,
) -> Result<Response<Full<Bytes>>, GitHttpError> {
    let store = lookup_store(handler, repo)?;
    let refs = advertised_references(store.as_ref()).await?;

    let mut enc = PktLineWriter::new(Vec::new());
    list_references(&mut enc, service, &refs)?;
    tracing::debug!("Advertised {} references of '{}' for {}", refs.len(), repo, service);

    Ok(no_cache(text_response(
        StatusCode::OK,
        advertisement_type(service),
        enc.into_inner(),
    )))
}

/// `POST <repo>/git-upload-pack` and `POST <repo>/git-receive-pack`
///
/// A failed unpack is still a 200: the client learns about it from the
/// `unpack` status line already in the body.
pub async fn service_rpc<B>(
    handler: &GitHttpHandler,
    req: Request<B>,
    repo: &str,
    service: Service,
) -> Result<Response<Full<Bytes>>, GitHttpError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let store = lookup_store(handler, repo)?;
    let gzip = req
        .headers()
        .get(CONTENT_ENCODING)
        .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"gzip"));

    let limit = handler.config().max_body_size;
    let mut body = read_body(req.into_body(), limit).await?;
    if gzip {
        body = gunzip(&body, limit)?;
    }

    let mut output = Vec::new();
    let result = match service {
        Service::UploadPack => {
            upload_pack(&body[..], &mut output, store.as_ref(), handler.codec())
                .await
                .map(|_| ())
        }
        Service::ReceivePack => {
            receive_pack(&body[..], &mut output, store.as_ref(), handler.codec())
                .await
                .map(|_| ())
        }
    };

    match result {
        Ok(()) => {}
        Err(ProtocolError::Unpack(e)) => {
            tracing::warn!("Push to '{}' rejected: {}", repo, e);
        }
        Err(e) => return Err(e.into()),
    }

    Ok(no_cache(text_response(
        StatusCode::OK,
        result_type(service),
        output,
    )))
}

/// `GET <repo>` from a browser: the advertised references as plain text
pub async fn browse(
    handler: &GitHttpHandler,
    repo: &str,
) -> Result<Response<Full<Bytes>>, GitHttpError> {
    let store = lookup_store(handler, repo)?;
    let refs = advertised_references(store.as_ref()).await?;

    let mut listing = String::new();
    for reference in &refs {
        if let Some(id) = reference.id() {
            let _ = writeln!(listing, "{} {}", id, reference.name());
        }
    }
    if listing.is_empty() {
        listing.push_str("(empty repository)\n");
    }

    Ok(text_response(
        StatusCode::OK,
        "text/plain; charset=utf-8",
        listing,
    ))
}

/// Collect a request body, failing once it grows past `limit`
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, GitHttpError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(GitHttpError::PayloadTooLarge { limit }),
        Err(e) => Err(GitHttpError::InvalidRequest(format!(
            "failed to read request body: {}",
            e
        ))),
    }
}

fn gunzip(data: &[u8], limit: usize) -> Result<Bytes, GitHttpError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| GitHttpError::InvalidRequest(format!("invalid gzip body: {}", e)))?;
    if out.len() > limit {
        return Err(GitHttpError::PayloadTooLarge { limit });
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn test_gunzip_respects_limit() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[b'a'; 64]).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(gunzip(&compressed, 64).unwrap().len(), 64);
        assert!(matches!(
            gunzip(&compressed, 63),
            Err(GitHttpError::PayloadTooLarge { limit: 63 })
        ));
        assert!(matches!(
            gunzip(b"not gzip", 64),
            Err(GitHttpError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_read_body_limit() {
        let body = Full::new(Bytes::from_static(b"0123456789"));
        assert_eq!(read_body(body, 10).await.unwrap().len(), 10);

        let body = Full::new(Bytes::from_static(b"0123456789"));
        assert!(matches!(
            read_body(body, 9).await,
            Err(GitHttpError::PayloadTooLarge { limit: 9 })
        ));
    }
}
