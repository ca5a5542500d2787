//! Request classification
//!
//! Pure predicates over the path, query and headers of a request. Repository
//! ids are the path minus the protocol suffix and one leading slash.

use dgit_core::Service;
use hyper::Request;
use hyper::header::USER_AGENT;

const INFO_REFS_SUFFIX: &str = "/info/refs";

const BROWSER_AGENTS: [&str; 4] = ["Chrome", "Safari", "FireFox", "Mozilla"];

/// `GET <repo>/info/refs?service=<svc>`
pub fn list_refs_request<B>(req: &Request<B>) -> Option<(String, Service)> {
    let service = query_param(req.uri().query()?, "service")
        .and_then(|value| Service::from_name(&value))?;
    let repo = req.uri().path().strip_suffix(INFO_REFS_SUFFIX)?;
    Some((repository_id(repo), service))
}

/// `POST <repo>/git-upload-pack` or `POST <repo>/git-receive-pack`
pub fn pack_request<B>(req: &Request<B>) -> Option<(String, Service)> {
    let path = req.uri().path();
    Service::ALL.into_iter().find_map(|service| {
        let repo = path
            .strip_suffix(service.as_str())
            .and_then(|rest| rest.strip_suffix('/'))?;
        Some((repository_id(repo), service))
    })
}

/// Whether the user agent looks like a web browser
pub fn is_browser_request<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(USER_AGENT)
        .and_then(|agent| agent.to_str().ok())
        .is_some_and(|agent| BROWSER_AGENTS.iter().any(|needle| agent.contains(needle)))
}

fn repository_id(path: &str) -> String {
    path.strip_prefix('/').unwrap_or(path).to_string()
}

/// First value of `name` in a query string, percent-decoded
fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find(|(key, _)| urldecode(key) == name)
        .map(|(_, value)| urldecode(value))
}

/// Minimal URL percent-decoding
fn urldecode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut input = s.bytes();
    while let Some(b) = input.next() {
        match b {
            b'%' => {
                let hi = input.next().and_then(hex_val);
                let lo = input.next().and_then(hex_val);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => bytes.push(hi << 4 | lo),
                    // Malformed escapes never match a known value
                    _ => bytes.push(b'%'),
                }
            }
            b'+' => bytes.push(b' '),
            _ => bytes.push(b),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
