//! Request cloning: retarget an inbound request head at an upstream,
//! scrub hop-by-hop headers, and record the client in `X-Forwarded-*`.

use crate::extensions::SocketInfo;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::Uri;
use http::{Request, Version, request};

/// Headers that apply to a single transport hop and must not be forwarded.
///
/// Stripped from every outgoing request and from the primary response
/// before it is returned to the client.
pub const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");

/// Remove every hop-by-hop header.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Build a retargeted request head for one upstream.
///
/// Scheme and authority come from `target`; the paths are joined with
/// exactly one `/` at the seam and the query strings are concatenated.
/// The copy preserves header multiplicity, drops the hop-by-hop set,
/// pins the version to HTTP/1.1, and points `Host` at the target. The
/// body is left to the caller: each clone gets its own fan-out handle.
pub fn clone_request(inbound: &request::Parts, target: &Uri) -> Result<Request<()>, http::Error> {
    let uri = retarget(&inbound.uri, target)?;

    let mut headers = HeaderMap::with_capacity(inbound.headers.len());
    for (name, value) in &inbound.headers {
        headers.append(name.clone(), value.clone());
    }
    strip_hop_headers(&mut headers);
    if let Some(authority) = target.authority() {
        headers.insert(header::HOST, HeaderValue::from_str(authority.as_str())?);
    }
    apply_forwarded(&mut headers, inbound.extensions.get::<SocketInfo>());

    let mut request = Request::builder()
        .method(inbound.method.clone())
        .uri(uri)
        .version(Version::HTTP_11)
        .body(())?;
    *request.headers_mut() = headers;
    Ok(request)
}

fn retarget(incoming: &Uri, target: &Uri) -> Result<Uri, http::Error> {
    let path = join_path(target.path(), incoming.path());
    let path_and_query = match (target.query(), incoming.query()) {
        (Some(t), Some(q)) => format!("{path}?{t}&{q}"),
        (Some(t), None) => format!("{path}?{t}"),
        (None, Some(q)) => format!("{path}?{q}"),
        (None, None) => path,
    };

    let mut builder = Uri::builder().path_and_query(path_and_query);
    if let Some(scheme) = target.scheme() {
        builder = builder.scheme(scheme.as_str());
    }
    if let Some(authority) = target.authority() {
        builder = builder.authority(authority.as_str());
    }
    builder.build()
}

/// Join two URL paths with exactly one `/` between them.
fn join_path(target: &str, incoming: &str) -> String {
    match (target.ends_with('/'), incoming.starts_with('/')) {
        (true, true) => format!("{target}{}", &incoming[1..]),
        (false, false) => format!("{target}/{incoming}"),
        _ => format!("{target}{incoming}"),
    }
}

/// Record the client address in the forwarding headers.
///
/// Without a usable remote address the headers are left untouched. The
/// client IP is appended to any inbound `X-Forwarded-For` values;
/// `X-Forwarded-Port` is only set when not already present.
fn apply_forwarded(headers: &mut HeaderMap, socket: Option<&SocketInfo>) {
    let Some(remote) = socket.and_then(|info| info.remote) else {
        return;
    };

    let mut forwarded: Vec<String> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_owned)
        .collect();
    forwarded.push(remote.ip().to_string());
    if let Ok(value) = HeaderValue::from_str(&forwarded.join(", ")) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(&X_FORWARDED_PORT) {
        if let Ok(value) = HeaderValue::from_str(&remote.port().to_string()) {
            headers.insert(X_FORWARDED_PORT, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn parts_for(builder: http::request::Builder) -> request::Parts {
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        parts
    }

    fn remote(ip: [u8; 4], port: u16) -> SocketInfo {
        SocketInfo::with_remote(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
    }

    #[test]
    fn join_inserts_exactly_one_slash() {
        assert_eq!(join_path("/api/", "/v/2"), "/api/v/2");
        assert_eq!(join_path("/api", "v/2"), "/api/v/2");
        assert_eq!(join_path("/api/", "v/2"), "/api/v/2");
        assert_eq!(join_path("/api", "/v/2"), "/api/v/2");
    }

    #[test]
    fn retarget_joins_path_and_concatenates_queries() {
        let target: Uri = "http://h/api?t=1".parse().unwrap();
        let incoming: Uri = "/v/2?q=x".parse().unwrap();
        let uri = retarget(&incoming, &target).unwrap();
        assert_eq!(uri.to_string(), "http://h/api/v/2?t=1&q=x");
    }

    #[test]
    fn retarget_with_root_target_keeps_incoming_path() {
        let target: Uri = "http://a/".parse().unwrap();
        let incoming: Uri = "/p".parse().unwrap();
        let uri = retarget(&incoming, &target).unwrap();
        assert_eq!(uri.to_string(), "http://a/p");
    }

    #[test]
    fn retarget_with_only_one_query_side() {
        let target: Uri = "http://h/x?t=1".parse().unwrap();
        assert_eq!(
            retarget(&"/p".parse().unwrap(), &target).unwrap().to_string(),
            "http://h/x/p?t=1"
        );
        let plain: Uri = "http://h/x".parse().unwrap();
        assert_eq!(
            retarget(&"/p?q=2".parse().unwrap(), &plain).unwrap().to_string(),
            "http://h/x/p?q=2"
        );
    }

    #[test]
    fn clone_strips_hop_by_hop_and_keeps_multiplicity() {
        let parts = parts_for(
            Request::builder()
                .method("POST")
                .uri("/p")
                .header("connection", "keep-alive")
                .header("te", "trailers")
                .header("transfer-encoding", "chunked")
                .header("x-custom", "one")
                .header("x-custom", "two")
                .header("content-type", "text/plain"),
        );
        let target: Uri = "http://backend:9000/".parse().unwrap();
        let clone = clone_request(&parts, &target).unwrap();

        for name in &HOP_BY_HOP {
            assert!(!clone.headers().contains_key(name), "{name} must be stripped");
        }
        let customs: Vec<_> = clone
            .headers()
            .get_all("x-custom")
            .iter()
            .map(|value| value.to_str().unwrap())
            .collect();
        assert_eq!(customs, ["one", "two"]);
        assert_eq!(clone.headers()["content-type"], "text/plain");
        assert_eq!(clone.headers()["host"], "backend:9000");
        assert_eq!(clone.version(), Version::HTTP_11);
        assert_eq!(clone.method(), "POST");
    }

    #[test]
    fn forwarded_for_accumulates_and_port_is_set_once() {
        let mut parts = parts_for(
            Request::builder()
                .uri("/")
                .header("x-forwarded-for", "10.0.0.1"),
        );
        parts.extensions.insert(remote([192, 168, 1, 1], 5000));
        let clone = clone_request(&parts, &"http://b/".parse().unwrap()).unwrap();

        assert_eq!(clone.headers()["x-forwarded-for"], "10.0.0.1, 192.168.1.1");
        assert_eq!(clone.headers()["x-forwarded-port"], "5000");
    }

    #[test]
    fn forwarded_port_is_not_overwritten() {
        let mut parts = parts_for(
            Request::builder()
                .uri("/")
                .header("x-forwarded-port", "443"),
        );
        parts.extensions.insert(remote([10, 1, 1, 1], 6000));
        let clone = clone_request(&parts, &"http://b/".parse().unwrap()).unwrap();

        assert_eq!(clone.headers()["x-forwarded-port"], "443");
        assert_eq!(clone.headers()["x-forwarded-for"], "10.1.1.1");
    }

    #[test]
    fn forwarding_headers_untouched_without_remote_address() {
        let parts = parts_for(Request::builder().uri("/"));
        let clone = clone_request(&parts, &"http://b/".parse().unwrap()).unwrap();

        assert!(!clone.headers().contains_key("x-forwarded-for"));
        assert!(!clone.headers().contains_key("x-forwarded-port"));
    }
}
