//! Handler trait and the duplicating proxy orchestrator
//!
//! This module provides the `Handler` trait for processing HTTP requests
//! and `Duproxy`, its central implementation: every request is forwarded
//! to the primary upstream and mirrored to each secondary, all of them
//! reading the same streamed body through the fan-out hub. Only the
//! primary's response reaches the client; secondary responses are drained
//! and discarded.

use crate::body::{self, MultiReader, ProxyBody};
use crate::client::{HttpClient, RoundTrip};
use crate::request::{clone_request, strip_hop_headers};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode, Uri};
use http_body::Body;
use http_body_util::BodyExt;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Trait for types that can handle HTTP requests and produce responses
///
/// Generic over the request body type `B` so handlers can be exercised
/// with in-memory bodies in tests while the server feeds them the real
/// streaming body.
#[async_trait]
pub trait Handler<B>: Send + Sync {
    /// The error type returned by the handler
    type Error;

    /// Handle an HTTP request and produce a streaming response
    async fn handle(&self, request: Request<B>) -> Result<Response<ProxyBody>, Self::Error>;
}

/// The duplicating reverse proxy.
pub struct Duproxy<T = HttpClient> {
    primary: Uri,
    secondaries: Vec<Uri>,
    client: Arc<T>,
}

impl Duproxy<HttpClient> {
    /// Build a proxy over the default pooled HTTP/1.1 client.
    pub fn new(primary: Uri, secondaries: Vec<Uri>) -> Self {
        Self::with_client(primary, secondaries, HttpClient::new())
    }
}

impl<T: RoundTrip> Duproxy<T> {
    /// Build a proxy over a caller-supplied round-trip collaborator.
    pub fn with_client(primary: Uri, secondaries: Vec<Uri>, client: T) -> Self {
        Self {
            primary,
            secondaries,
            client: Arc::new(client),
        }
    }
}

#[async_trait]
impl<B, T> Handler<B> for Duproxy<T>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: fmt::Display,
    T: RoundTrip + 'static,
{
    type Error = Infallible;

    async fn handle(&self, request: Request<B>) -> Result<Response<ProxyBody>, Self::Error> {
        let (parts, inbound_body) = request.into_parts();
        let hub = MultiReader::new(inbound_body);

        // Every secondary is attached before the primary's first read: the
        // first append releases chunks below the slowest consumer, which
        // must already include all of them.
        for target in &self.secondaries {
            let consumer = hub.attach();
            let head = match clone_request(&parts, target) {
                Ok(head) => head,
                Err(err) => {
                    warn!(target = %target, error = %err, "failed to build secondary request");
                    continue;
                }
            };
            let (head, ()) = head.into_parts();
            let outgoing = Request::from_parts(head, consumer.boxed_unsync());
            let client = Arc::clone(&self.client);
            let target = target.clone();
            tokio::spawn(async move {
                match client.round_trip(outgoing).await {
                    Ok(response) => drain(response.into_body()).await,
                    Err(err) => warn!(target = %target, error = %err, "secondary round trip failed"),
                }
            });
        }

        let head = match clone_request(&parts, &self.primary) {
            Ok(head) => head,
            Err(err) => {
                warn!(target = %self.primary, error = %err, "failed to build primary request");
                return Ok(bad_gateway());
            }
        };
        let (head, ()) = head.into_parts();
        // The hub is the primary's body: reading it drives the shared
        // source, and dropping it releases the inbound stream.
        let outgoing = Request::from_parts(head, hub.boxed_unsync());

        match self.client.round_trip(outgoing).await {
            Ok(response) => {
                let (mut parts, response_body) = response.into_parts();
                strip_hop_headers(&mut parts.headers);
                Ok(Response::from_parts(parts, response_body))
            }
            Err(err) => {
                warn!(target = %self.primary, error = %err, "primary round trip failed");
                Ok(bad_gateway())
            }
        }
    }
}

/// Fully consume a secondary response so its connection can be reused.
async fn drain(mut body: ProxyBody) {
    while let Some(frame) = body.frame().await {
        if let Err(err) = frame {
            debug!(error = %err, "secondary response body error");
            break;
        }
    }
}

/// The response the client sees when the primary cannot be reached.
fn bad_gateway() -> Response<ProxyBody> {
    let mut response = Response::new(body::full("Bad Gateway"));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RoundTripError;
    use http::{HeaderMap, Method};
    use http_body_util::Full;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct RecordedCall {
        uri: Uri,
        method: Method,
        headers: HeaderMap,
        body: Vec<u8>,
    }

    /// Scripted upstream: records calls, fails fast for listed authorities,
    /// and signals completion of every round trip.
    struct MockClient {
        calls: Arc<Mutex<Vec<RecordedCall>>>,
        fail_authorities: Vec<&'static str>,
        done_tx: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl RoundTrip for MockClient {
        async fn round_trip(
            &self,
            request: Request<ProxyBody>,
        ) -> Result<Response<ProxyBody>, RoundTripError> {
            let (parts, request_body) = request.into_parts();
            let authority = parts
                .uri
                .authority()
                .map(|authority| authority.as_str().to_owned())
                .unwrap_or_default();

            if self.fail_authorities.contains(&authority.as_str()) {
                // Transport failure before a single body byte is read.
                drop(request_body);
                let _ = self.done_tx.send(());
                return Err(RoundTripError::new("connection refused"));
            }

            let collected = request_body
                .collect()
                .await
                .map_err(|err| RoundTripError::new(err.to_string()))?;
            self.calls.lock().unwrap().push(RecordedCall {
                uri: parts.uri,
                method: parts.method,
                headers: parts.headers,
                body: collected.to_bytes().to_vec(),
            });

            let mut response = Response::new(body::full("upstream response"));
            response
                .headers_mut()
                .insert("x-upstream", authority.parse().unwrap());
            response
                .headers_mut()
                .insert("connection", "keep-alive".parse().unwrap());
            let _ = self.done_tx.send(());
            Ok(response)
        }
    }

    struct Fixture {
        proxy: Duproxy<MockClient>,
        calls: Arc<Mutex<Vec<RecordedCall>>>,
        done_rx: mpsc::UnboundedReceiver<()>,
    }

    fn fixture(primary: &str, secondaries: &[&str], fail: Vec<&'static str>) -> Fixture {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let client = MockClient {
            calls: Arc::clone(&calls),
            fail_authorities: fail,
            done_tx,
        };
        let proxy = Duproxy::with_client(
            primary.parse().unwrap(),
            secondaries.iter().map(|s| s.parse().unwrap()).collect(),
            client,
        );
        Fixture {
            proxy,
            calls,
            done_rx,
        }
    }

    async fn await_round_trips(rx: &mut mpsc::UnboundedReceiver<()>, count: usize) {
        for _ in 0..count {
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("round trip did not complete")
                .expect("mock client gone");
        }
    }

    fn post(uri: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("connection", "close")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    #[tokio::test]
    async fn fans_out_to_primary_and_secondary() {
        let mut fx = fixture("http://a/", &["http://b/x"], Vec::new());

        let response = fx.proxy.handle(post("/p", "hello")).await.unwrap();
        await_round_trips(&mut fx.done_rx, 2).await;

        assert_eq!(response.status(), StatusCode::OK);
        // Hop-by-hop hygiene also applies to the returned response.
        assert!(!response.headers().contains_key("connection"));
        assert_eq!(response.headers()["x-upstream"], "a");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"upstream response");

        let calls = fx.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let primary = calls
            .iter()
            .find(|call| call.uri.authority().unwrap().as_str() == "a")
            .unwrap();
        assert_eq!(primary.uri.path(), "/p");
        assert_eq!(primary.method, Method::POST);
        assert_eq!(primary.body, b"hello");
        assert!(!primary.headers.contains_key("connection"));

        let secondary = calls
            .iter()
            .find(|call| call.uri.authority().unwrap().as_str() == "b")
            .unwrap();
        assert_eq!(secondary.uri.path(), "/x/p");
        assert_eq!(secondary.body, b"hello");
        assert!(!secondary.headers.contains_key("connection"));
    }

    #[tokio::test]
    async fn primary_failure_returns_bad_gateway_while_secondaries_finish() {
        let mut fx = fixture("http://a/", &["http://b/"], vec!["a"]);

        let response = fx.proxy.handle(post("/p", "payload")).await.unwrap();
        await_round_trips(&mut fx.done_rx, 2).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Bad Gateway");

        // The primary dropped the stream unread; the orphan drain still fed
        // the secondary the entire body.
        let calls = fx.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].uri.authority().unwrap().as_str(), "b");
        assert_eq!(calls[0].body, b"payload");
    }

    #[tokio::test]
    async fn without_secondaries_acts_as_a_plain_proxy() {
        let mut fx = fixture("http://a/base", &[], Vec::new());

        let response = fx.proxy.handle(post("/p", "solo")).await.unwrap();
        await_round_trips(&mut fx.done_rx, 1).await;

        assert_eq!(response.status(), StatusCode::OK);
        let calls = fx.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].uri.path(), "/base/p");
        assert_eq!(calls[0].body, b"solo");
    }
}
