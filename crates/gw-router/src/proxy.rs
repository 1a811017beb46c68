//! Streaming proxy to engine instances

use crate::admission::SlotLease;
use crate::{GatewayError, Result};
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::response::Response;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, warn};

/// Response body that owns the slot lease.
///
/// The lease is released when the upstream body ends, when it fails (after
/// a trailing `{"error": ...}` chunk), or when this body is dropped because
/// the client went away.
pub struct ProxyBody {
    upstream: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    lease: Option<SlotLease>,
}

impl ProxyBody {
    pub fn new(upstream: BoxStream<'static, reqwest::Result<Bytes>>, lease: SlotLease) -> Self {
        Self {
            upstream: Some(upstream),
            lease: Some(lease),
        }
    }

    fn finish(&mut self) {
        self.upstream = None;
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }
}

/// Headers that describe one connection rather than the response
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::CONTENT_LENGTH,
];

/// Upstream response headers minus the hop-by-hop set. The length is
/// dropped as well; the body may end early with an error chunk.
fn passthrough_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if HOP_BY_HOP.contains(name)
            || name.as_str() == "keep-alive"
            || name.as_str() == "proxy-connection"
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn error_chunk(message: &str) -> Bytes {
    Bytes::from(serde_json::json!({ "error": message }).to_string())
}

impl Stream for ProxyBody {
    type Item = std::result::Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(upstream) = this.upstream.as_mut() else {
            return Poll::Ready(None);
        };

        match upstream.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                warn!(
                    instance = this.lease.as_ref().map(|l| l.instance_name()).unwrap_or_default(),
                    error = %e,
                    "Upstream stream failed"
                );
                this.finish();
                Poll::Ready(Some(Ok(error_chunk(&e.to_string()))))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }
}

/// Forwards request bodies to the instance behind a lease
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    client: reqwest::Client,
}

impl UpstreamProxy {
    /// Connections are bounded by `connect_timeout`; responses are not,
    /// since generations stream for as long as they take.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// POST `body` to `path` on the leased instance and stream the answer back.
    ///
    /// The slot number is merged into the body as `id_slot` and the `model`
    /// field is dropped; the instance serves exactly one model.
    pub async fn forward(
        &self,
        lease: SlotLease,
        path: &str,
        mut body: Map<String, Value>,
    ) -> Result<Response> {
        body.remove("model");
        body.insert("id_slot".to_string(), Value::from(lease.slot_number()));

        let mut url = lease.upstream().clone();
        url.set_path(path);
        debug!(instance = %lease.instance_name(), slot = lease.slot_number(), %url, "Forwarding");

        let upstream = match self.client.post(url.clone()).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                drop(lease);
                warn!(%url, error = %e, "Upstream request failed");
                return Err(GatewayError::UpstreamTransport(e.to_string()));
            }
        };

        let status = upstream.status();
        let headers = passthrough_headers(upstream.headers());
        let stream = ProxyBody::new(upstream.bytes_stream().boxed(), lease);

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}
