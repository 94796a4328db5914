//! HTTP forwarding to the current leader
//!
//! Non-leader instances proxy HTTP requests to the leader's HTTP address:
//! the leader's RPC endpoint with only the port substituted. The endpoint is
//! parsed as a URL, so hostnames work as well as IPs, and the scheme is
//! preserved. Method, path, query, headers and body pass through unchanged.

use crate::common::{Error, Result};
use crate::member::Member;
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use std::sync::Arc;
use std::time::Duration;

const FORWARD_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Leader HTTP base address from its RPC endpoint, e.g.
/// `http://10.0.0.3:8831` + port 5000 -> `http://10.0.0.3:5000`.
pub fn format_http_addr(endpoint: &str, http_port: u16) -> Result<String> {
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };
    let url = url::Url::parse(&with_scheme)
        .map_err(|e| Error::InvalidConfig(format!("bad leader endpoint {}: {}", endpoint, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidConfig(format!("leader endpoint {} has no host", endpoint)))?;
    Ok(format!("{}://{}:{}", url.scheme(), host, http_port))
}

pub struct ForwardClient {
    member: Arc<Member>,
    client: reqwest::Client,
    http_port: u16,
}

impl ForwardClient {
    pub fn new(member: Arc<Member>, http_port: u16) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            member,
            client,
            http_port,
        }
    }

    /// Proxy `req` to the leader. Callers check leadership first; this fails
    /// if no leader is known.
    pub async fn forward(&self, req: Request) -> Result<Response> {
        let endpoint = self
            .member
            .leader_endpoint()
            .ok_or_else(|| Error::NotLeader("unknown".into()))?;
        let base = format_http_addr(&endpoint, self.http_port)?;

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = format!("{}{}", base, path_and_query);

        let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
            .map_err(|e| Error::Internal(format!("bad method: {}", e)))?;
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in req.headers() {
            if name == axum::http::header::HOST {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.insert(name, value);
            }
        }
        let body = axum::body::to_bytes(req.into_body(), FORWARD_BODY_LIMIT)
            .await
            .map_err(|e| Error::Internal(format!("read request body: {}", e)))?;

        let upstream = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("forward to leader: {}", e)))?;

        let status = axum::http::StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
        let mut builder = Response::builder().status(status);
        for (name, value) in upstream.headers() {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
                axum::http::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                builder = builder.header(name, value);
            }
        }
        let bytes = upstream
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("read leader response: {}", e)))?;
        builder
            .body(Body::from(bytes))
            .map_err(|e| Error::Internal(format!("build response: {}", e)))
    }
}
