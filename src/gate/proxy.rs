//! HTTP relay from the master to a worker's UNIX socket.

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, Uri, Version};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to connect to worker socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker handshake failed: {0}")]
    Handshake(#[source] hyper::Error),
    #[error("worker request failed: {0}")]
    Request(#[source] hyper::Error),
}

/// Connection-scoped headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Rewrite `request` into an HTTP/1.1 origin-form request.
fn prepare(request: &mut Request<Body>) {
    let authority = request.uri().authority().map(|a| a.as_str().to_string());
    let origin_form = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse::<Uri>()
        .unwrap_or_else(|_| Uri::from_static("/"));
    *request.uri_mut() = origin_form;
    *request.version_mut() = Version::HTTP_11;

    let headers = request.headers_mut();
    strip_hop_by_hop(headers);
    if !headers.contains_key(header::HOST) {
        let host = authority
            .and_then(|a| HeaderValue::from_str(&a).ok())
            .unwrap_or_else(|| HeaderValue::from_static("localhost"));
        headers.insert(header::HOST, host);
    }
}

/// Send `request` to the worker listening on `socket`.
pub async fn forward(socket: &Path, mut request: Request<Body>) -> Result<Response<Body>, ProxyError> {
    prepare(&mut request);

    let stream = UnixStream::connect(socket)
        .await
        .map_err(|source| ProxyError::Connect {
            path: socket.to_path_buf(),
            source,
        })?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(ProxyError::Handshake)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "Worker connection closed with error");
        }
    });

    let response: Response<Incoming> = sender
        .send_request(request)
        .await
        .map_err(ProxyError::Request)?;
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Body::new(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_form_becomes_origin_form() {
        let mut request = Request::get("https://panel.example:8000/api/x?y=1")
            .version(Version::HTTP_2)
            .header(header::CONNECTION, "keep-alive")
            .body(Body::empty())
            .unwrap();
        prepare(&mut request);
        assert_eq!(request.uri(), "/api/x?y=1");
        assert_eq!(request.version(), Version::HTTP_11);
        assert_eq!(request.headers()[header::HOST], "panel.example:8000");
        assert!(!request.headers().contains_key(header::CONNECTION));
    }

    #[test]
    fn keeps_existing_host() {
        let mut request = Request::get("/")
            .header(header::HOST, "a.example")
            .body(Body::empty())
            .unwrap();
        prepare(&mut request);
        assert_eq!(request.headers()[header::HOST], "a.example");
    }
}
