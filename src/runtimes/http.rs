//! HTTP/1.1 client over the engine's UNIX socket.
//!
//! Both backends speak JSON over a local socket; this is the one shared
//! request helper. No TCP and no connection pooling: one short-lived
//! connection per request, which is how the engines expect CLI-grade
//! clients to behave.

use crate::error::{Error, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

/// Engine API client bound to one UNIX socket.
#[derive(Debug, Clone)]
pub(crate) struct EngineClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl EngineClient {
    pub(crate) fn new(socket: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket.as_ref().to_path_buf(),
            timeout: crate::constants::DEFAULT_LAB_TIMEOUT,
        }
    }

    /// Applies a per-request wall-clock budget.
    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Performs a GET and parses the JSON response.
    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.expect_success(Method::GET, path, None::<&()>).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Performs a GET and returns the raw body.
    pub(crate) async fn get_bytes(&self, path: &str) -> Result<Bytes> {
        self.expect_success(Method::GET, path, None::<&()>).await
    }

    /// Performs a POST with an optional JSON body and parses the JSON
    /// response.
    pub(crate) async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let body = self.expect_success(Method::POST, path, body).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Performs a POST and returns the raw response body. Used for streamed
    /// responses (image pulls, exec output) which are drained to completion.
    pub(crate) async fn post_bytes<B: Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<Bytes> {
        self.expect_success(Method::POST, path, body).await
    }

    /// Performs a POST and discards the response body.
    pub(crate) async fn post_empty<B: Serialize>(&self, path: &str, body: Option<&B>) -> Result<()> {
        self.expect_success(Method::POST, path, body).await?;
        Ok(())
    }

    /// Performs a DELETE and discards the response body.
    pub(crate) async fn delete(&self, path: &str) -> Result<()> {
        self.expect_success(Method::DELETE, path, None::<&()>).await?;
        Ok(())
    }

    async fn expect_success<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Bytes> {
        let (status, bytes) = self.request(method, path, body).await?;
        if !(200..300).contains(&status) {
            let message = engine_error_message(&bytes);
            return Err(Error::api(status, message));
        }
        Ok(bytes)
    }

    async fn request<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(u16, Bytes)> {
        let fut = self.request_inner(method, path, body);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.timeout)),
        }
    }

    async fn request_inner<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(u16, Bytes)> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("engine connection closed: {e}");
            }
        });

        let payload = match body {
            Some(b) => Bytes::from(serde_json::to_vec(b)?),
            None => Bytes::new(),
        };
        let request = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(hyper::header::HOST, "localhost")
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|e| Error::Config(format!("bad engine request {path:?}: {e}")))?;

        debug!(%method, path, "engine request");
        let response = sender.send_request(request).await?;
        let status = response.status().as_u16();
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok((status, bytes))
    }
}

/// Extracts the `message` field from an engine error body, falling back to
/// the raw text.
fn engine_error_message(body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct EngineError {
        message: String,
    }
    if let Ok(err) = serde_json::from_slice::<EngineError>(body) {
        return err.message;
    }
    String::from_utf8_lossy(body).trim().to_string()
}

/// Percent-encodes one query-string value (JSON filter payloads, image
/// references).
pub(crate) fn query_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
