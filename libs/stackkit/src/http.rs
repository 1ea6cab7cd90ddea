//! Minimal HTTP client for readiness probes.
//!
//! Service readiness only ever needs short plain-HTTP requests against
//! loopback endpoints, so this wraps the hyper legacy client directly
//! instead of carrying a full middleware stack.

use bytes::Bytes;
use http::{Method, Request, header};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::error::StackError;

/// Cheaply cloneable plain-HTTP client.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// POST a JSON body, returning `(status, body)`.
    ///
    /// # Errors
    /// [`StackError::Http`] on connection or protocol failures.
    pub async fn post_json(
        &self,
        uri: &str,
        body: &serde_json::Value,
    ) -> Result<(u16, Bytes), StackError> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .map_err(|e| StackError::Http(e.to_string()))?;
        self.send(request).await
    }

    /// Plain GET, returning `(status, body)`.
    ///
    /// # Errors
    /// [`StackError::Http`] on connection or protocol failures.
    pub async fn get(&self, uri: &str) -> Result<(u16, Bytes), StackError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| StackError::Http(e.to_string()))?;
        self.send(request).await
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<(u16, Bytes), StackError> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| StackError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| StackError::Http(e.to_string()))?
            .to_bytes();
        Ok((status, body))
    }
}
