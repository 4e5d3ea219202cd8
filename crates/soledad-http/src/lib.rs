//! Typed HTTP transport over the blob sync server API (spec §4.3, §6).
//!
//! A thin `reqwest`-backed client: GET/PUT/POST/DELETE with query params and
//! a streaming request body, header access for the `Tag` response header,
//! a JSON response helper, and [`check_http_status`] mapping server status
//! codes onto [`SoledadError`] the way the rest of the workspace expects.

#![deny(unsafe_code)]

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use soledad_core::{BlobId, SoledadError};

/// Name of the response header carrying a blob's content tag.
pub const TAG_HEADER: &str = "Tag";

/// Maps a server HTTP status onto the shared error taxonomy.
///
/// `200..=299` is success. `404` is [`SoledadError::BlobNotFound`], `409` is
/// [`SoledadError::BlobAlreadyExists`], `406` is [`SoledadError::InvalidFlags`]
/// (using `flags` if the caller has them), and anything else is wrapped as
/// retriable so the retry loop utility can re-dispatch it.
pub fn check_http_status(status: u16, blob_id: &str, flags: &[String]) -> Result<(), SoledadError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(SoledadError::BlobNotFound(blob_id.to_string())),
        409 => Err(SoledadError::BlobAlreadyExists(blob_id.to_string())),
        406 => Err(SoledadError::InvalidFlags { blob_id: blob_id.to_string(), flags: flags.to_vec() }),
        other => Err(SoledadError::RetriableTransfer(Box::new(SoledadError::Server(format!(
            "unexpected status {other}"
        ))))),
    }
}

/// Builds a query parameter that is omitted entirely when `value` is empty,
/// matching the server's "default namespace means no `namespace` param" rule.
pub fn optional_query_param(key: &str, value: &str) -> Vec<(String, String)> {
    if value.is_empty() {
        Vec::new()
    } else {
        vec![(key.to_string(), value.to_string())]
    }
}

/// A response from the blob sync server.
pub struct HttpResponse {
    status: StatusCode,
    headers: reqwest::header::HeaderMap,
    inner: reqwest::Response,
}

impl HttpResponse {
    /// Numeric HTTP status code.
    pub fn status(&self) -> u16 {
        self.status.as_u16()
    }

    /// The `Tag` response header, if present.
    pub fn tag(&self) -> Option<&str> {
        self.headers.get(TAG_HEADER).and_then(|v| v.to_str().ok())
    }

    /// Any response header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Consume the response body as raw bytes.
    pub async fn bytes(self) -> Result<Bytes, SoledadError> {
        self.inner.bytes().await.map_err(map_transport_err)
    }

    /// Consume the response body, deserializing it as JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, SoledadError> {
        self.inner.json().await.map_err(map_transport_err)
    }
}

fn map_transport_err(e: reqwest::Error) -> SoledadError {
    SoledadError::RetriableTransfer(Box::new(SoledadError::Server(e.to_string())))
}

/// Typed HTTP client for the blob sync server.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Build a transport pointed at `base_url` (no trailing slash expected).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: Client::new(), base_url: base_url.into() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// GET with optional query parameters.
    #[tracing::instrument(skip(self), fields(path))]
    pub async fn get(&self, path: &str, query: &[(String, String)]) -> Result<HttpResponse, SoledadError> {
        let resp = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(map_transport_err)?;
        to_http_response(resp)
    }

    /// GET with a `Range` header, for partial/resumable downloads.
    #[tracing::instrument(skip(self), fields(path, range_start))]
    pub async fn get_range(&self, path: &str, range_start: u64) -> Result<HttpResponse, SoledadError> {
        let resp = self
            .client
            .get(self.url(path))
            .header(reqwest::header::RANGE, format!("bytes={range_start}-"))
            .send()
            .await
            .map_err(map_transport_err)?;
        to_http_response(resp)
    }

    /// PUT a raw body (the codec's wire-encoded ciphertext).
    #[tracing::instrument(skip(self, body), fields(path, body_len = body.len()))]
    pub async fn put(&self, path: &str, body: Vec<u8>) -> Result<HttpResponse, SoledadError> {
        let resp = self
            .client
            .put(self.url(path))
            .body(body)
            .send()
            .await
            .map_err(map_transport_err)?;
        to_http_response(resp)
    }

    /// POST a JSON body (e.g. setting flags).
    #[tracing::instrument(skip(self, body), fields(path))]
    pub async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<HttpResponse, SoledadError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(map_transport_err)?;
        to_http_response(resp)
    }

    /// DELETE.
    #[tracing::instrument(skip(self), fields(path))]
    pub async fn delete(&self, path: &str) -> Result<HttpResponse, SoledadError> {
        let resp = self.client.delete(self.url(path)).send().await.map_err(map_transport_err)?;
        to_http_response(resp)
    }
}

fn to_http_response(resp: reqwest::Response) -> Result<HttpResponse, SoledadError> {
    Ok(HttpResponse { status: resp.status(), headers: resp.headers().clone(), inner: resp })
}

/// Apply [`check_http_status`] to a response's status, for blob-id-scoped calls.
pub fn ensure_ok(resp: &HttpResponse, blob_id: &BlobId, flags: &[String]) -> Result<(), SoledadError> {
    check_http_status(resp.status(), blob_id, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_the_server_contract() {
        assert!(check_http_status(200, "b", &[]).is_ok());
        assert!(matches!(check_http_status(404, "b", &[]).unwrap_err(), SoledadError::BlobNotFound(_)));
        assert!(matches!(check_http_status(409, "b", &[]).unwrap_err(), SoledadError::BlobAlreadyExists(_)));
        assert!(matches!(
            check_http_status(406, "b", &["BOGUS".to_string()]).unwrap_err(),
            SoledadError::InvalidFlags { .. }
        ));
        assert!(matches!(check_http_status(500, "b", &[]).unwrap_err(), SoledadError::RetriableTransfer(_)));
    }

    #[test]
    fn optional_query_param_omits_empty_values() {
        assert_eq!(optional_query_param("namespace", ""), Vec::<(String, String)>::new());
        assert_eq!(optional_query_param("namespace", "docs"), vec![("namespace".to_string(), "docs".to_string())]);
    }

    #[tokio::test]
    async fn get_and_put_round_trip_against_a_mock_server() {
        use std::io::{Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                let n = stream.read(&mut buf).unwrap();
                let request = String::from_utf8_lossy(&buf[..n]);
                if request.starts_with("PUT") {
                    stream.write_all(b"HTTP/1.1 200 OK\r\nTag: abc123\r\nContent-Length: 0\r\n\r\n").unwrap();
                } else {
                    stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                        .unwrap();
                }
            }
        });

        let transport = HttpTransport::new(format!("http://{addr}"));
        let put_resp = transport.put("/blobs/doc1", b"hello".to_vec()).await.unwrap();
        assert_eq!(put_resp.status(), 200);
        assert_eq!(put_resp.tag(), Some("abc123"));

        let get_resp = transport.get("/blobs/doc1", &[]).await.unwrap();
        let body = get_resp.bytes().await.unwrap();
        assert_eq!(&body[..], b"hello");

        handle.join().unwrap();
    }
}
