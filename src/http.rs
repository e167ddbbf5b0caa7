// src/http.rs

//! HTTP transport used by the update engine
//!
//! All network-facing components talk to the [`HttpClient`] trait rather
//! than to a concrete client, mirroring how the gateway, registry, and
//! delta-stats fetchers each need their own header sets over one shared
//! connection pool. The production implementation wraps a blocking
//! reqwest client; tests drive the engine with in-crate fakes.
//!
//! Status handling follows the "response object" style: non-2xx responses
//! are returned to the caller for inspection, only transport-level
//! failures become errors.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Default timeout for HTTP requests (30 seconds)
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer size for streaming downloads (8 KiB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Ordered request headers as (name, value) pairs
pub type Headers = Vec<(String, String)>;

/// A completed HTTP exchange
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON; fails on malformed payloads
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Download(format!("malformed JSON response: {e}")))
    }

    pub fn status_line(&self) -> String {
        format!("HTTP {}", self.status)
    }
}

/// Sink receiving streamed response chunks
///
/// Returning an error aborts the transfer immediately; the blob
/// downloader uses this to stop as soon as a size cap is exceeded.
pub trait DownloadSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;
}

/// Transport abstraction shared by every network-facing component
pub trait HttpClient: Send + Sync {
    /// GET with per-request headers; aborts once the body exceeds `max_size`
    fn get(&self, url: &str, headers: &Headers, max_size: u64) -> Result<HttpResponse>;

    /// POST a JSON body; `None` sends an empty body
    fn post_json(
        &self,
        url: &str,
        headers: &Headers,
        body: Option<&serde_json::Value>,
    ) -> Result<HttpResponse>;

    /// PUT a JSON body
    fn put_json(&self, url: &str, headers: &Headers, body: &serde_json::Value)
        -> Result<HttpResponse>;

    /// Stream a GET response into `sink`, returning the HTTP status
    fn download(&self, url: &str, headers: &Headers, sink: &mut dyn DownloadSink) -> Result<u16>;

    /// Set a header applied to every subsequent request (e.g. `x-ats-target`)
    fn set_default_header(&self, name: &str, value: &str);
}

/// Blocking reqwest-backed implementation
pub struct ReqwestHttpClient {
    client: reqwest::blocking::Client,
    default_headers: Mutex<HashMap<String, String>>,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Unknown(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            default_headers: Mutex::new(HashMap::new()),
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: &Headers,
    ) -> reqwest::blocking::RequestBuilder {
        let mut builder = self.client.request(method, url);
        for (name, value) in self.default_headers.lock().unwrap().iter() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

impl HttpClient for ReqwestHttpClient {
    fn get(&self, url: &str, headers: &Headers, max_size: u64) -> Result<HttpResponse> {
        debug!("GET {}", url);
        let mut response = self
            .request(reqwest::Method::GET, url, headers)
            .send()
            .map_err(|e| Error::Download(format!("failed to fetch {url}: {e}")))?;

        let status = response.status().as_u16();
        let mut body = Vec::new();
        let mut buffer = [0u8; STREAM_BUFFER_SIZE];
        loop {
            let n = response
                .read(&mut buffer)
                .map_err(|e| Error::Download(format!("failed to read response from {url}: {e}")))?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buffer[..n]);
            if body.len() as u64 > max_size {
                return Err(Error::Download(format!(
                    "response from {url} exceeds the maximum allowed size of {max_size} bytes"
                )));
            }
        }

        Ok(HttpResponse { status, body })
    }

    fn post_json(
        &self,
        url: &str,
        headers: &Headers,
        body: Option<&serde_json::Value>,
    ) -> Result<HttpResponse> {
        debug!("POST {}", url);
        let mut builder = self.request(reqwest::Method::POST, url, headers);
        if let Some(json) = body {
            builder = builder.json(json);
        }
        let response = builder
            .send()
            .map_err(|e| Error::Download(format!("failed to post to {url}: {e}")))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| Error::Download(format!("failed to read response from {url}: {e}")))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }

    fn put_json(
        &self,
        url: &str,
        headers: &Headers,
        body: &serde_json::Value,
    ) -> Result<HttpResponse> {
        debug!("PUT {}", url);
        let response = self
            .request(reqwest::Method::PUT, url, headers)
            .json(body)
            .send()
            .map_err(|e| Error::Download(format!("failed to put to {url}: {e}")))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| Error::Download(format!("failed to read response from {url}: {e}")))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }

    fn download(&self, url: &str, headers: &Headers, sink: &mut dyn DownloadSink) -> Result<u16> {
        debug!("GET (streaming) {}", url);
        let mut response = self
            .request(reqwest::Method::GET, url, headers)
            .send()
            .map_err(|e| Error::Download(format!("failed to fetch {url}: {e}")))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Ok(status);
        }

        let mut buffer = [0u8; STREAM_BUFFER_SIZE];
        loop {
            let n = response
                .read(&mut buffer)
                .map_err(|e| Error::Download(format!("failed to read response from {url}: {e}")))?;
            if n == 0 {
                break;
            }
            sink.write_chunk(&buffer[..n])?;
        }

        Ok(status)
    }

    fn set_default_header(&self, name: &str, value: &str) {
        self.default_headers
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }
}
