//! Transport seam between the dispatcher and the network
//!
//! The dispatcher and the bulk orchestrator only talk to [`Transport`]. The
//! hyper implementation lives in `http.rs`; tests plug in scripted transports.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;

use crate::ds3::error::Result;
use crate::ds3::request::RequestDescriptor;

/// Destination for a successful response body
///
/// Bodies arrive in network-sized pieces; implementors must not assume a
/// single call per response.
pub trait BodySink: Send {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;
}

impl<W: Write + Send> BodySink for W {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.write_all(chunk)?;
        Ok(())
    }
}

/// A descriptor bound to the endpoint it will be sent to
#[derive(Debug, Clone)]
pub struct PreparedRequest<'a> {
    /// Base URL, e.g. `http://ds3.example.com:8080`
    pub endpoint: &'a str,
    pub proxy: Option<&'a str>,
    pub request: &'a RequestDescriptor,
    /// Bytes to upload; the descriptor's own body unless overridden
    pub payload: Bytes,
}

impl<'a> PreparedRequest<'a> {
    pub fn new(endpoint: &'a str, proxy: Option<&'a str>, request: &'a RequestDescriptor) -> Self {
        Self {
            endpoint,
            proxy,
            request,
            payload: request.body().clone(),
        }
    }

    /// Upload `payload` instead of the descriptor body (per-object PUTs)
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }
}

/// Status line, headers and (for non-2xx responses) the buffered body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    /// Reason phrase when the transport knows it
    pub status_message: String,
    /// Header names are lowercase
    pub headers: BTreeMap<String, String>,
    /// Error body; empty for 2xx responses, whose body went to the sink
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// One HTTP exchange
///
/// Implementations sign and send the request once. A 2xx body is streamed
/// into `sink`; any other body is buffered into [`RawResponse::body`].
/// Connection failures are reported as `Ds3Error::Transport` and are not
/// retried here.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: &PreparedRequest<'_>,
        sink: &mut dyn BodySink,
    ) -> impl Future<Output = Result<RawResponse>> + Send;
}
