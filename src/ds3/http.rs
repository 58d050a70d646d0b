//! hyper-backed [`Transport`]
//!
//! - HTTP/1.1 pooled client with TCP_NODELAY
//! - native-tls for https endpoints
//! - Request signing with [`Ds3Signer`] on every send
//! - Successful bodies streamed straight into the caller's sink
//! - Plain http proxies reached with absolute-form request targets

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_LENGTH, DATE, HOST};
use hyper::{Method, Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use native_tls::TlsConnector;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::ds3::error::{Ds3Error, Result};
use crate::ds3::request::Verb;
use crate::ds3::signer::{Ds3Signer, SigningInput};
use crate::ds3::transport::{BodySink, PreparedRequest, RawResponse, Transport};
use crate::ds3::types::Credentials;

/// Hex lookup table for URI encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

fn transport_error(context: &str, err: impl std::fmt::Display) -> Ds3Error {
    Ds3Error::Transport(format!("{}: {}", context, err))
}

/// Transport over hyper's pooled client
///
/// Clone is cheap; the underlying client shares its pool.
#[derive(Clone)]
pub struct HttpTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    signer: Ds3Signer,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport signing with `credentials`
    ///
    /// `insecure_tls` disables certificate and hostname verification.
    pub fn new(credentials: &Credentials, insecure_tls: bool) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if insecure_tls {
            tracing::warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            TlsConnector::new()
        }
        .map_err(|e| transport_error("Failed to build TLS connector", e))?;

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(64)
            .set_host(true)
            .build(https);

        Ok(Self {
            client,
            signer: Ds3Signer::new(credentials),
            timeout: Duration::from_secs(300),
        })
    }

    /// Set the per-exchange timeout (headers and body)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Encode a request path, preserving forward slashes
    /// Returns Cow::Borrowed when no encoding is needed
    fn encode_path(path: &str) -> Cow<'_, str> {
        let needs_encoding = path
            .bytes()
            .any(|b| !matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/'));

        if !needs_encoding {
            return Cow::Borrowed(path);
        }

        let mut result = String::with_capacity(path.len() + 32);
        for byte in path.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                    result.push(byte as char);
                }
                _ => {
                    result.push('%');
                    result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                    result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
                }
            }
        }
        Cow::Owned(result)
    }

    /// Full URL for `path` and `query` against `endpoint`
    fn build_url(endpoint: &str, path: &str, query: &BTreeMap<String, Option<String>>) -> String {
        let endpoint = endpoint.trim_end_matches('/');
        let mut url = String::with_capacity(endpoint.len() + path.len() + query.len() * 24);
        url.push_str(endpoint);
        url.push_str(path);

        for (i, (key, value)) in query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(&urlencoding::encode(key));
            if let Some(value) = value {
                url.push('=');
                url.push_str(&urlencoding::encode(value));
            }
        }
        url
    }

    fn method(verb: Verb) -> Method {
        match verb {
            Verb::Get => Method::GET,
            Verb::Put => Method::PUT,
            Verb::Post => Method::POST,
            Verb::Delete => Method::DELETE,
            Verb::Head => Method::HEAD,
        }
    }

    /// Build the signed hyper request
    fn build_request(&self, prepared: &PreparedRequest<'_>) -> Result<Request<Full<Bytes>>> {
        let descriptor = prepared.request;
        let path = Self::encode_path(descriptor.path());
        let url = Self::build_url(prepared.endpoint, &path, descriptor.query());
        let uri: Uri = url
            .parse()
            .map_err(|e| transport_error(&format!("Invalid request URL '{}'", url), e))?;
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| Ds3Error::Transport(format!("Request URL has no host: '{}'", url)))?;

        let date = Ds3Signer::date_now();
        let content_type = descriptor
            .headers()
            .get("content-type")
            .map(String::as_str)
            .unwrap_or("");
        let authorization = self.signer.authorization(&SigningInput {
            verb: descriptor.verb().as_str(),
            content_md5: descriptor.md5().unwrap_or(""),
            content_type,
            date: &date,
            headers: descriptor.headers(),
            path: &path,
            has_delete: descriptor.query().contains_key("delete"),
        });

        let mut builder = Request::builder()
            .method(Self::method(descriptor.verb()))
            .uri(uri)
            .header(HOST, authority)
            .header(DATE, date)
            .header(AUTHORIZATION, authorization);

        if let Some(md5) = descriptor.md5() {
            builder = builder.header("content-md5", md5);
        }
        if matches!(descriptor.verb(), Verb::Put | Verb::Post) {
            builder = builder.header(CONTENT_LENGTH, prepared.payload.len());
        }
        for (key, value) in descriptor.headers() {
            builder = builder.header(key.as_str(), value.as_str());
        }

        builder
            .body(Full::new(prepared.payload.clone()))
            .map_err(|e| transport_error("Request build error", e))
    }

    /// Send through a plain http proxy, one connection per request
    async fn send_via_proxy(
        &self,
        proxy: &str,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>> {
        if request.uri().scheme_str() == Some("https") {
            return Err(Ds3Error::Transport(
                "https endpoints cannot be reached through an http proxy".to_string(),
            ));
        }

        let proxy_uri: Uri = proxy
            .parse()
            .map_err(|e| transport_error(&format!("Invalid proxy '{}'", proxy), e))?;
        let host = proxy_uri
            .host()
            .ok_or_else(|| Ds3Error::Transport(format!("Proxy has no host: '{}'", proxy)))?;
        let port = proxy_uri.port_u16().unwrap_or(80);

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| transport_error(&format!("Proxy connect to {}:{} failed", host, port), e))?;
        stream.set_nodelay(true)?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| transport_error("Proxy handshake failed", e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "Proxy connection closed with error");
            }
        });

        sender
            .send_request(request)
            .await
            .map_err(|e| transport_error("Request failed", e))
    }

    /// Stream a 2xx body into the sink, buffer anything else
    async fn read_response(response: Response<Incoming>, sink: &mut dyn BodySink) -> Result<RawResponse> {
        let status = response.status();
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        let mut raw = RawResponse {
            status: status.as_u16(),
            status_message: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body: Vec::new(),
        };

        if status.is_success() {
            let mut body = BodyStream::new(response.into_body());
            while let Some(frame_result) = body.next().await {
                let frame = frame_result.map_err(|e| transport_error("Body error", e))?;
                if let Some(chunk) = frame.data_ref() {
                    sink.write_chunk(chunk)?;
                }
            }
        } else {
            raw.body = response
                .collect()
                .await
                .map_err(|e| transport_error("Body error", e))?
                .to_bytes()
                .to_vec();
        }

        Ok(raw)
    }

    async fn exchange(&self, prepared: &PreparedRequest<'_>, sink: &mut dyn BodySink) -> Result<RawResponse> {
        let request = self.build_request(prepared)?;
        tracing::debug!(
            method = %request.method(),
            uri = %request.uri(),
            proxied = prepared.proxy.is_some(),
            "Sending request"
        );

        let response = match prepared.proxy {
            Some(proxy) => self.send_via_proxy(proxy, request).await?,
            None => self
                .client
                .request(request)
                .await
                .map_err(|e| transport_error("Request failed", e))?,
        };

        Self::read_response(response, sink).await
    }
}

impl Transport for HttpTransport {
    async fn send(&self, prepared: &PreparedRequest<'_>, sink: &mut dyn BodySink) -> Result<RawResponse> {
        match tokio::time::timeout(self.timeout, self.exchange(prepared, sink)).await {
            Ok(result) => result,
            Err(_) => Err(Ds3Error::Transport(format!(
                "Request timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds3::request::RequestDescriptor;

    fn transport() -> HttpTransport {
        let creds = Credentials::new("access", "secret").unwrap();
        HttpTransport::new(&creds, false).unwrap()
    }

    #[test]
    fn test_encode_path_no_encoding() {
        let result = HttpTransport::encode_path("/bucket/path/to/file.txt");
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(result, "/bucket/path/to/file.txt");
    }

    #[test]
    fn test_encode_path_with_encoding() {
        let result = HttpTransport::encode_path("/bucket/file with spaces+1.txt");
        assert!(matches!(result, Cow::Owned(_)));
        assert_eq!(result, "/bucket/file%20with%20spaces%2B1.txt");
    }

    #[test]
    fn test_build_url_with_query() {
        let request = RequestDescriptor::get_object_for_job("b", "a b", 0, "job 1").unwrap();
        let path = HttpTransport::encode_path(request.path());
        let url = HttpTransport::build_url("http://host:8080/", &path, request.query());
        assert_eq!(url, "http://host:8080/b/a%20b?job=job%201&offset=0");
    }

    #[test]
    fn test_build_url_flag_parameter() {
        let mut query = BTreeMap::new();
        query.insert("delete".to_string(), None);
        let url = HttpTransport::build_url("http://host", "/b", &query);
        assert_eq!(url, "http://host/b?delete");
    }

    #[tokio::test]
    async fn test_signed_request_headers() {
        let objects = vec![crate::ds3::types::BulkObject::new("a.txt", 3)];
        let request = RequestDescriptor::put_bulk("bucket", &objects).unwrap();
        let prepared = PreparedRequest::new("http://ds3.local:8080", None, &request);

        let built = transport().build_request(&prepared).unwrap();
        let headers = built.headers();
        assert_eq!(headers.get(HOST).unwrap(), "ds3.local:8080");
        assert!(headers.get(DATE).is_some());
        assert!(headers
            .get(AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("AWS access:"));
        assert_eq!(headers.get("content-md5").unwrap(), request.md5().unwrap());
        assert_eq!(
            headers.get(CONTENT_LENGTH).unwrap().to_str().unwrap(),
            request.body().len().to_string()
        );
        assert_eq!(built.uri().query(), Some("operation=start_bulk_put"));
    }

    #[tokio::test]
    async fn test_https_through_proxy_is_rejected() {
        let request = RequestDescriptor::get_service();
        let prepared = PreparedRequest::new("https://ds3.local", Some("http://proxy:3128"), &request);
        let mut sink = Vec::new();
        let err = transport().send(&prepared, &mut sink).await.unwrap_err();
        assert!(matches!(err, Ds3Error::Transport(_)));
    }
}
