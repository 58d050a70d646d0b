//! DS3 client: request dispatch plus typed operations
//!
//! [`Ds3Client::dispatch`] is the only place a request meets the transport.
//! Every typed operation builds a [`RequestDescriptor`], dispatches it and
//! decodes the buffered body.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

use crate::ds3::bulk::TransferInstruction;
use crate::ds3::decoder;
use crate::ds3::error::{Ds3Error, Result};
use crate::ds3::http::HttpTransport;
use crate::ds3::request::{BulkKind, RequestDescriptor};
use crate::ds3::transport::{BodySink, PreparedRequest, RawResponse, Transport};
use crate::ds3::types::{
    AvailableChunksResponse, BulkJobResponse, BulkObject, ChunkOrdering, Credentials,
    GetBucketResponse, GetServiceResponse, JobList, ObjectMetadata,
};

/// Default number of 307 responses tolerated per call
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

/// Optional parameters of a bucket listing
#[derive(Debug, Clone, Default)]
pub struct ListBucketOptions {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub marker: Option<String>,
    pub max_keys: Option<u32>,
}

/// DS3 client over any [`Transport`]
///
/// Clone is cheap; clones share the transport.
pub struct Ds3Client<T> {
    transport: Arc<T>,
    endpoint: String,
    proxy: Option<String>,
    max_redirects: u32,
}

impl<T> Clone for Ds3Client<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            endpoint: self.endpoint.clone(),
            proxy: self.proxy.clone(),
            max_redirects: self.max_redirects,
        }
    }
}

impl Ds3Client<HttpTransport> {
    /// Client over the hyper transport, signing with `credentials`
    pub fn connect(endpoint: &str, credentials: &Credentials) -> Result<Self> {
        Self::new(endpoint, HttpTransport::new(credentials, false)?)
    }
}

impl<T: Transport> Ds3Client<T> {
    /// Create a client; `endpoint` without a scheme is taken as http
    pub fn new(endpoint: &str, transport: T) -> Result<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(Ds3Error::MissingArgument("endpoint".to_string()));
        }
        let endpoint = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        };

        Ok(Self {
            transport: Arc::new(transport),
            endpoint,
            proxy: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        })
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        let proxy = proxy.into();
        self.proxy = if proxy.is_empty() { None } else { Some(proxy) };
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the endpoint uses https
    pub fn is_secure(&self) -> bool {
        self.endpoint.starts_with("https://")
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn max_redirects(&self) -> u32 {
        self.max_redirects
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send `request` to the client endpoint
    ///
    /// A 2xx body goes to `sink`. 307 responses re-send the same request up to
    /// `max_redirects` times; other non-2xx statuses become `BadStatusCode`.
    pub async fn dispatch(&self, request: &RequestDescriptor, sink: &mut dyn BodySink) -> Result<RawResponse> {
        let prepared = PreparedRequest::new(&self.endpoint, self.proxy.as_deref(), request);
        self.dispatch_prepared(&prepared, sink).await
    }

    async fn dispatch_prepared(&self, prepared: &PreparedRequest<'_>, sink: &mut dyn BodySink) -> Result<RawResponse> {
        let mut redirects = 0u32;
        loop {
            let response = self.transport.send(prepared, sink).await?;

            if response.status == 307 {
                redirects += 1;
                info!(
                    path = prepared.request.path(),
                    redirects,
                    max_redirects = self.max_redirects,
                    "Request encountered a 307 redirect"
                );
                if redirects >= self.max_redirects {
                    return Err(Ds3Error::TooManyRedirects(redirects));
                }
                continue;
            }

            debug!(
                verb = prepared.request.verb().as_str(),
                path = prepared.request.path(),
                status = response.status,
                "Request completed"
            );

            if !response.is_success() {
                return Err(Self::bad_status(response));
            }
            return Ok(response);
        }
    }

    fn bad_status(response: RawResponse) -> Ds3Error {
        let message = decoder::decode_error_message(&response.body)
            .or_else(|| {
                if response.status_message.is_empty() {
                    None
                } else {
                    Some(response.status_message.clone())
                }
            })
            .unwrap_or_else(|| "Got an unexpected status code".to_string());
        Ds3Error::BadStatusCode {
            status: response.status,
            message,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }
    }

    /// Dispatch and return the whole successful body
    async fn dispatch_buffered(&self, request: &RequestDescriptor) -> Result<(RawResponse, Vec<u8>)> {
        let mut body = Vec::new();
        let response = self.dispatch(request, &mut body).await?;
        Ok((response, body))
    }

    /// List all buckets
    pub async fn get_service(&self) -> Result<GetServiceResponse> {
        let (_, body) = self.dispatch_buffered(&RequestDescriptor::get_service()).await?;
        decoder::decode_service(&body)
    }

    /// List objects in a bucket
    pub async fn get_bucket(&self, bucket: &str, options: &ListBucketOptions) -> Result<GetBucketResponse> {
        let mut request = RequestDescriptor::get_bucket(bucket)?;
        if let Some(prefix) = &options.prefix {
            request = request.with_prefix(prefix);
        }
        if let Some(delimiter) = &options.delimiter {
            request = request.with_delimiter(delimiter);
        }
        if let Some(marker) = &options.marker {
            request = request.with_marker(marker);
        }
        if let Some(max_keys) = options.max_keys {
            request = request.with_max_keys(max_keys);
        }
        let (_, body) = self.dispatch_buffered(&request).await?;
        decoder::decode_bucket(&body)
    }

    pub async fn put_bucket(&self, bucket: &str) -> Result<()> {
        self.dispatch_buffered(&RequestDescriptor::put_bucket(bucket)?).await?;
        Ok(())
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.dispatch_buffered(&RequestDescriptor::delete_bucket(bucket)?).await?;
        Ok(())
    }

    /// Object size, ETag and user metadata
    pub async fn head_object(&self, bucket: &str, object: &str) -> Result<ObjectMetadata> {
        let (response, _) = self
            .dispatch_buffered(&RequestDescriptor::head_object(bucket, object)?)
            .await?;

        let mut head = ObjectMetadata {
            content_length: response.header("content-length").and_then(|v| v.trim().parse().ok()),
            etag: response.header("etag").map(|v| v.trim_matches('"').to_string()),
            ..Default::default()
        };
        for (name, value) in &response.headers {
            if let Some(key) = name.strip_prefix("x-amz-meta-") {
                head.metadata.insert(key.to_string(), value.clone());
            }
        }
        Ok(head)
    }

    /// Stream an object into `sink`
    pub async fn get_object(&self, bucket: &str, object: &str, sink: &mut dyn BodySink) -> Result<()> {
        self.dispatch(&RequestDescriptor::get_object(bucket, object)?, sink).await?;
        Ok(())
    }

    pub async fn put_object(&self, bucket: &str, object: &str, data: Bytes) -> Result<()> {
        let request = RequestDescriptor::put_object(bucket, object, data.len() as u64)?;
        let prepared =
            PreparedRequest::new(&self.endpoint, self.proxy.as_deref(), &request).with_payload(data);
        self.dispatch_prepared(&prepared, &mut Vec::new()).await?;
        Ok(())
    }

    pub async fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
        self.dispatch_buffered(&RequestDescriptor::delete_object(bucket, object)?).await?;
        Ok(())
    }

    /// Start a bulk PUT job
    pub async fn put_bulk(&self, bucket: &str, objects: &[BulkObject]) -> Result<BulkJobResponse> {
        let (_, body) = self
            .dispatch_buffered(&RequestDescriptor::put_bulk(bucket, objects)?)
            .await?;
        decoder::decode_master_object_list(&body)
    }

    /// Start a bulk GET job
    pub async fn get_bulk(
        &self,
        bucket: &str,
        objects: &[BulkObject],
        ordering: ChunkOrdering,
    ) -> Result<BulkJobResponse> {
        let (_, body) = self
            .dispatch_buffered(&RequestDescriptor::get_bulk(bucket, objects, ordering)?)
            .await?;
        decoder::decode_master_object_list(&body)
    }

    /// Start a bulk job of either kind
    pub async fn start_bulk(
        &self,
        kind: BulkKind,
        bucket: &str,
        objects: &[BulkObject],
        ordering: ChunkOrdering,
    ) -> Result<BulkJobResponse> {
        match kind {
            BulkKind::Put => self.put_bulk(bucket, objects).await,
            BulkKind::Get => self.get_bulk(bucket, objects, ordering).await,
        }
    }

    /// Chunks of a job that are ready for transfer, plus any Retry-After hint
    pub async fn get_available_chunks(&self, job_id: &str) -> Result<AvailableChunksResponse> {
        let (response, body) = self
            .dispatch_buffered(&RequestDescriptor::get_available_chunks(job_id)?)
            .await?;
        let retry_after = response
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok());
        Ok(AvailableChunksResponse {
            job: decoder::decode_master_object_list(&body)?,
            retry_after,
        })
    }

    pub async fn get_jobs(&self) -> Result<JobList> {
        let (_, body) = self.dispatch_buffered(&RequestDescriptor::get_jobs()).await?;
        decoder::decode_jobs(&body)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<BulkJobResponse> {
        let (_, body) = self.dispatch_buffered(&RequestDescriptor::get_job(job_id)?).await?;
        decoder::decode_master_object_list(&body)
    }

    /// Resume a job, returning its refreshed state
    pub async fn put_job(&self, job_id: &str) -> Result<BulkJobResponse> {
        let (_, body) = self.dispatch_buffered(&RequestDescriptor::put_job(job_id)?).await?;
        decoder::decode_master_object_list(&body)
    }

    /// Cancel a job on the service side
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.dispatch_buffered(&RequestDescriptor::delete_job(job_id)?).await?;
        Ok(())
    }

    /// Endpoint an instruction should be sent to
    fn target_endpoint<'a>(&'a self, instruction: &'a TransferInstruction) -> &'a str {
        instruction.endpoint.as_deref().unwrap_or(&self.endpoint)
    }

    /// Upload one object of a bulk PUT job to its assigned node
    pub async fn put_object_for_job(&self, instruction: &TransferInstruction, data: Bytes) -> Result<()> {
        let request = RequestDescriptor::put_object_for_job(
            &instruction.bucket,
            &instruction.object.name,
            instruction.object.offset,
            data.len() as u64,
            &instruction.job_id,
        )?;
        let prepared = PreparedRequest::new(
            self.target_endpoint(instruction),
            self.proxy.as_deref(),
            &request,
        )
        .with_payload(data);
        debug!(
            job_id = %instruction.job_id,
            object = %instruction.object.name,
            server_id = %instruction.server_id,
            "Uploading object for job"
        );
        self.dispatch_prepared(&prepared, &mut Vec::new()).await?;
        Ok(())
    }

    /// Download one object of a bulk GET job from its assigned node
    pub async fn get_object_for_job(&self, instruction: &TransferInstruction, sink: &mut dyn BodySink) -> Result<()> {
        let request = RequestDescriptor::get_object_for_job(
            &instruction.bucket,
            &instruction.object.name,
            instruction.object.offset,
            &instruction.job_id,
        )?;
        let prepared = PreparedRequest::new(
            self.target_endpoint(instruction),
            self.proxy.as_deref(),
            &request,
        );
        debug!(
            job_id = %instruction.job_id,
            object = %instruction.object.name,
            server_id = %instruction.server_id,
            "Downloading object for job"
        );
        self.dispatch_prepared(&prepared, sink).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds3::request::Verb;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records what was sent
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<(u16, Vec<(&'static str, &'static str)>, &'static str)>>,
        sent: Mutex<Vec<(String, Verb, String)>>,
    }

    impl Scripted {
        fn reply(self, status: u16, headers: Vec<(&'static str, &'static str)>, body: &'static str) -> Self {
            self.responses.lock().unwrap().push_back((status, headers, body));
            self
        }
    }

    impl Transport for Scripted {
        async fn send(&self, prepared: &PreparedRequest<'_>, sink: &mut dyn BodySink) -> Result<RawResponse> {
            self.sent.lock().unwrap().push((
                prepared.endpoint.to_string(),
                prepared.request.verb(),
                prepared.request.path().to_string(),
            ));
            let next = self.responses.lock().unwrap().pop_front();
            let (status, headers, body) =
                next.ok_or_else(|| Ds3Error::Transport("connection refused".to_string()))?;

            let mut response = RawResponse {
                status,
                ..Default::default()
            };
            for (k, v) in headers {
                response.headers.insert(k.to_string(), v.to_string());
            }
            if response.is_success() {
                sink.write_chunk(body.as_bytes())?;
            } else {
                response.body = body.as_bytes().to_vec();
            }
            Ok(response)
        }
    }

    #[test]
    fn test_endpoint_required() {
        assert!(matches!(
            Ds3Client::new("  ", Scripted::default()),
            Err(Ds3Error::MissingArgument(_))
        ));
        let client = Ds3Client::new("ds3.local:8080/", Scripted::default()).unwrap();
        assert_eq!(client.endpoint(), "http://ds3.local:8080");
        assert_eq!(client.max_redirects(), DEFAULT_MAX_REDIRECTS);
    }

    #[tokio::test]
    async fn test_redirects_are_followed() {
        let transport = Scripted::default()
            .reply(307, vec![], "")
            .reply(307, vec![], "")
            .reply(200, vec![], "<ListAllMyBucketsResult/>");
        let client = Ds3Client::new("http://ds3", transport).unwrap();
        let service = client.get_service().await.unwrap();
        assert!(service.buckets.is_empty());
        assert_eq!(client.transport().sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_too_many_redirects() {
        let transport = Scripted::default()
            .reply(307, vec![], "")
            .reply(307, vec![], "");
        let client = Ds3Client::new("http://ds3", transport)
            .unwrap()
            .with_max_redirects(2);
        let err = client.get_service().await.unwrap_err();
        assert!(matches!(err, Ds3Error::TooManyRedirects(2)));
    }

    #[tokio::test]
    async fn test_bad_status_keeps_body() {
        let body = "<Error><Code>NoSuchBucket</Code><Message>missing</Message></Error>";
        let transport = Scripted::default().reply(404, vec![], body);
        let client = Ds3Client::new("http://ds3", transport).unwrap();
        let err = client.delete_bucket("photos").await.unwrap_err();
        match err {
            Ds3Error::BadStatusCode { status, message, body: error_body } => {
                assert_eq!(status, 404);
                assert_eq!(message, "missing");
                assert_eq!(error_body, body);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_retry_after_header() {
        let transport = Scripted::default().reply(
            200,
            vec![("retry-after", "7")],
            r#"<MasterObjectList JobId="j1"/>"#,
        );
        let client = Ds3Client::new("http://ds3", transport).unwrap();
        let chunks = client.get_available_chunks("j1").await.unwrap();
        assert_eq!(chunks.retry_after, Some(7));
        assert_eq!(chunks.job.job_id, "j1");
        assert!(chunks.job.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_head_object_metadata() {
        let transport = Scripted::default().reply(
            200,
            vec![
                ("content-length", "42"),
                ("etag", "\"abc\""),
                ("x-amz-meta-color", "blue"),
            ],
            "",
        );
        let client = Ds3Client::new("http://ds3", transport).unwrap();
        let head = client.head_object("b", "o").await.unwrap();
        assert_eq!(head.content_length, Some(42));
        assert_eq!(head.etag.as_deref(), Some("abc"));
        assert_eq!(head.metadata.get("color").map(String::as_str), Some("blue"));
    }

    #[tokio::test]
    async fn test_transfer_targets_node_endpoint() {
        let transport = Scripted::default().reply(200, vec![], "").reply(200, vec![], "");
        let client = Ds3Client::new("http://ds3", transport).unwrap();

        let mut instruction = TransferInstruction {
            job_id: "j1".to_string(),
            bucket: "b".to_string(),
            kind: BulkKind::Put,
            chunk_number: 0,
            server_id: "node1".to_string(),
            endpoint: Some("http://10.0.0.1:80".to_string()),
            object: BulkObject::new("a.txt", 3),
        };
        client
            .put_object_for_job(&instruction, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        instruction.endpoint = None;
        client.get_object_for_job(&instruction, &mut Vec::new()).await.unwrap();

        let sent = client.transport().sent.lock().unwrap();
        assert_eq!(sent[0], ("http://10.0.0.1:80".to_string(), Verb::Put, "/b/a.txt".to_string()));
        assert_eq!(sent[1], ("http://ds3".to_string(), Verb::Get, "/b/a.txt".to_string()));
    }
}
