//! DS3 entities and response structures

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::ds3::error::{Ds3Error, Result};

/// Access identity used to sign requests
///
/// Immutable once created. `Debug` never prints the secret key.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_id: String,
    secret_key: String,
}

impl Credentials {
    /// Create credentials; both parts must be non-empty
    pub fn new(access_id: impl Into<String>, secret_key: impl Into<String>) -> Result<Self> {
        let access_id = access_id.into();
        let secret_key = secret_key.into();
        if access_id.is_empty() {
            return Err(Ds3Error::MissingArgument("access id".to_string()));
        }
        if secret_key.is_empty() {
            return Err(Ds3Error::MissingArgument("secret key".to_string()));
        }
        Ok(Self {
            access_id,
            secret_key,
        })
    }

    pub fn access_id(&self) -> &str {
        &self.access_id
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_id", &self.access_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Owner of a bucket or object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// Display name
    pub display_name: String,
    /// Opaque owner id
    pub id: String,
}

/// A storage container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    pub creation_date: Option<String>,
}

/// An object inside a bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageObject {
    /// Object key
    pub name: String,
    /// ETag (optional)
    pub etag: Option<String>,
    /// Object size in bytes
    pub size: u64,
    /// Owner, when the listing includes it
    pub owner: Option<Owner>,
    /// Last modified timestamp (optional)
    pub last_modified: Option<String>,
    /// Storage class (optional)
    pub storage_class: Option<String>,
}

impl StorageObject {
    pub fn new(name: String, size: u64) -> Self {
        Self {
            name,
            etag: None,
            size,
            owner: None,
            last_modified: None,
            storage_class: None,
        }
    }
}

/// Response from the get service (list all buckets) operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetServiceResponse {
    pub owner: Option<Owner>,
    pub buckets: Vec<Bucket>,
}

/// Response from the get bucket (list objects) operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBucketResponse {
    /// Bucket name
    pub name: String,
    pub creation_date: Option<String>,
    pub prefix: Option<String>,
    pub marker: Option<String>,
    pub next_marker: Option<String>,
    pub delimiter: Option<String>,
    pub max_keys: Option<u32>,
    /// Whether more results are available past `next_marker`
    pub is_truncated: bool,
    pub objects: Vec<StorageObject>,
    /// Common prefixes (subdirectories when using delimiter)
    pub common_prefixes: Vec<String>,
}

/// One object named for bulk transfer
///
/// Callers fill `name` and `size`. `offset` and `in_cache` come back from the
/// service when the object appears inside a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkObject {
    pub name: String,
    /// Size in bytes (the `Length` of the blob inside a chunk)
    pub size: u64,
    pub offset: u64,
    pub in_cache: Option<bool>,
}

impl BulkObject {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            offset: 0,
            in_cache: None,
        }
    }
}

/// A chunk of a bulk job, bound to one storage node
///
/// An empty object list means the chunk is not ready yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkObjectChunk {
    /// Chunk number, unique within the job
    pub chunk_number: u64,
    /// Id of the node the chunk is assigned to
    pub server_id: String,
    /// Service-side chunk id (newer servers only)
    pub chunk_id: Option<String>,
    pub objects: Vec<BulkObject>,
}

impl BulkObjectChunk {
    pub fn is_ready(&self) -> bool {
        !self.objects.is_empty()
    }
}

/// A storage node listed in a job response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNode {
    pub id: String,
    pub endpoint: Option<String>,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
}

impl JobNode {
    /// Base URL for the node in the client's scheme
    ///
    /// Uses the port listed for that scheme. Returns `None` when the node
    /// only lists a port for the other scheme, so the caller keeps its own
    /// endpoint.
    pub fn base_url(&self, secure: bool) -> Option<String> {
        let endpoint = self.endpoint.as_deref()?;
        let scheme = if secure { "https" } else { "http" };
        let port = if secure { self.https_port } else { self.http_port };
        match (port, self.http_port.or(self.https_port)) {
            (Some(port), _) => Some(format!("{}://{}:{}", scheme, endpoint, port)),
            (None, None) => Some(format!("{}://{}", scheme, endpoint)),
            (None, Some(_)) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPriority {
    Critical,
    VeryHigh,
    High,
    Normal,
    Low,
    Background,
    MinimizedDueToTooManyRetries,
}

impl JobPriority {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CRITICAL" => Some(JobPriority::Critical),
            "VERY_HIGH" => Some(JobPriority::VeryHigh),
            "HIGH" => Some(JobPriority::High),
            "NORMAL" => Some(JobPriority::Normal),
            "LOW" => Some(JobPriority::Low),
            "BACKGROUND" => Some(JobPriority::Background),
            "MINIMIZED_DUE_TO_TOO_MANY_RETRIES" => Some(JobPriority::MinimizedDueToTooManyRetries),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobRequestType {
    Put,
    Get,
}

impl JobRequestType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PUT" => Some(JobRequestType::Put),
            "GET" => Some(JobRequestType::Get),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    InProgress,
    Completed,
    Canceled,
}

impl JobStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IN_PROGRESS" => Some(JobStatus::InProgress),
            "COMPLETED" => Some(JobStatus::Completed),
            "CANCELED" => Some(JobStatus::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOptimization {
    Capacity,
    Performance,
}

impl WriteOptimization {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CAPACITY" => Some(WriteOptimization::Capacity),
            "PERFORMANCE" => Some(WriteOptimization::Performance),
            _ => None,
        }
    }
}

/// Whether the client must process bulk GET chunks in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChunkOrdering {
    InOrder,
    #[default]
    None,
}

/// Result of job initiation or a job poll (`MasterObjectList`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkJobResponse {
    /// Service-issued job id
    pub job_id: String,
    pub bucket_name: Option<String>,
    pub request_type: Option<JobRequestType>,
    pub status: Option<JobStatus>,
    pub priority: Option<JobPriority>,
    pub write_optimization: Option<WriteOptimization>,
    pub start_date: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub cached_size_in_bytes: u64,
    pub completed_size_in_bytes: u64,
    pub original_size_in_bytes: u64,
    pub process_chunks_in_order: Option<bool>,
    /// Chunks, in wire order (not necessarily by chunk number)
    pub chunks: Vec<BulkObjectChunk>,
    pub nodes: Vec<JobNode>,
}

impl BulkJobResponse {
    pub fn new(job_id: String) -> Self {
        Self {
            job_id,
            bucket_name: None,
            request_type: None,
            status: None,
            priority: None,
            write_optimization: None,
            start_date: None,
            user_id: None,
            user_name: None,
            cached_size_in_bytes: 0,
            completed_size_in_bytes: 0,
            original_size_in_bytes: 0,
            process_chunks_in_order: None,
            chunks: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&JobNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Number of objects across all chunks
    pub fn object_count(&self) -> usize {
        self.chunks.iter().map(|c| c.objects.len()).sum()
    }
}

/// Headers returned by a head object request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    /// User metadata with the `x-amz-meta-` prefix stripped
    pub metadata: BTreeMap<String, String>,
}

/// Response from the get available chunks operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableChunksResponse {
    pub job: BulkJobResponse,
    /// Seconds the service asked us to wait before polling again
    pub retry_after: Option<u64>,
}

/// Response from the get jobs operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobList {
    pub jobs: Vec<BulkJobResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_require_both_parts() {
        assert!(Credentials::new("", "secret").is_err());
        assert!(Credentials::new("id", "").is_err());
        assert!(Credentials::new("id", "secret").is_ok());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials::new("AKID", "very-secret").unwrap();
        let printed = format!("{:?}", creds);
        assert!(printed.contains("AKID"));
        assert!(!printed.contains("very-secret"));
    }

    #[test]
    fn test_node_base_url() {
        let node = JobNode {
            id: "n1".to_string(),
            endpoint: Some("10.0.0.5".to_string()),
            http_port: Some(80),
            https_port: None,
        };
        assert_eq!(node.base_url(false).as_deref(), Some("http://10.0.0.5:80"));
        // No https port listed: stay on the client endpoint
        assert_eq!(node.base_url(true), None);

        let unnamed = JobNode {
            id: "n2".to_string(),
            endpoint: None,
            http_port: Some(80),
            https_port: Some(443),
        };
        assert_eq!(unnamed.base_url(false), None);
    }

    #[test]
    fn test_node_base_url_follows_client_scheme() {
        let node = JobNode {
            id: "n1".to_string(),
            endpoint: Some("10.0.0.1".to_string()),
            http_port: Some(80),
            https_port: Some(443),
        };
        assert_eq!(node.base_url(false).as_deref(), Some("http://10.0.0.1:80"));
        assert_eq!(node.base_url(true).as_deref(), Some("https://10.0.0.1:443"));

        let bare = JobNode {
            id: "n3".to_string(),
            endpoint: Some("node3.local".to_string()),
            http_port: None,
            https_port: None,
        };
        assert_eq!(bare.base_url(true).as_deref(), Some("https://node3.local"));
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(JobPriority::parse("VERY_HIGH"), Some(JobPriority::VeryHigh));
        assert_eq!(JobStatus::parse("CANCELED"), Some(JobStatus::Canceled));
        assert_eq!(JobRequestType::parse("put"), None);
    }
}
