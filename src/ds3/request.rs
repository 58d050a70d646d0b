//! Request descriptors for DS3 operations
//!
//! Every builder here is pure: it validates its arguments and returns an
//! immutable [`RequestDescriptor`]. Nothing is escaped at this layer; the
//! transport percent-encodes path segments and query values when it forms
//! the URL.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;

use crate::ds3::error::{Ds3Error, Result};
use crate::ds3::types::{BulkObject, ChunkOrdering};

/// Prefix for DS3-specific REST resources
const REST_PREFIX: &str = "/_rest_/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Put,
    Post,
    Delete,
    Head,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Put => "PUT",
            Verb::Post => "POST",
            Verb::Delete => "DELETE",
            Verb::Head => "HEAD",
        }
    }
}

/// Which bulk operation a request body describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkKind {
    Put,
    Get,
}

impl BulkKind {
    fn operation(&self) -> &'static str {
        match self {
            BulkKind::Put => "start_bulk_put",
            BulkKind::Get => "start_bulk_get",
        }
    }
}

/// One logical DS3 operation, ready for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    verb: Verb,
    path: String,
    headers: BTreeMap<String, String>,
    query: BTreeMap<String, Option<String>>,
    body: Bytes,
    length: Option<u64>,
    md5: Option<String>,
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Ds3Error::MissingArgument(format!("{} is required", what)));
    }
    Ok(())
}

fn bucket_path(prefix: &str, bucket: &str) -> Result<String> {
    require(bucket, "bucket name")?;
    let mut path = String::with_capacity(prefix.len() + bucket.len());
    path.push_str(prefix);
    path.push_str(bucket);
    Ok(path)
}

fn object_path(bucket: &str, object: &str) -> Result<String> {
    require(object, "object name")?;
    let mut path = bucket_path("/", bucket)?;
    path.push('/');
    path.push_str(object);
    Ok(path)
}

/// Escape XML special characters into an existing buffer
fn xml_escape_into(buf: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '"' => buf.push_str("&quot;"),
            '\'' => buf.push_str("&apos;"),
            _ => buf.push(ch),
        }
    }
}

/// Build the `<Objects>` document the service plans chunks from
fn bulk_body(kind: BulkKind, objects: &[BulkObject]) -> String {
    let mut xml = String::with_capacity(objects.len() * 64 + 64);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Objects>");
    for object in objects {
        xml.push_str("<Object Name=\"");
        xml_escape_into(&mut xml, &object.name);
        xml.push('"');
        if kind == BulkKind::Put {
            let _ = write!(xml, " Size=\"{}\"", object.size);
        }
        xml.push_str("/>");
    }
    xml.push_str("</Objects>");
    xml
}

impl RequestDescriptor {
    fn new(verb: Verb, path: String) -> Self {
        Self {
            verb,
            path,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: Bytes::new(),
            length: None,
            md5: None,
        }
    }

    fn with_query(mut self, key: &str, value: Option<String>) -> Self {
        self.query.insert(key.to_string(), value);
        self
    }

    /// List all buckets
    pub fn get_service() -> Self {
        Self::new(Verb::Get, "/".to_string())
    }

    /// List the objects in a bucket
    pub fn get_bucket(bucket: &str) -> Result<Self> {
        Ok(Self::new(Verb::Get, bucket_path("/", bucket)?))
    }

    pub fn put_bucket(bucket: &str) -> Result<Self> {
        Ok(Self::new(Verb::Put, bucket_path("/", bucket)?))
    }

    pub fn delete_bucket(bucket: &str) -> Result<Self> {
        Ok(Self::new(Verb::Delete, bucket_path("/", bucket)?))
    }

    pub fn head_object(bucket: &str, object: &str) -> Result<Self> {
        Ok(Self::new(Verb::Head, object_path(bucket, object)?))
    }

    pub fn get_object(bucket: &str, object: &str) -> Result<Self> {
        Ok(Self::new(Verb::Get, object_path(bucket, object)?))
    }

    pub fn delete_object(bucket: &str, object: &str) -> Result<Self> {
        Ok(Self::new(Verb::Delete, object_path(bucket, object)?))
    }

    /// Plain object PUT; `length` is the number of bytes the caller will send
    pub fn put_object(bucket: &str, object: &str, length: u64) -> Result<Self> {
        let mut request = Self::new(Verb::Put, object_path(bucket, object)?);
        request.length = Some(length);
        Ok(request)
    }

    /// GET of one object inside a bulk job
    pub fn get_object_for_job(bucket: &str, object: &str, offset: u64, job_id: &str) -> Result<Self> {
        require(job_id, "job id")?;
        Ok(Self::new(Verb::Get, object_path(bucket, object)?)
            .with_query("job", Some(job_id.to_string()))
            .with_query("offset", Some(offset.to_string())))
    }

    /// PUT of one object inside a bulk job
    pub fn put_object_for_job(
        bucket: &str,
        object: &str,
        offset: u64,
        length: u64,
        job_id: &str,
    ) -> Result<Self> {
        require(job_id, "job id")?;
        let mut request = Self::new(Verb::Put, object_path(bucket, object)?)
            .with_query("job", Some(job_id.to_string()))
            .with_query("offset", Some(offset.to_string()));
        request.length = Some(length);
        Ok(request)
    }

    fn bulk(kind: BulkKind, bucket: &str, objects: &[BulkObject]) -> Result<Self> {
        let path = bucket_path(&format!("{}bucket/", REST_PREFIX), bucket)?;
        if objects.is_empty() {
            return Err(Ds3Error::MissingArgument(
                "the bulk command requires a list of objects to process".to_string(),
            ));
        }
        if let Some(unnamed) = objects.iter().position(|o| o.name.is_empty()) {
            return Err(Ds3Error::MissingArgument(format!(
                "object #{} in the bulk list has no name",
                unnamed
            )));
        }

        let xml = bulk_body(kind, objects).into_bytes();
        let md5_hash = md5::compute(&xml);
        let md5_base64 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &md5_hash[..]);

        let mut request = Self::new(Verb::Put, path)
            .with_query("operation", Some(kind.operation().to_string()));
        request.headers.insert("content-type".to_string(), "application/xml".to_string());
        request.length = Some(xml.len() as u64);
        request.md5 = Some(md5_base64);
        request.body = Bytes::from(xml);
        Ok(request)
    }

    /// Start a bulk PUT job for the given objects
    pub fn put_bulk(bucket: &str, objects: &[BulkObject]) -> Result<Self> {
        Self::bulk(BulkKind::Put, bucket, objects)
    }

    /// Start a bulk GET job for the given objects
    pub fn get_bulk(bucket: &str, objects: &[BulkObject], ordering: ChunkOrdering) -> Result<Self> {
        let in_order = match ordering {
            ChunkOrdering::InOrder => "true",
            ChunkOrdering::None => "false",
        };
        Ok(Self::bulk(BulkKind::Get, bucket, objects)?
            .with_query("processChunksInOrder", Some(in_order.to_string())))
    }

    /// Ask which chunks of a job are ready for transfer
    pub fn get_available_chunks(job_id: &str) -> Result<Self> {
        require(job_id, "job id")?;
        Ok(Self::new(Verb::Get, format!("{}job_chunk/", REST_PREFIX))
            .with_query("job", Some(job_id.to_string())))
    }

    pub fn get_jobs() -> Self {
        Self::new(Verb::Get, format!("{}job", REST_PREFIX))
    }

    pub fn get_job(job_id: &str) -> Result<Self> {
        require(job_id, "job id")?;
        Ok(Self::new(Verb::Get, format!("{}job/{}", REST_PREFIX, job_id)))
    }

    /// Modify (resume) a job
    pub fn put_job(job_id: &str) -> Result<Self> {
        Ok(Self::get_job(job_id)?.with_verb(Verb::Put))
    }

    /// Cancel a job on the service side
    pub fn delete_job(job_id: &str) -> Result<Self> {
        Ok(Self::get_job(job_id)?.with_verb(Verb::Delete))
    }

    fn with_verb(mut self, verb: Verb) -> Self {
        self.verb = verb;
        self
    }

    pub fn with_prefix(self, prefix: &str) -> Self {
        self.with_query("prefix", Some(prefix.to_string()))
    }

    pub fn with_delimiter(self, delimiter: &str) -> Self {
        self.with_query("delimiter", Some(delimiter.to_string()))
    }

    pub fn with_marker(self, marker: &str) -> Self {
        self.with_query("marker", Some(marker.to_string()))
    }

    pub fn with_max_keys(self, max_keys: u32) -> Self {
        self.with_query("max-keys", Some(max_keys.to_string()))
    }

    /// Attach user metadata as an `x-amz-meta-` header
    pub fn with_metadata(self, name: &str, value: &str) -> Self {
        self.with_header(&format!("x-amz-meta-{}", name), value)
    }

    /// Set a header; header names are case-insensitive so keys are lowercased
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_md5(mut self, md5: &str) -> Self {
        self.md5 = Some(md5.to_string());
        self
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn query(&self) -> &BTreeMap<String, Option<String>> {
        &self.query
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).and_then(|v| v.as_deref())
    }

    /// Body carried by the descriptor itself (bulk requests)
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Declared content length, if the operation uploads data
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn md5(&self) -> Option<&str> {
        self.md5.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objects() -> Vec<BulkObject> {
        vec![BulkObject::new("a.txt", 10), BulkObject::new("b.txt", 20)]
    }

    #[test]
    fn test_get_service_path() {
        let request = RequestDescriptor::get_service();
        assert_eq!(request.verb(), Verb::Get);
        assert_eq!(request.path(), "/");
        assert!(request.query().is_empty());
    }

    #[test]
    fn test_object_path_is_verbatim() {
        let request = RequestDescriptor::get_object("bucket", "dir/file with spaces.txt").unwrap();
        assert_eq!(request.path(), "/bucket/dir/file with spaces.txt");
    }

    #[test]
    fn test_missing_arguments() {
        assert!(matches!(
            RequestDescriptor::get_bucket(""),
            Err(Ds3Error::MissingArgument(_))
        ));
        assert!(matches!(
            RequestDescriptor::delete_object("bucket", ""),
            Err(Ds3Error::MissingArgument(_))
        ));
        assert!(matches!(
            RequestDescriptor::put_bulk("bucket", &[]),
            Err(Ds3Error::MissingArgument(_))
        ));
        assert!(matches!(
            RequestDescriptor::get_available_chunks(""),
            Err(Ds3Error::MissingArgument(_))
        ));
        assert!(matches!(
            RequestDescriptor::get_job(""),
            Err(Ds3Error::MissingArgument(_))
        ));
    }

    #[test]
    fn test_put_bulk_request() {
        let request = RequestDescriptor::put_bulk("photos", &objects()).unwrap();
        assert_eq!(request.verb(), Verb::Put);
        assert_eq!(request.path(), "/_rest_/bucket/photos");
        assert_eq!(request.query_param("operation"), Some("start_bulk_put"));

        let body = std::str::from_utf8(request.body()).unwrap();
        assert!(body.contains("<Object Name=\"a.txt\" Size=\"10\"/>"));
        assert!(body.contains("<Object Name=\"b.txt\" Size=\"20\"/>"));
        assert_eq!(request.length(), Some(request.body().len() as u64));
        assert!(request.md5().is_some());
    }

    #[test]
    fn test_get_bulk_request_omits_sizes() {
        let request =
            RequestDescriptor::get_bulk("photos", &objects(), ChunkOrdering::InOrder).unwrap();
        assert_eq!(request.query_param("operation"), Some("start_bulk_get"));
        assert_eq!(request.query_param("processChunksInOrder"), Some("true"));

        let body = std::str::from_utf8(request.body()).unwrap();
        assert!(body.contains("<Object Name=\"a.txt\"/>"));
        assert!(!body.contains("Size="));
    }

    #[test]
    fn test_bulk_body_escapes_names() {
        let request =
            RequestDescriptor::put_bulk("b", &[BulkObject::new("a&\"b\".txt", 1)]).unwrap();
        let body = std::str::from_utf8(request.body()).unwrap();
        assert!(body.contains("Name=\"a&amp;&quot;b&quot;.txt\""));
    }

    #[test]
    fn test_job_requests() {
        let chunks = RequestDescriptor::get_available_chunks("job-1").unwrap();
        assert_eq!(chunks.path(), "/_rest_/job_chunk/");
        assert_eq!(chunks.query_param("job"), Some("job-1"));

        let delete = RequestDescriptor::delete_job("job-1").unwrap();
        assert_eq!(delete.verb(), Verb::Delete);
        assert_eq!(delete.path(), "/_rest_/job/job-1");

        let put = RequestDescriptor::put_object_for_job("b", "o", 128, 64, "job-1").unwrap();
        assert_eq!(put.query_param("offset"), Some("128"));
        assert_eq!(put.length(), Some(64));
    }

    #[test]
    fn test_headers_are_key_unique() {
        let request = RequestDescriptor::get_service()
            .with_header("X-Custom", "one")
            .with_header("x-custom", "two")
            .with_metadata("color", "blue");
        assert_eq!(request.headers().len(), 2);
        assert_eq!(request.headers().get("x-custom").map(String::as_str), Some("two"));
        assert_eq!(
            request.headers().get("x-amz-meta-color").map(String::as_str),
            Some("blue")
        );
    }
}
