//! XML response decoding
//!
//! Each `decode_*` function checks the document's root element first and
//! only then walks the known children into typed fields. Unknown elements and
//! attributes are logged and skipped without disturbing their siblings. On any
//! hard failure nothing is returned but the error.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt;
use tracing::{debug, warn};

use crate::ds3::error::{DecodeErrorKind, Ds3Error, Result};
use crate::ds3::types::{
    Bucket, BulkJobResponse, BulkObject, BulkObjectChunk, GetBucketResponse, GetServiceResponse,
    JobList, JobNode, JobPriority, JobRequestType, JobStatus, Owner, StorageObject,
    WriteOptimization,
};

/// Root elements the decoder knows how to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    ListAllMyBucketsResult,
    ListBucketResult,
    MasterObjectList,
    Jobs,
}

impl RootKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootKind::ListAllMyBucketsResult => "ListAllMyBucketsResult",
            RootKind::ListBucketResult => "ListBucketResult",
            RootKind::MasterObjectList => "MasterObjectList",
            RootKind::Jobs => "Jobs",
        }
    }
}

impl fmt::Display for RootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn reader_for(body: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;
    reader
}

fn unexpected_eof() -> Ds3Error {
    Ds3Error::decode(DecodeErrorKind::InvalidXml, "unexpected end of document")
}

fn missing(field: &str, element: &str) -> Ds3Error {
    Ds3Error::decode(
        DecodeErrorKind::MissingField,
        format!("'{}' element is missing required field '{}'", element, field),
    )
}

fn parse_u64(field: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        Ds3Error::decode(
            DecodeErrorKind::InvalidNumber,
            format!("'{}' is not an unsigned integer: '{}'", field, value),
        )
    })
}

fn parse_bool(field: &str, value: &str) -> bool {
    match value {
        "true" => true,
        "false" => false,
        other => {
            warn!(field, value = other, "Unknown boolean value, treating as false");
            false
        }
    }
}

fn unknown_element(name: &[u8]) {
    debug!(element = %String::from_utf8_lossy(name), "Unknown xml element");
}

fn unknown_attribute(name: &[u8]) {
    debug!(attribute = %String::from_utf8_lossy(name), "Unknown xml attribute");
}

/// Advance to the root element and verify its name.
///
/// Returns the root start tag and whether it was self-closing.
fn open_root<'a>(reader: &mut Reader<&'a [u8]>, expected: RootKind) -> Result<(BytesStart<'a>, bool)> {
    loop {
        let (start, empty) = match reader.read_event()? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::Eof => {
                return Err(Ds3Error::decode(
                    DecodeErrorKind::EmptyBody,
                    format!("expected a '{}' document but the body was empty", expected),
                ))
            }
            Event::Text(_) | Event::CData(_) | Event::End(_) => {
                return Err(Ds3Error::decode(
                    DecodeErrorKind::InvalidXml,
                    "content found before the root element",
                ))
            }
            _ => continue,
        };

        if start.local_name().as_ref() != expected.as_str().as_bytes() {
            return Err(Ds3Error::decode(
                DecodeErrorKind::InvalidRoot,
                format!(
                    "Expected the root element to be '{}'. The actual root element is: '{}'",
                    expected,
                    String::from_utf8_lossy(start.local_name().as_ref())
                ),
            ));
        }
        return Ok((start, empty));
    }
}

/// Collect the text content of the element whose start tag was just read
fn element_text(reader: &mut Reader<&[u8]>) -> Result<String> {
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(e) => text.push_str(&e.unescape()?),
            Event::CData(e) => text.push_str(&String::from_utf8_lossy(&e)),
            Event::Start(e) => {
                unknown_element(e.local_name().as_ref());
                reader.read_to_end(e.name())?;
            }
            Event::End(_) => return Ok(text),
            Event::Eof => return Err(unexpected_eof()),
            _ => {}
        }
    }
}

/// Skip an unknown element whose start tag was just read
fn skip_element(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> Result<()> {
    unknown_element(start.local_name().as_ref());
    reader.read_to_end(start.name())?;
    Ok(())
}

/// Read a child element that only carries text, tolerating `<Tag/>`
fn child_text(reader: &mut Reader<&[u8]>, empty: bool) -> Result<String> {
    if empty {
        Ok(String::new())
    } else {
        element_text(reader)
    }
}

fn read_owner(reader: &mut Reader<&[u8]>) -> Result<Owner> {
    let mut id = None;
    let mut display_name = None;

    loop {
        let (e, empty) = match reader.read_event()? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof()),
            _ => continue,
        };
        match e.local_name().as_ref() {
            b"ID" => id = Some(child_text(reader, empty)?),
            b"DisplayName" => display_name = Some(child_text(reader, empty)?),
            _ if empty => unknown_element(e.local_name().as_ref()),
            _ => skip_element(reader, &e)?,
        }
    }

    Ok(Owner {
        id: id.ok_or_else(|| missing("ID", "Owner"))?,
        display_name: display_name.ok_or_else(|| missing("DisplayName", "Owner"))?,
    })
}

fn read_bucket(reader: &mut Reader<&[u8]>) -> Result<Bucket> {
    let mut name = None;
    let mut creation_date = None;

    loop {
        let (e, empty) = match reader.read_event()? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof()),
            _ => continue,
        };
        match e.local_name().as_ref() {
            b"Name" => name = Some(child_text(reader, empty)?),
            b"CreationDate" => creation_date = Some(child_text(reader, empty)?),
            _ if empty => unknown_element(e.local_name().as_ref()),
            _ => skip_element(reader, &e)?,
        }
    }

    Ok(Bucket {
        name: name.filter(|n| !n.is_empty()).ok_or_else(|| missing("Name", "Bucket"))?,
        creation_date,
    })
}

/// Decode a `ListAllMyBucketsResult` document
pub fn decode_service(body: &[u8]) -> Result<GetServiceResponse> {
    let mut reader = reader_for(body);
    let (_, empty) = open_root(&mut reader, RootKind::ListAllMyBucketsResult)?;
    let mut response = GetServiceResponse::default();
    if empty {
        return Ok(response);
    }

    loop {
        let (e, empty) = match reader.read_event()? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof()),
            _ => continue,
        };
        match e.local_name().as_ref() {
            b"Owner" if !empty => response.owner = Some(read_owner(&mut reader)?),
            b"Buckets" if !empty => loop {
                match reader.read_event()? {
                    Event::Start(b) if b.local_name().as_ref() == b"Bucket" => {
                        response.buckets.push(read_bucket(&mut reader)?);
                    }
                    Event::Start(b) => skip_element(&mut reader, &b)?,
                    Event::Empty(b) => unknown_element(b.local_name().as_ref()),
                    Event::End(_) => break,
                    Event::Eof => return Err(unexpected_eof()),
                    _ => {}
                }
            },
            b"Owner" | b"Buckets" => {}
            _ if empty => unknown_element(e.local_name().as_ref()),
            _ => skip_element(&mut reader, &e)?,
        }
    }

    Ok(response)
}

fn read_contents(reader: &mut Reader<&[u8]>) -> Result<StorageObject> {
    let mut object = StorageObject::new(String::new(), 0);

    loop {
        let (e, empty) = match reader.read_event()? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof()),
            _ => continue,
        };
        match e.local_name().as_ref() {
            b"Key" => object.name = child_text(reader, empty)?,
            b"Size" => object.size = parse_u64("Size", &child_text(reader, empty)?)?,
            b"ETag" => object.etag = Some(child_text(reader, empty)?),
            b"LastModified" => object.last_modified = Some(child_text(reader, empty)?),
            b"StorageClass" => object.storage_class = Some(child_text(reader, empty)?),
            b"Owner" if !empty => object.owner = Some(read_owner(reader)?),
            _ if empty => unknown_element(e.local_name().as_ref()),
            _ => skip_element(reader, &e)?,
        }
    }

    if object.name.is_empty() {
        return Err(missing("Key", "Contents"));
    }
    Ok(object)
}

/// Decode a `ListBucketResult` document
pub fn decode_bucket(body: &[u8]) -> Result<GetBucketResponse> {
    let mut reader = reader_for(body);
    let (_, empty) = open_root(&mut reader, RootKind::ListBucketResult)?;
    let mut response = GetBucketResponse::default();

    if !empty {
        loop {
            let (e, empty) = match reader.read_event()? {
                Event::Start(e) => (e, false),
                Event::Empty(e) => (e, true),
                Event::End(_) => break,
                Event::Eof => return Err(unexpected_eof()),
                _ => continue,
            };
            match e.local_name().as_ref() {
                b"Name" => response.name = child_text(&mut reader, empty)?,
                b"Prefix" => response.prefix = Some(child_text(&mut reader, empty)?),
                b"Marker" => response.marker = Some(child_text(&mut reader, empty)?),
                b"NextMarker" => response.next_marker = Some(child_text(&mut reader, empty)?),
                b"Delimiter" => response.delimiter = Some(child_text(&mut reader, empty)?),
                b"CreationDate" => response.creation_date = Some(child_text(&mut reader, empty)?),
                b"MaxKeys" => {
                    let text = child_text(&mut reader, empty)?;
                    let value = parse_u64("MaxKeys", &text)?;
                    response.max_keys = Some(u32::try_from(value).map_err(|_| {
                        Ds3Error::decode(
                            DecodeErrorKind::InvalidNumber,
                            format!("'MaxKeys' out of range: {}", value),
                        )
                    })?);
                }
                b"IsTruncated" => {
                    response.is_truncated = parse_bool("IsTruncated", &child_text(&mut reader, empty)?);
                }
                b"Contents" if !empty => response.objects.push(read_contents(&mut reader)?),
                b"CommonPrefixes" if !empty => loop {
                    match reader.read_event()? {
                        Event::Start(p) if p.local_name().as_ref() == b"Prefix" => {
                            response.common_prefixes.push(element_text(&mut reader)?);
                        }
                        Event::Start(p) => skip_element(&mut reader, &p)?,
                        Event::End(_) => break,
                        Event::Eof => return Err(unexpected_eof()),
                        _ => {}
                    }
                },
                _ if empty => unknown_element(e.local_name().as_ref()),
                _ => skip_element(&mut reader, &e)?,
            }
        }
    }

    if response.name.is_empty() {
        return Err(missing("Name", "ListBucketResult"));
    }
    Ok(response)
}

/// Read job-level attributes shared by `MasterObjectList` and `Job`
fn job_from_attributes(start: &BytesStart<'_>) -> Result<BulkJobResponse> {
    let mut job = BulkJobResponse::new(String::new());

    for attribute in start.attributes() {
        let attribute = attribute?;
        let value = attribute.unescape_value()?;
        match attribute.key.local_name().as_ref() {
            b"JobId" => job.job_id = value.into_owned(),
            b"BucketName" => job.bucket_name = Some(value.into_owned()),
            b"StartDate" => job.start_date = Some(value.into_owned()),
            b"UserId" => job.user_id = Some(value.into_owned()),
            b"UserName" => job.user_name = Some(value.into_owned()),
            b"CachedSizeInBytes" => {
                job.cached_size_in_bytes = parse_u64("CachedSizeInBytes", &value)?;
            }
            b"CompletedSizeInBytes" => {
                job.completed_size_in_bytes = parse_u64("CompletedSizeInBytes", &value)?;
            }
            b"OriginalSizeInBytes" => {
                job.original_size_in_bytes = parse_u64("OriginalSizeInBytes", &value)?;
            }
            b"Priority" => {
                job.priority = Some(JobPriority::parse(&value).unwrap_or_else(|| {
                    warn!(priority = %value, "Unknown job priority, using LOW");
                    JobPriority::Low
                }));
            }
            b"RequestType" => {
                job.request_type = Some(JobRequestType::parse(&value).unwrap_or_else(|| {
                    warn!(request_type = %value, "Unknown request type, using GET");
                    JobRequestType::Get
                }));
            }
            b"Status" => {
                job.status = Some(JobStatus::parse(&value).unwrap_or_else(|| {
                    warn!(status = %value, "Unknown job status, using IN_PROGRESS");
                    JobStatus::InProgress
                }));
            }
            b"WriteOptimization" => {
                job.write_optimization = Some(WriteOptimization::parse(&value).unwrap_or_else(|| {
                    warn!(write_optimization = %value, "Unknown write optimization, using CAPACITY");
                    WriteOptimization::Capacity
                }));
            }
            b"ChunkClientProcessingOrderGuarantee" => {
                job.process_chunks_in_order = Some(match value.as_ref() {
                    "IN_ORDER" => true,
                    "NONE" => false,
                    other => parse_bool("ChunkClientProcessingOrderGuarantee", other),
                });
            }
            other => unknown_attribute(other),
        }
    }

    if job.job_id.is_empty() {
        return Err(missing("JobId", &String::from_utf8_lossy(start.local_name().as_ref())));
    }
    Ok(job)
}

/// Read the attributes of an `Objects` element into an empty chunk
fn chunk_from_attributes(start: &BytesStart<'_>) -> Result<BulkObjectChunk> {
    let mut chunk_number = None;
    let mut server_id = None;
    let mut chunk_id = None;

    for attribute in start.attributes() {
        let attribute = attribute?;
        let value = attribute.unescape_value()?;
        match attribute.key.local_name().as_ref() {
            b"ChunkNumber" => {
                chunk_number = Some(value.trim().parse::<u64>().map_err(|_| {
                    Ds3Error::decode(
                        DecodeErrorKind::MalformedChunk,
                        format!("chunk number is not an unsigned integer: '{}'", value),
                    )
                })?);
            }
            b"ServerId" | b"NodeId" => server_id = Some(value.into_owned()),
            b"ChunkId" => chunk_id = Some(value.into_owned()),
            other => unknown_attribute(other),
        }
    }

    let chunk_number = chunk_number.ok_or_else(|| {
        Ds3Error::decode(DecodeErrorKind::MalformedChunk, "chunk is missing its chunk number")
    })?;
    let server_id = server_id.filter(|id| !id.is_empty()).ok_or_else(|| {
        Ds3Error::decode(
            DecodeErrorKind::MalformedChunk,
            format!("chunk {} is missing its server id", chunk_number),
        )
    })?;

    Ok(BulkObjectChunk {
        chunk_number,
        server_id,
        chunk_id,
        objects: Vec::new(),
    })
}

fn bulk_object_from_attributes(start: &BytesStart<'_>) -> Result<BulkObject> {
    let mut object = BulkObject::new(String::new(), 0);

    for attribute in start.attributes() {
        let attribute = attribute?;
        let value = attribute.unescape_value()?;
        match attribute.key.local_name().as_ref() {
            b"Name" => object.name = value.into_owned(),
            b"Length" | b"Size" => object.size = parse_u64("Length", &value)?,
            b"Offset" => object.offset = parse_u64("Offset", &value)?,
            b"InCache" => object.in_cache = Some(parse_bool("InCache", &value)),
            other => unknown_attribute(other),
        }
    }

    if object.name.is_empty() {
        return Err(missing("Name", "Object"));
    }
    Ok(object)
}

/// Read the `Object` children of an `Objects` element
fn read_chunk_objects(reader: &mut Reader<&[u8]>, chunk: &mut BulkObjectChunk) -> Result<()> {
    loop {
        match reader.read_event()? {
            Event::Empty(e) if e.local_name().as_ref() == b"Object" => {
                chunk.objects.push(bulk_object_from_attributes(&e)?);
            }
            Event::Start(e) if e.local_name().as_ref() == b"Object" => {
                chunk.objects.push(bulk_object_from_attributes(&e)?);
                // Objects carry no known children
                reader.read_to_end(e.name())?;
            }
            Event::Start(e) => skip_element(reader, &e)?,
            Event::Empty(e) => unknown_element(e.local_name().as_ref()),
            Event::End(_) => return Ok(()),
            Event::Eof => return Err(unexpected_eof()),
            _ => {}
        }
    }
}

fn node_from_attributes(start: &BytesStart<'_>) -> Result<JobNode> {
    let mut node = JobNode {
        id: String::new(),
        endpoint: None,
        http_port: None,
        https_port: None,
    };

    for attribute in start.attributes() {
        let attribute = attribute?;
        let value = attribute.unescape_value()?;
        match attribute.key.local_name().as_ref() {
            b"Id" => node.id = value.into_owned(),
            b"EndPoint" => node.endpoint = Some(value.into_owned()),
            b"HttpPort" => node.http_port = value.trim().parse().ok(),
            b"HttpsPort" => node.https_port = value.trim().parse().ok(),
            other => unknown_attribute(other),
        }
    }

    if node.id.is_empty() {
        return Err(missing("Id", "Node"));
    }
    Ok(node)
}

fn read_nodes(reader: &mut Reader<&[u8]>, nodes: &mut Vec<JobNode>) -> Result<()> {
    loop {
        match reader.read_event()? {
            Event::Empty(e) if e.local_name().as_ref() == b"Node" => {
                nodes.push(node_from_attributes(&e)?);
            }
            Event::Start(e) if e.local_name().as_ref() == b"Node" => {
                nodes.push(node_from_attributes(&e)?);
                reader.read_to_end(e.name())?;
            }
            Event::Start(e) => skip_element(reader, &e)?,
            Event::Empty(e) => unknown_element(e.local_name().as_ref()),
            Event::End(_) => return Ok(()),
            Event::Eof => return Err(unexpected_eof()),
            _ => {}
        }
    }
}

/// Decode a `MasterObjectList` document (bulk start, job and chunk polls)
pub fn decode_master_object_list(body: &[u8]) -> Result<BulkJobResponse> {
    let mut reader = reader_for(body);
    let (root, empty) = open_root(&mut reader, RootKind::MasterObjectList)?;
    let mut response = job_from_attributes(&root)?;
    if empty {
        return Ok(response);
    }

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"Objects" => {
                    let mut chunk = chunk_from_attributes(&e)?;
                    read_chunk_objects(&mut reader, &mut chunk)?;
                    response.chunks.push(chunk);
                }
                b"Nodes" => read_nodes(&mut reader, &mut response.nodes)?,
                _ => skip_element(&mut reader, &e)?,
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"Objects" => response.chunks.push(chunk_from_attributes(&e)?),
                b"Nodes" => {}
                other => unknown_element(other),
            },
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof()),
            _ => {}
        }
    }

    Ok(response)
}

/// Decode a `Jobs` document (list of jobs, attributes only)
pub fn decode_jobs(body: &[u8]) -> Result<JobList> {
    let mut reader = reader_for(body);
    let (_, empty) = open_root(&mut reader, RootKind::Jobs)?;
    let mut list = JobList::default();
    if empty {
        return Ok(list);
    }

    loop {
        match reader.read_event()? {
            Event::Empty(e) if e.local_name().as_ref() == b"Job" => {
                list.jobs.push(job_from_attributes(&e)?);
            }
            Event::Start(e) if e.local_name().as_ref() == b"Job" => {
                list.jobs.push(job_from_attributes(&e)?);
                reader.read_to_end(e.name())?;
            }
            Event::Start(e) => skip_element(&mut reader, &e)?,
            Event::Empty(e) => unknown_element(e.local_name().as_ref()),
            Event::End(_) => break,
            Event::Eof => return Err(unexpected_eof()),
            _ => {}
        }
    }

    Ok(list)
}

/// Pull the `Message` out of an S3-style `<Error>` body, if there is one
pub fn decode_error_message(body: &[u8]) -> Option<String> {
    let mut reader = reader_for(body);
    let mut in_message = false;
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) if e.local_name().as_ref() == b"Message" => in_message = true,
            Event::Text(e) if in_message => return e.unescape().ok().map(|m| m.into_owned()),
            Event::End(_) => in_message = false,
            Event::Eof => return None,
            _ => {}
        }
    }
}
