//! DS3 protocol client
//!
//! This module provides:
//! - Typed DS3 entities and a quick-xml response decoder
//! - Pure request construction and the transport seam
//! - A hyper transport with AWS signature v2 signing
//! - Bulk job orchestration with bounded concurrent transfers

pub mod bulk;
pub mod client;
pub mod decoder;
pub mod error;
pub mod http;
pub mod request;
pub mod signer;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use bulk::{
    BulkConfig, BulkJob, BulkOrchestrator, JobState, Piece, PollOutcome, TransferInstruction,
};
pub use client::{Ds3Client, ListBucketOptions, DEFAULT_MAX_REDIRECTS};
pub use error::{DecodeErrorKind, Ds3Error, ProtocolErrorKind, Result};
pub use http::HttpTransport;
pub use request::{BulkKind, RequestDescriptor, Verb};
pub use signer::Ds3Signer;
pub use transport::{BodySink, PreparedRequest, RawResponse, Transport};
pub use types::{
    AvailableChunksResponse, Bucket, BulkJobResponse, BulkObject, BulkObjectChunk, ChunkOrdering,
    Credentials, GetBucketResponse, GetServiceResponse, JobList, JobNode, JobPriority,
    JobRequestType, JobStatus, ObjectMetadata, Owner, StorageObject, WriteOptimization,
};
