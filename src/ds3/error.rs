//! DS3 client errors

use std::fmt;
use thiserror::Error;

/// Why a response body could not be turned into a typed entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Root element is not the one the operation expects
    InvalidRoot,
    /// A chunk is missing its server id or chunk number
    MalformedChunk,
    /// A required element or attribute is absent
    MissingField,
    /// A numeric field did not parse as an unsigned integer
    InvalidNumber,
    /// The body is not well-formed XML
    InvalidXml,
    /// The body was empty where a document was required
    EmptyBody,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecodeErrorKind::InvalidRoot => "invalid root",
            DecodeErrorKind::MalformedChunk => "malformed chunk",
            DecodeErrorKind::MissingField => "missing field",
            DecodeErrorKind::InvalidNumber => "invalid number",
            DecodeErrorKind::InvalidXml => "invalid xml",
            DecodeErrorKind::EmptyBody => "empty body",
        };
        f.write_str(name)
    }
}

/// Well-formed responses that break the bulk job contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Job initiation returned no chunks for a non-empty object list
    EmptyPlan,
    /// Poll budget ran out with objects still unassigned
    JobTimedOut,
    /// A poll answered for a different job id
    StaleJob,
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolErrorKind::EmptyPlan => "empty plan",
            ProtocolErrorKind::JobTimedOut => "job timed out",
            ProtocolErrorKind::StaleJob => "stale job",
        };
        f.write_str(name)
    }
}

/// DS3 client errors
#[derive(Error, Debug)]
pub enum Ds3Error {
    #[error("Missing argument: {0}")]
    MissingArgument(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error ({kind}): {message}")]
    Decode {
        kind: DecodeErrorKind,
        message: String,
    },

    #[error("Protocol error ({kind}): {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        job_id: Option<String>,
        message: String,
    },

    #[error("DS3 error: {status} - {message}")]
    BadStatusCode {
        status: u16,
        message: String,
        body: String,
    },

    #[error("Too many redirects: gave up after {0}")]
    TooManyRedirects(u32),

    #[error("Job {job_id} failed: {source}")]
    Job {
        job_id: String,
        source: Box<Ds3Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Ds3Error>;

impl From<quick_xml::Error> for Ds3Error {
    fn from(err: quick_xml::Error) -> Self {
        Ds3Error::decode(DecodeErrorKind::InvalidXml, format!("XML parse error: {}", err))
    }
}

impl From<quick_xml::events::attributes::AttrError> for Ds3Error {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Ds3Error::decode(DecodeErrorKind::InvalidXml, format!("XML attribute error: {}", err))
    }
}

impl Ds3Error {
    pub fn decode(kind: DecodeErrorKind, message: impl Into<String>) -> Self {
        Ds3Error::Decode {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol(kind: ProtocolErrorKind, job_id: Option<&str>, message: impl Into<String>) -> Self {
        Ds3Error::Protocol {
            kind,
            job_id: job_id.map(str::to_string),
            message: message.into(),
        }
    }

    /// Attach a job id so the caller can resume or cancel the job.
    ///
    /// Errors that already carry the id are returned unchanged.
    pub fn with_job(self, job_id: &str) -> Self {
        match self {
            Ds3Error::Job { .. } => self,
            Ds3Error::Protocol { job_id: Some(_), .. } => self,
            other => Ds3Error::Job {
                job_id: job_id.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through a `Job` wrapper
    pub fn root(&self) -> &Ds3Error {
        match self {
            Ds3Error::Job { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn decode_kind(&self) -> Option<DecodeErrorKind> {
        match self.root() {
            Ds3Error::Decode { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn protocol_kind(&self) -> Option<ProtocolErrorKind> {
        match self.root() {
            Ds3Error::Protocol { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Job id the failure belongs to, if one had been issued
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Ds3Error::Job { job_id, .. } => Some(job_id),
            Ds3Error::Protocol { job_id, .. } => job_id.as_deref(),
            _ => None,
        }
    }

    /// Status code and body of a service-side rejection
    pub fn bad_status(&self) -> Option<(u16, &str)> {
        match self.root() {
            Ds3Error::BadStatusCode { status, body, .. } => Some((*status, body.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_job_wraps_once() {
        let err = Ds3Error::Transport("refused".to_string()).with_job("job-1");
        assert_eq!(err.job_id(), Some("job-1"));

        let again = err.with_job("job-2");
        assert_eq!(again.job_id(), Some("job-1"));
        assert!(matches!(again.root(), Ds3Error::Transport(_)));
    }

    #[test]
    fn test_protocol_error_keeps_its_job_id() {
        let err = Ds3Error::protocol(ProtocolErrorKind::JobTimedOut, Some("abc"), "gave up")
            .with_job("other");
        assert_eq!(err.job_id(), Some("abc"));
        assert_eq!(err.protocol_kind(), Some(ProtocolErrorKind::JobTimedOut));
    }

    #[test]
    fn test_kind_lookup_through_job_wrapper() {
        let err = Ds3Error::decode(DecodeErrorKind::MalformedChunk, "no server id").with_job("j");
        assert_eq!(err.decode_kind(), Some(DecodeErrorKind::MalformedChunk));
        assert_eq!(err.protocol_kind(), None);
    }
}
