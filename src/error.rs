use std::io;

use thiserror::Error;

use crate::flow_key::FlowKey;

/// Failures decoding or encoding OpenFlow messages and packet headers.
#[derive(Debug, Error)]
pub enum OfpError {
    /// The buffer ended before the structure it declares.
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("unsupported OpenFlow version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("unknown message type code {0}")]
    UnknownMsgCode(u8),
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },
    #[error("i/o error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for OfpError {
    /// Reads past the end of an in-memory buffer surface as `Truncated`.
    fn from(e: io::Error) -> OfpError {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            OfpError::Truncated("message body")
        } else {
            OfpError::Io(e)
        }
    }
}

/// Controller-level failures.
///
/// Everything except `ConfigurationInvalid` is local to a single flow or event:
/// the controller records it and keeps running.
#[derive(Debug, Error)]
pub enum LbError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("no servers available")]
    NoServersAvailable,
    /// `bind` was called for a key that is already bound.
    #[error("duplicate binding for {0}")]
    DuplicateBinding(FlowKey),
    #[error("switch command failed: {0}")]
    SwitchCommandFailed(String),
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
}

impl From<OfpError> for LbError {
    fn from(e: OfpError) -> LbError {
        LbError::MalformedHeader(e.to_string())
    }
}
