//! Shared error taxonomy (spec.md §7). Each layer owns a `thiserror`
//! enum for its own failure modes; [`CoreError`] unifies them for
//! callers driving a radio through the [`crate::dispatcher::Dispatcher`].

use thiserror::Error;

use crate::engines::lte::LteError;
use crate::engines::mototrbo::MototrbeError;
use crate::engines::tetra::TetraError;
use crate::tea::TeaError;
use crate::xnl::session::XnlSessionError;

/// The error taxonomy shared across engines, per spec.md §7.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("authentication failed: code {0}")]
    AuthenticationFailed(u8),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("server error: {0}")]
    ServerError(String),
    #[error("background job failed: {0}")]
    JobFailed(String),
    #[error("invalid block size")]
    InvalidBlockSize,
}

impl From<TeaError> for CoreError {
    fn from(_e: TeaError) -> Self {
        CoreError::InvalidBlockSize
    }
}

impl From<XnlSessionError> for CoreError {
    fn from(e: XnlSessionError) -> Self {
        match e {
            XnlSessionError::ConnectionFailed(m) => CoreError::ConnectionFailed(m),
            XnlSessionError::Timeout => CoreError::Timeout,
            XnlSessionError::AuthenticationFailed(c) => CoreError::AuthenticationFailed(c),
            XnlSessionError::Protocol(m) => CoreError::ProtocolError(m),
            XnlSessionError::Frame(f) => CoreError::ProtocolError(f.to_string()),
        }
    }
}

impl From<MototrbeError> for CoreError {
    fn from(e: MototrbeError) -> Self {
        match e {
            MototrbeError::Session(s) => s.into(),
            MototrbeError::Protocol(m) => CoreError::ProtocolError(m),
            MototrbeError::NotSupported(m) => CoreError::NotSupported(m),
            MototrbeError::InvalidResponse(m) => CoreError::InvalidResponse(m),
        }
    }
}

impl From<TetraError> for CoreError {
    fn from(e: TetraError) -> Self {
        match e {
            TetraError::ConnectionFailed(m) => CoreError::ConnectionFailed(m),
            TetraError::Timeout => CoreError::Timeout,
            TetraError::CommandRejected(c) => CoreError::ProtocolError(format!("rejected: {c}")),
            TetraError::ChecksumMismatch => CoreError::ChecksumMismatch,
            TetraError::ReadFailure(addr) => {
                CoreError::ProtocolError(format!("read failure at {addr:#010x}"))
            }
            TetraError::WriteFailure(addr) => {
                CoreError::ProtocolError(format!("write failure at {addr:#010x}"))
            }
            TetraError::InvalidResponse(m) => CoreError::InvalidResponse(m),
        }
    }
}

impl From<LteError> for CoreError {
    fn from(e: LteError) -> Self {
        match e {
            LteError::ConnectionFailed(m) => CoreError::ConnectionFailed(m),
            LteError::Timeout => CoreError::Timeout,
            LteError::AuthenticationFailed => CoreError::AuthenticationFailed(0),
            LteError::Unauthorized => CoreError::Unauthorized,
            LteError::NotFound(m) => CoreError::NotFound(m),
            LteError::BadRequest(m) => CoreError::BadRequest(m),
            LteError::ServiceUnavailable => CoreError::ServiceUnavailable,
            LteError::ServerError(m) => CoreError::ServerError(m),
            LteError::JobFailed(m) => CoreError::JobFailed(m),
            LteError::InvalidResponse(m) => CoreError::InvalidResponse(m),
        }
    }
}
