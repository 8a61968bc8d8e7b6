//! Error types for the onion data plane
//!
//! This module provides the error taxonomy shared by every layer:
//! - Detailed error variants for the different failure modes
//! - Error classification (fatal vs retryable)
//! - Error codes for programmatic handling

use crate::protocol::{DestroyReason, EndReason};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    ConnectionFailed = 100,
    Timeout = 101,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    HandshakeFailed = 203,

    // Circuit errors (3xx)
    CircuitTruncated = 300,
    CircuitDestroyed = 301,
    CircuitClosed = 302,

    // Stream errors (4xx)
    StreamConnectFailed = 400,
    StreamTimeout = 401,
    StreamClosed = 402,

    // Cryptographic errors (5xx)
    CryptoError = 500,

    // Configuration errors (8xx)
    InvalidRelay = 801,

    // Internal errors (9xx)
    InternalError = 900,
    InvalidState = 901,
}

/// Main error type for the data plane
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Connection Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // ===== Protocol Errors =====
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    // ===== Circuit Errors =====
    #[error("Circuit truncated after hop {hop}: reason={reason}")]
    CircuitTruncated { hop: usize, reason: DestroyReason },

    #[error("Circuit destroyed: reason={reason}")]
    CircuitDestroyed { reason: DestroyReason },

    #[error("Circuit closed")]
    CircuitClosed,

    // ===== Stream Errors =====
    #[error("Stream connect failed: reason={0}")]
    StreamConnectFailed(EndReason),

    #[error("Stream connect timed out")]
    StreamTimeout,

    #[error("Stream closed")]
    StreamClosed,

    // ===== Cryptographic Errors =====
    #[error("Crypto: {0}")]
    Crypto(String),

    // ===== Configuration Errors =====
    #[error("Invalid relay: {0}")]
    InvalidRelay(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TorError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            TorError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            TorError::Timeout(_) => ErrorCode::Timeout,

            TorError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            TorError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,

            TorError::CircuitTruncated { .. } => ErrorCode::CircuitTruncated,
            TorError::CircuitDestroyed { .. } => ErrorCode::CircuitDestroyed,
            TorError::CircuitClosed => ErrorCode::CircuitClosed,

            TorError::StreamConnectFailed(_) => ErrorCode::StreamConnectFailed,
            TorError::StreamTimeout => ErrorCode::StreamTimeout,
            TorError::StreamClosed => ErrorCode::StreamClosed,

            TorError::Crypto(_) => ErrorCode::CryptoError,
            TorError::InvalidRelay(_) => ErrorCode::InvalidRelay,

            TorError::Internal(_) => ErrorCode::InternalError,
            TorError::InvalidState(_) => ErrorCode::InvalidState,
        }
    }

    /// Whether this error indicates a local bug rather than a network condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, TorError::Internal(_) | TorError::Crypto(_))
    }

    /// Whether the caller may retry the operation with a different path
    ///
    /// This component never retries on its own. The orchestrating caller
    /// owns retry policy and uses this to decide.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::ConnectionFailed(_)
                | TorError::Timeout(_)
                | TorError::HandshakeFailed(_)
                | TorError::CircuitTruncated { .. }
                | TorError::CircuitDestroyed { .. }
                | TorError::CircuitClosed
                | TorError::StreamConnectFailed(_)
                | TorError::StreamTimeout
        )
    }

    /// Create a CircuitDestroyed error from a wire reason byte
    pub fn circuit_destroyed(reason: u8) -> Self {
        TorError::CircuitDestroyed {
            reason: DestroyReason::from(reason),
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        TorError::ProtocolViolation(msg.into())
    }

    pub(crate) fn handshake(msg: impl Into<String>) -> Self {
        TorError::HandshakeFailed(msg.into())
    }
}

impl From<TorError> for std::io::Error {
    fn from(err: TorError) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            TorError::Timeout(_) | TorError::StreamTimeout => ErrorKind::TimedOut,
            TorError::StreamConnectFailed(_) => ErrorKind::ConnectionRefused,
            TorError::StreamClosed => ErrorKind::BrokenPipe,
            TorError::CircuitClosed
            | TorError::CircuitDestroyed { .. }
            | TorError::CircuitTruncated { .. }
            | TorError::ConnectionFailed(_) => ErrorKind::ConnectionAborted,
            TorError::ProtocolViolation(_) => ErrorKind::InvalidData,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
