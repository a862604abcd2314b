//! Request and response envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use thiserror::Error;

/// One call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Fully qualified service name.
    pub service: String,
    /// Method within the service.
    pub method: String,
    /// Method argument.
    #[serde(default)]
    pub payload: Value,
}

/// The answer to one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResponse {
    /// The call succeeded.
    Ok {
        /// Method result.
        #[serde(default)]
        payload: Value,
    },
    /// The call failed.
    Error {
        /// Failure class.
        code: RpcCode,
        /// Human-readable detail.
        message: String,
    },
}

impl From<Result<Value, RpcStatus>> for RpcResponse {
    fn from(result: Result<Value, RpcStatus>) -> Self {
        match result {
            Ok(payload) => Self::Ok { payload },
            Err(status) => Self::Error {
                code: status.code,
                message: status.message,
            },
        }
    }
}

/// Failure classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RpcCode {
    /// The request could not be decoded.
    InvalidRequest,
    /// No such service or method.
    NotFound,
    /// The peer is not allowed to make this call.
    PermissionDenied,
    /// A dependency of the handler is unavailable.
    Unavailable,
    /// The handler failed.
    Internal,
}

/// A failed call, as returned by handlers and seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RpcStatus {
    /// Failure class.
    pub code: RpcCode,
    /// Human-readable detail.
    pub message: String,
}

impl RpcStatus {
    /// Builds a status.
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The request could not be decoded.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RpcCode::InvalidRequest, message)
    }

    /// No such service or method.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcCode::NotFound, message)
    }

    /// The peer may not make this call.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(RpcCode::PermissionDenied, message)
    }

    /// A dependency is unavailable.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unavailable, message)
    }

    /// The handler failed.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Internal, message)
    }
}
