//! The record store service's response envelope.
//!
//! Every response is normalized here, once, into [`Envelope`]. Callers
//! then turn it into a `Result` whose error carries a [`RemoteErrorKind`].

use crate::{error::Result, Error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error body of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// `{ success, data?, error? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

impl<T> Envelope<T> {
    /// A successful response carrying data.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// A successful response without a body.
    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    /// A failed response.
    pub fn err(message: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(EnvelopeError {
                message: message.into(),
                code: code.map(str::to_string),
            }),
        }
    }

    /// Failed response from a typed remote error.
    pub fn from_error(error: RemoteError) -> Self {
        let code = error.code.or_else(|| Some(error.kind.code().to_string()));
        Self {
            success: false,
            data: None,
            error: Some(EnvelopeError {
                message: error.message,
                code,
            }),
        }
    }

    /// The optional body, or the classified error.
    pub fn into_result(self) -> std::result::Result<Option<T>, RemoteError> {
        if self.success {
            return Ok(self.data);
        }
        let error = self.error.unwrap_or_else(|| EnvelopeError {
            message: "request failed without error details".into(),
            code: None,
        });
        Err(RemoteError {
            kind: RemoteErrorKind::from_code(error.code.as_deref()),
            message: error.message,
            code: error.code,
        })
    }

    /// The body, treating a successful response without one as rejected.
    pub fn into_data(self) -> std::result::Result<T, RemoteError> {
        self.into_result()?
            .ok_or_else(|| RemoteError::rejected("response reported success without data"))
    }
}

/// Parse a raw response body into an envelope.
///
/// Accepts the canonical envelope, a `{ "data": ... }` object without a
/// `success` flag, and a bare payload. The latter two are successes.
pub fn parse_envelope<T: DeserializeOwned>(raw: &str) -> Result<Envelope<T>> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| Error::InvalidEnvelope(e.to_string()))?;

    let is_canonical = matches!(&value, Value::Object(map) if map.contains_key("success"));
    if is_canonical {
        return serde_json::from_value(value).map_err(|e| Error::InvalidEnvelope(e.to_string()));
    }

    let payload = match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    let data: T =
        serde_json::from_value(payload).map_err(|e| Error::InvalidEnvelope(e.to_string()))?;
    Ok(Envelope::ok(data))
}

/// Classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Transport-level failure; retrying may help.
    NetworkFailure,
    /// The target does not exist. Deletes treat this as success.
    NotFound,
    /// The caller may not perform the operation.
    PermissionDenied,
    /// Any other server-side refusal.
    Rejected,
}

impl RemoteErrorKind {
    /// Map an envelope error code to a kind.
    pub fn from_code(code: Option<&str>) -> Self {
        match code.map(str::to_ascii_uppercase).as_deref() {
            Some("NOT_FOUND" | "404") => RemoteErrorKind::NotFound,
            Some("PERMISSION_DENIED" | "FORBIDDEN" | "UNAUTHORIZED" | "401" | "403") => {
                RemoteErrorKind::PermissionDenied
            }
            Some("NETWORK_FAILURE" | "TIMEOUT" | "UNAVAILABLE" | "503") => {
                RemoteErrorKind::NetworkFailure
            }
            _ => RemoteErrorKind::Rejected,
        }
    }

    /// Canonical code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            RemoteErrorKind::NetworkFailure => "NETWORK_FAILURE",
            RemoteErrorKind::NotFound => "NOT_FOUND",
            RemoteErrorKind::PermissionDenied => "PERMISSION_DENIED",
            RemoteErrorKind::Rejected => "REJECTED",
        }
    }
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteErrorKind::NetworkFailure => write!(f, "network failure"),
            RemoteErrorKind::NotFound => write!(f, "not found"),
            RemoteErrorKind::PermissionDenied => write!(f, "permission denied"),
            RemoteErrorKind::Rejected => write!(f, "rejected"),
        }
    }
}

/// A failed remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    pub code: Option<String>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NetworkFailure, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::PermissionDenied, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Rejected, message)
    }
}
