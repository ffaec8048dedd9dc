//! Error classification shared by every crate's error enum.

use serde::{Deserialize, Serialize};

/// Coarse class of a failure, used by callers to decide between retrying,
/// reporting a business rejection, or escalating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Transient contention (lock busy, admission slot taken). Retry later.
    Conflict,
    /// A business rule rejected the request.
    InvariantViolated,
    /// The addressed resource does not exist.
    NotFound,
    /// The caller is not allowed to act on the resource.
    Forbidden,
    /// An external dependency kept failing transiently.
    ExternalTransient,
    /// An external dependency rejected the request.
    ExternalTerminal,
    /// Storage or programming failure.
    Internal,
}

impl ErrorClass {
    /// Returns true if the same request may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Conflict | ErrorClass::ExternalTransient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Conflict => "Conflict",
            ErrorClass::InvariantViolated => "InvariantViolated",
            ErrorClass::NotFound => "NotFound",
            ErrorClass::Forbidden => "Forbidden",
            ErrorClass::ExternalTransient => "ExternalTransient",
            ErrorClass::ExternalTerminal => "ExternalTerminal",
            ErrorClass::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
