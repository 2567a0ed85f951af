//! Payload helpers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An exception carried as an ordinary value.
///
/// A body that yields an `ExceptionValue` produces data: the output is
/// stored and fetched like any other value. Only an error escaping the body
/// fails the task.
///
/// # Examples
///
/// ```
/// use refgen::types::ExceptionValue;
///
/// let exc = ExceptionValue::new("ValueError", "bad input");
/// assert_eq!(exc.to_string(), "ValueError: bad input");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionValue {
    /// Exception class name.
    pub kind: String,
    /// Exception message.
    pub message: String,
}

impl ExceptionValue {
    /// Creates an exception value.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ExceptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ExceptionValue {}
