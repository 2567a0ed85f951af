//! How a task declares the shape of its outputs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared return mode of a generator task.
///
/// | mode | at submission the caller gets | count mismatch |
/// |---|---|---|
/// | `Fixed(n)` | `n` references | tolerated: excess discarded, missing resolve to `UnderProduction` |
/// | `Dynamic` | one wrapper reference | wrapper holds exactly what was produced; a re-execution that disagrees invalidates every output |
/// | `StreamingIterator` | a pull-based stream | tolerated |
///
/// # Examples
///
/// ```
/// use refgen::types::ReturnMode;
///
/// assert_eq!(ReturnMode::Fixed(3).declared_count(), Some(3));
/// assert_eq!(ReturnMode::Dynamic.declared_count(), None);
/// assert!(ReturnMode::Fixed(3).tolerates_count_mismatch());
/// assert!(!ReturnMode::Dynamic.tolerates_count_mismatch());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", content = "count", rename_all = "snake_case")]
pub enum ReturnMode {
    /// Exactly `n` references are handed out at submission.
    Fixed(u32),
    /// One wrapper reference; the count is known only at termination.
    Dynamic,
    /// References are pulled one at a time as they are produced.
    StreamingIterator,
}

impl ReturnMode {
    /// The statically declared count, if any.
    pub fn declared_count(&self) -> Option<u32> {
        match self {
            Self::Fixed(n) => Some(*n),
            Self::Dynamic | Self::StreamingIterator => None,
        }
    }

    /// Whether a re-execution producing a different count than the original
    /// run is accepted.
    ///
    /// Fixed-mode over-production is only diagnosed and streaming consumers
    /// never hold an authoritative sequence, so both are lenient. A dynamic
    /// wrapper is tied to one produced sequence and is not.
    pub fn tolerates_count_mismatch(&self) -> bool {
        !matches!(self, Self::Dynamic)
    }

    /// Whether outputs are handed to a holder (wrapper or stream) as they are
    /// minted, rather than to references allocated at submission.
    pub fn mints_on_yield(&self) -> bool {
        !matches!(self, Self::Fixed(_))
    }
}

impl fmt::Display for ReturnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "fixed({n})"),
            Self::Dynamic => write!(f, "dynamic"),
            Self::StreamingIterator => write!(f, "streaming"),
        }
    }
}
