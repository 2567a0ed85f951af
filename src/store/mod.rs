//! Object store collaborator.
//!
//! The runtime never holds payload bytes itself. Every committed output is
//! written to an [`ObjectStore`] under its [`ObjectRef`], together with the
//! node that hosts the copy. Losing every hosting node makes the payload
//! unreachable, which is what triggers reconstruction.
//!
//! Stores are dumb: they know nothing about reference counts, lineage or
//! task state. Release decisions are made by the runtime's collector and
//! handed down as [`release`](ObjectStore::release) calls, which must be
//! idempotent.
//!
//! # Backends
//!
//! - [`InMemoryObjectStore`](memory::InMemoryObjectStore): `DashMap`-backed,
//!   simulates per-node placement and node loss.

pub mod memory;

use std::fmt;

use async_trait::async_trait;

use crate::types::{NodeId, ObjectRef};

pub use memory::InMemoryObjectStore;

/// Errors raised by an object store.
///
/// # Examples
///
/// ```
/// use refgen::store::StoreError;
///
/// let err = StoreError::CapacityExceeded { message: "full".to_string() };
/// assert_eq!(err.to_string(), "capacity exceeded: full");
/// ```
#[derive(Debug)]
pub enum StoreError {
    /// The store has reached a capacity limit.
    CapacityExceeded {
        /// Human-readable description of the capacity issue.
        message: String,
    },

    /// An I/O or backend-specific error occurred. The in-memory store never
    /// returns it; stores over external systems wrap their failures in it.
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded { message } => {
                write!(f, "capacity exceeded: {message}")
            },
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Storage for serialized output payloads, keyed by reference.
///
/// Implementations must be `Send + Sync`; producers, consumers and the
/// collector call into the store concurrently.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `data` for `id` with a copy on `node`.
    ///
    /// Writing an id that already exists overwrites the bytes and adds
    /// `node` to its locations. Re-executions rely on this.
    async fn put(&self, id: &ObjectRef, node: &NodeId, data: Vec<u8>) -> Result<(), StoreError>;

    /// Returns the payload if at least one hosting node survives.
    async fn get(&self, id: &ObjectRef) -> Result<Option<Vec<u8>>, StoreError>;

    /// Drops the payload and all its copies.
    ///
    /// Returns `true` if something was released and `false` if nothing was
    /// stored for `id` (a repeated release is a no-op).
    async fn release(&self, id: &ObjectRef) -> Result<bool, StoreError>;

    /// Nodes currently hosting a copy of `id`.
    async fn locations(&self, id: &ObjectRef) -> Result<Vec<NodeId>, StoreError>;

    /// Forgets every copy hosted on `node`. Payloads with no remaining copy
    /// become unreachable. Returns the number of payloads that were lost.
    async fn evict_node(&self, node: &NodeId) -> Result<usize, StoreError>;

    /// Adds a copy of an existing payload on `node`.
    ///
    /// Returns `false` if the payload is not (or no longer) stored.
    async fn replicate(&self, id: &ObjectRef, node: &NodeId) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;
    use std::error::Error as _;

    #[test]
    fn backend_error_exposes_its_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer went away");
        let err = StoreError::Backend {
            message: "put failed".to_string(),
            source: Some(Box::new(io)),
        };
        assert_eq!(err.to_string(), "backend error: put failed");
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("peer went away"));

        let runtime_err: Error = err.into();
        assert_eq!(runtime_err.error_code(), 301);
    }

    #[test]
    fn other_store_errors_have_no_source() {
        let err = StoreError::CapacityExceeded {
            message: "full".to_string(),
        };
        assert!(err.source().is_none());
        let bare = StoreError::Backend {
            message: "x".to_string(),
            source: None,
        };
        assert!(bare.source().is_none());
    }
}
