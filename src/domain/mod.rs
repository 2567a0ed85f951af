//! Domain types for task submission and lineage.
//!
//! [`TaskSpec`] is what a caller submits; [`LineageRecord`] is what the owner
//! retains about it so the task can be re-executed after an output is lost.

pub mod lineage;

pub use lineage::*;
