//! runsync Index - Metadata index
//!
//! The pipeline only depends on the [`MetadataIndex`] contract. [`RedbIndex`]
//! is an embedded, file-backed implementation of it.

pub mod index;
pub mod store;
pub mod tables;

pub use index::{DataQuery, MetadataIndex};
pub use store::{IndexError, RedbIndex};
