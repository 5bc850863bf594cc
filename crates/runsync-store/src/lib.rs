//! runsync Store - Run store access
//!
//! This crate implements the file-store side of runsync:
//! - Path classification into metadata and data files
//! - Backend-agnostic listing, caching and grouping of files by run
//! - A local filesystem backend with optional scratch-copy materialization

pub mod backend;
pub mod classifier;
pub mod filter;
pub mod local;
pub mod store;

pub use backend::{LocalFile, StoreBackend};
pub use classifier::{RUN_ID_CAPTURE, RunFile, RunFileClassifier};
pub use filter::{ExtensionFilter, ImportFilter};
pub use local::LocalBackend;
pub use store::{RunRecord, RunStore, group_files};
