//! runsync Common - Shared types and utilities
//!
//! This crate provides the data model, the open metadata value type, the
//! error taxonomy and the configuration structures used across all runsync
//! components.

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
pub use value::{MetaBag, MetaValue, MetaValueError, Variables, VARIABLES_KEY};

/// Key under which a metadata object stores the parsed metadata file
pub const PARAMS_KEY: &str = "params";
