//! # graft-common
//!
//! Shared utilities and types for the graft storage ecosystem.
//!
//! This crate provides common functionality used across all graft crates:
//! - Common error types
//! - UID/GID remapping tables
//! - Standard filesystem paths

#![warn(missing_docs)]

pub mod error;
pub mod idmap;
pub mod paths;

pub use error::{GraftError, GraftResult};
pub use idmap::IdMap;
pub use paths::GraftPaths;
