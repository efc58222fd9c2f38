//! # graft-image
//!
//! Image reference handling and the persistent tag store: a mapping from
//! human-readable references (`name`, `name:tag`, `name@digest`) to
//! content-addressed image ids, backed by canonical JSON on disk.

pub mod reference;
pub mod tags;

pub use reference::Reference;
pub use tags::{Association, TagStore};
