//! # graft-storage
//!
//! A layered-filesystem driver built on the kernel's overlay union mount.
//!
//! Layers are immutable directory trees with a parent chain; the driver
//! composes a layer's ancestors into a single merged view, shares active
//! mounts between consumers through reference counting, and exposes each
//! layer's own content as a tar changeset.

pub mod archive;
pub mod chain;
pub mod driver;
pub mod overlay;
pub mod probe;

pub use archive::{Change, ChangeKind, DiffStream};
pub use chain::LayerPaths;
pub use driver::{Driver, DRIVER_NAME};
pub use overlay::OverlayMount;
