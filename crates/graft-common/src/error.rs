//! Common error types for the graft ecosystem.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`GraftError`].
pub type GraftResult<T> = Result<T, GraftError>;

/// Common errors across the graft ecosystem.
#[derive(Error, Diagnostic, Debug)]
pub enum GraftError {
    /// Layer not found.
    #[error("Layer not found: {id}")]
    #[diagnostic(code(graft::layer::not_found))]
    LayerNotFound {
        /// The layer id that was not found.
        id: String,
    },

    /// Layer already exists.
    #[error("Layer already exists: {id}")]
    #[diagnostic(code(graft::layer::exists))]
    LayerExists {
        /// The layer id that already exists.
        id: String,
    },

    /// Image reference not found.
    #[error("No such reference: {reference}")]
    #[diagnostic(code(graft::reference::not_found))]
    ReferenceNotFound {
        /// The reference that was not found.
        reference: String,
    },

    /// Invalid image reference format.
    #[error("Invalid reference: {reference}")]
    #[diagnostic(
        code(graft::reference::invalid),
        help("References take the form name, name:tag or name@digest")
    )]
    InvalidReference {
        /// The reference that failed to parse.
        reference: String,
    },

    /// A tag is already bound to a different image id.
    #[error("Conflict: reference {reference} is already set to {current}")]
    #[diagnostic(
        code(graft::reference::conflict),
        help("Pass force = true to move the reference")
    )]
    Conflict {
        /// The reference being rebound.
        reference: String,
        /// The image id the reference currently points at.
        current: String,
    },

    /// The kernel mount syscall failed.
    #[error("failed to mount overlay at {}: {source}", target.display())]
    #[diagnostic(code(graft::mount::failed))]
    MountFailed {
        /// The merged directory the mount targeted.
        target: PathBuf,
        /// The underlying syscall error.
        #[source]
        source: std::io::Error,
    },

    /// The driver cannot run on this host.
    #[error("Driver not supported: {reason}")]
    #[diagnostic(
        code(graft::unsupported),
        help("The overlay driver requires Linux 3.19 or later with overlayfs support loaded")
    )]
    Unsupported {
        /// Why the host was rejected.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(graft::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(graft::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(graft::serialization))]
    Serialization(String),
}

impl From<serde_json::Error> for GraftError {
    fn from(err: serde_json::Error) -> Self {
        GraftError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = GraftError::LayerNotFound {
            id: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "Layer not found: abc123");
    }

    #[test]
    fn conflict_message_prefix() {
        let err = GraftError::Conflict {
            reference: "busybox:latest".to_string(),
            current: "sha256:91e5".to_string(),
        };
        assert!(err.to_string().starts_with("Conflict:"));
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GraftError = io_err.into();
        assert!(matches!(err, GraftError::Io(_)));
    }
}
