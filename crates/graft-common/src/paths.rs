//! Standard filesystem paths for graft.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for graft data.
pub static GRAFT_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("GRAFT_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/graft"))
});

/// Standard paths used by the graft storage stack.
#[derive(Debug, Clone)]
pub struct GraftPaths {
    /// Root data directory (default: /var/lib/graft).
    pub root: PathBuf,
}

impl GraftPaths {
    /// Create paths with the default root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the layer driver.
    #[must_use]
    pub fn storage(&self) -> PathBuf {
        self.root.join("overlay2")
    }

    /// Backing file of the tag store.
    #[must_use]
    pub fn repositories_file(&self) -> PathBuf {
        self.root.join("repositories.json")
    }

    /// Create the root directory.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

impl Default for GraftPaths {
    fn default() -> Self {
        Self {
            root: GRAFT_ROOT.clone(),
        }
    }
}
