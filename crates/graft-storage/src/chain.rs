//! Path layout and parent-chain metadata for the overlay2 driver.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use graft_common::{GraftError, GraftResult};

/// Per-id chain files live here.
pub(crate) const LAYERS_DIR: &str = "layers";
/// Writable upper directory of each layer.
pub(crate) const DIFF_DIR: &str = "diff";
/// Mount points where merged views appear.
pub(crate) const MNT_DIR: &str = "mnt";
/// Scratch directories required by overlayfs.
pub(crate) const WORK_DIR: &str = "work";

/// Kinds that hold a directory per id (`layers` holds a file).
pub(crate) const DIR_KINDS: [&str; 3] = [MNT_DIR, DIFF_DIR, WORK_DIR];
/// Every kind under the driver root.
pub(crate) const ALL_KINDS: [&str; 4] = [MNT_DIR, DIFF_DIR, LAYERS_DIR, WORK_DIR];

/// Deterministic path layout under a driver root.
#[derive(Debug, Clone)]
pub struct LayerPaths {
    root: PathBuf,
}

impl LayerPaths {
    /// Layout over the given driver root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The driver root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for the given kind and layer id.
    #[must_use]
    pub fn dir(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(id)
    }

    /// The chain file for a layer.
    #[must_use]
    pub fn layers_file(&self, id: &str) -> PathBuf {
        self.dir(LAYERS_DIR, id)
    }

    /// The writable upper directory of a layer.
    #[must_use]
    pub fn diff(&self, id: &str) -> PathBuf {
        self.dir(DIFF_DIR, id)
    }

    /// The mount point of a layer's merged view.
    #[must_use]
    pub fn mnt(&self, id: &str) -> PathBuf {
        self.dir(MNT_DIR, id)
    }

    /// The overlayfs scratch directory of a layer.
    #[must_use]
    pub fn work(&self, id: &str) -> PathBuf {
        self.dir(WORK_DIR, id)
    }

    /// Rename target used while a layer is being deleted.
    #[must_use]
    pub(crate) fn removing(&self, kind: &str, id: &str) -> PathBuf {
        self.dir(kind, &format!("{id}-removing"))
    }

    /// Read the ancestor ids for `id`, nearest parent first.
    ///
    /// A missing chain file means the layer is absent; an existing empty
    /// file means the layer has no parent.
    pub fn read_chain(&self, id: &str) -> GraftResult<Vec<String>> {
        let file = match fs::File::open(self.layers_file(id)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(GraftError::LayerNotFound { id: id.to_string() })
            }
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.is_empty() {
                out.push(line);
            }
        }
        Ok(out)
    }

    /// Create `layers/<id>` holding `parent` followed by the parent's own
    /// chain, one id per line.
    pub fn write_chain(&self, id: &str, parent: &str) -> GraftResult<()> {
        let mut file = fs::File::create(self.layers_file(id))?;
        if !parent.is_empty() {
            let ancestors = self.read_chain(parent)?;
            writeln!(file, "{parent}")?;
            for ancestor in &ancestors {
                writeln!(file, "{ancestor}")?;
            }
        }
        Ok(())
    }
}
