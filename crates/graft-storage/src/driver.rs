//! The overlay2 layer driver.
//!
//! Directory structure under the driver root:
//!
//! ```text
//!   .
//!   ├── layers   // chain files: the stack of ancestor ids per layer
//!   │   ├── 1
//!   │   └── 2
//!   ├── diff     // writable upper directory per layer
//!   │   ├── 1
//!   │   └── 2
//!   ├── mnt      // mount points where merged views appear
//!   │   ├── 1
//!   │   └── 2
//!   └── work     // overlayfs scratch directories
//!       ├── 1
//!       └── 2
//! ```
//!
//! Layers with ancestors are composed into a single merged view by an
//! overlay mount; a mounted layer is shared between consumers through a
//! reference-counted table so the kernel sees one mount per id.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use graft_common::{idmap, GraftError, GraftResult, IdMap};

use crate::archive::{self, Change, DiffStream};
use crate::chain::{LayerPaths, ALL_KINDS, DIR_KINDS, LAYERS_DIR};
use crate::overlay::OverlayMount;
use crate::probe;

/// Name this driver registers under.
pub const DRIVER_NAME: &str = "overlay2";

/// Reference-counted record of an acquired layer.
#[derive(Debug, Default)]
struct ActiveMount {
    reference_count: usize,
    path: PathBuf,
}

/// The overlay2 layered-filesystem driver.
pub struct Driver {
    paths: LayerPaths,
    /// Protects `active`; also held across the mount syscall so refcount
    /// transitions and kernel state agree.
    active: Mutex<HashMap<String, ActiveMount>>,
    uid_maps: Vec<IdMap>,
    gid_maps: Vec<IdMap>,
    backing_fs: &'static str,
}

impl Driver {
    /// Probe the host and initialise a driver over `root`.
    ///
    /// Fails with [`GraftError::Unsupported`] when the kernel does not
    /// list overlay in `/proc/filesystems` or is older than 3.19.
    pub fn open(
        root: impl Into<PathBuf>,
        options: &[String],
        uid_maps: Vec<IdMap>,
        gid_maps: Vec<IdMap>,
    ) -> GraftResult<Self> {
        probe::overlay_supported().map_err(|e| match e {
            GraftError::Unsupported { .. } => e,
            other => GraftError::Unsupported {
                reason: other.to_string(),
            },
        })?;

        // Multiple read-only lower layers need 3.19 or later.
        let version = probe::KernelVersion::current()?;
        if version < probe::MIN_KERNEL {
            return Err(GraftError::Unsupported {
                reason: format!("kernel {version} is older than {}", probe::MIN_KERNEL),
            });
        }

        for option in options {
            tracing::debug!(option = %option, "Ignoring unknown storage option");
        }

        Self::with_root(root, uid_maps, gid_maps)
    }

    /// Build a driver over `root` without probing the host.
    ///
    /// Creates the root and the four per-kind directories, owned by the
    /// remapped root uid/gid.
    pub fn with_root(
        root: impl Into<PathBuf>,
        uid_maps: Vec<IdMap>,
        gid_maps: Vec<IdMap>,
    ) -> GraftResult<Self> {
        let root = root.into();
        let (uid, gid) = idmap::root_pair(&uid_maps, &gid_maps)?;
        idmap::mkdir_all_as(&root, 0o755, uid, gid)?;
        for kind in ALL_KINDS {
            idmap::mkdir_all_as(&root.join(kind), 0o755, uid, gid)?;
        }

        let backing_fs = probe::backing_fs_name(&root)?;
        tracing::debug!(root = %root.display(), backing_fs, "Opened overlay2 driver");

        Ok(Self {
            paths: LayerPaths::new(root),
            active: Mutex::new(HashMap::new()),
            uid_maps,
            gid_maps,
            backing_fs,
        })
    }

    /// Name this driver reports to the storage registry.
    #[must_use]
    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    /// The path layout of this driver.
    #[must_use]
    pub fn layer_paths(&self) -> &LayerPaths {
        &self.paths
    }

    fn active_table(&self) -> MutexGuard<'_, HashMap<String, ActiveMount>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a new layer with the given parent (`""` for a root layer).
    ///
    /// All four per-id paths are created up front; `mnt` and `work` stay
    /// unused until the first [`Driver::get`].
    pub fn create(&self, id: &str, parent: &str) -> GraftResult<()> {
        if ALL_KINDS
            .iter()
            .any(|kind| self.paths.dir(kind, id).symlink_metadata().is_ok())
        {
            return Err(GraftError::LayerExists { id: id.to_string() });
        }
        if !parent.is_empty() && !self.exists(parent) {
            return Err(GraftError::LayerNotFound {
                id: parent.to_string(),
            });
        }

        let (uid, gid) = idmap::root_pair(&self.uid_maps, &self.gid_maps)?;
        for kind in DIR_KINDS {
            idmap::mkdir_all_as(&self.paths.dir(kind, id), 0o755, uid, gid)?;
        }
        self.paths.write_chain(id, parent)?;

        self.active_table()
            .insert(id.to_string(), ActiveMount::default());
        tracing::debug!(id, parent, "Layer created");
        Ok(())
    }

    /// Unmount and delete a layer.
    ///
    /// A layer that is still referenced is left untouched and the call
    /// returns success; the skip is visible at debug level.
    pub fn remove(&self, id: &str) -> GraftResult<()> {
        let mut active = self.active_table();
        if let Some(mount) = active.get(id) {
            if mount.reference_count > 0 {
                tracing::debug!(
                    id,
                    references = mount.reference_count,
                    "Skipping removal of layer still in use"
                );
                return Ok(());
            }
            #[cfg(target_os = "linux")]
            if probe::mounted(&mount.path)? {
                crate::overlay::unmount(&mount.path)?;
            }
            active.remove(id);
        }

        // Rename every directory aside first: the rename is the atomicity
        // boundary, after which a concurrent get observes the layer gone.
        let mut doomed = Vec::new();
        for kind in DIR_KINDS {
            let real = self.paths.dir(kind, id);
            let aside = self.paths.removing(kind, id);
            match fs::rename(&real, &aside) {
                Ok(()) => doomed.push(aside),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        match fs::remove_file(self.paths.layers_file(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        for aside in doomed {
            if let Err(e) = fs::remove_dir_all(&aside) {
                tracing::debug!(path = %aside.display(), error = %e, "Failed to delete renamed layer tree");
            }
        }
        tracing::debug!(id, "Layer removed");
        Ok(())
    }

    /// Mount (if needed) and return the merged view of a layer.
    ///
    /// Concurrent acquirers of the same id share one kernel mount and
    /// each hold one reference until they [`Driver::put`].
    pub fn get(&self, id: &str, mount_label: &str) -> GraftResult<PathBuf> {
        let ancestors = match self.paths.read_chain(id) {
            Ok(chain) => chain,
            // No chain file: treat as a root layer but do not create one.
            Err(GraftError::LayerNotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut active = self.active_table();
        let mount = active.entry(id.to_string()).or_default();

        if ancestors.is_empty() {
            // A root layer's writable directory is its own merged view.
            mount.path = self.paths.diff(id);
        } else {
            mount.path = self.paths.mnt(id);
            if mount.reference_count == 0 {
                self.mount_layer(id, &ancestors, mount_label)?;
            }
        }
        mount.reference_count += 1;
        Ok(mount.path.clone())
    }

    #[cfg(target_os = "linux")]
    fn mount_layer(&self, id: &str, ancestors: &[String], mount_label: &str) -> GraftResult<()> {
        let merged = self.paths.mnt(id);

        // A previous process may have left the overlay in place; treat an
        // existing mount as success.
        if probe::mounted(&merged)? {
            return Ok(());
        }

        let lowers = ancestors.iter().map(|p| self.paths.diff(p)).collect();
        let overlay = OverlayMount::new(lowers, self.paths.diff(id), self.paths.work(id), merged);
        overlay.mount(mount_label)?;

        // The kernel populates the work directory owned by real root; the
        // remapped root must own it for copy-up inside a user namespace.
        let (uid, gid) = idmap::root_pair(&self.uid_maps, &self.gid_maps)?;
        std::os::unix::fs::chown(self.paths.work(id), Some(uid), Some(gid))?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn mount_layer(&self, _id: &str, _ancestors: &[String], _mount_label: &str) -> GraftResult<()> {
        Err(GraftError::Unsupported {
            reason: "overlay mounts require Linux".to_string(),
        })
    }

    /// Release one reference to a layer, unmounting on the last one.
    pub fn put(&self, id: &str) -> GraftResult<()> {
        let mut active = self.active_table();
        let Some(mount) = active.get_mut(id) else {
            // No record, but the mount may survive from a previous
            // process; tear it down best-effort.
            if self.exists(id) {
                #[cfg(target_os = "linux")]
                if let Err(e) = crate::overlay::unmount(&self.paths.mnt(id)) {
                    tracing::debug!(id, error = %e, "Failed to unmount stale overlay");
                }
            }
            return Ok(());
        };

        if mount.reference_count > 1 {
            mount.reference_count -= 1;
            return Ok(());
        }

        // Root layers were never mounted.
        let ancestors = self.paths.read_chain(id).unwrap_or_default();
        if !ancestors.is_empty() {
            #[cfg(target_os = "linux")]
            if probe::mounted(&mount.path)? {
                crate::overlay::unmount(&mount.path)?;
            }
        }
        active.remove(id);
        Ok(())
    }

    /// Whether a layer id is registered with this driver.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.paths.layers_file(id).symlink_metadata().is_ok()
    }

    /// Low-level information about the driver as key/value pairs.
    #[must_use]
    pub fn status(&self) -> Vec<(String, String)> {
        let layers = self.layer_ids().unwrap_or_default();
        vec![
            ("Root Dir".to_string(), self.paths.root().display().to_string()),
            ("Backing Filesystem".to_string(), self.backing_fs.to_string()),
            ("Layers".to_string(), layers.len().to_string()),
        ]
    }

    /// Ids of every layer known to this driver.
    fn layer_ids(&self) -> GraftResult<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.paths.root().join(LAYERS_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    /// Stream the layer's own content as an uncompressed changeset.
    pub fn diff(&self, id: &str, _parent: &str) -> GraftResult<DiffStream> {
        // The upper directory alone is the changeset; the parent is not
        // needed to produce it.
        archive::tar_layer(&self.paths.diff(id), &self.uid_maps, &self.gid_maps)
    }

    /// Materialise a changeset into the layer's writable directory and
    /// return the layer's size in bytes.
    pub fn apply_diff(&self, id: &str, parent: &str, diff: impl Read) -> GraftResult<u64> {
        archive::untar_layer(diff, &self.paths.diff(id), &self.uid_maps, &self.gid_maps)?;
        self.diff_size(id, parent)
    }

    /// Size in bytes of the layer's own content.
    pub fn diff_size(&self, id: &str, _parent: &str) -> GraftResult<u64> {
        archive::tree_size(&self.paths.diff(id))
    }

    /// Changes between the layer and its ancestor stack.
    pub fn changes(&self, id: &str, _parent: &str) -> GraftResult<Vec<Change>> {
        let lowers = self
            .paths
            .read_chain(id)?
            .iter()
            .map(|p| self.paths.diff(p))
            .collect::<Vec<_>>();
        archive::changes(&self.paths.diff(id), &lowers)
    }

    /// Release resources held by the driver.
    pub fn cleanup(&self) -> GraftResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(root: &std::path::Path) -> Driver {
        Driver::with_root(root, Vec::new(), Vec::new()).unwrap()
    }

    #[test]
    fn create_builds_all_four_paths() {
        let temp = tempfile::tempdir().unwrap();
        let d = driver(temp.path());

        d.create("a", "").unwrap();
        assert!(d.layer_paths().layers_file("a").is_file());
        assert!(d.layer_paths().diff("a").is_dir());
        assert!(d.layer_paths().mnt("a").is_dir());
        assert!(d.layer_paths().work("a").is_dir());
    }

    #[test]
    fn create_rejects_existing_id() {
        let temp = tempfile::tempdir().unwrap();
        let d = driver(temp.path());

        d.create("a", "").unwrap();
        assert!(matches!(
            d.create("a", ""),
            Err(GraftError::LayerExists { .. })
        ));
    }

    #[test]
    fn create_requires_existing_parent() {
        let temp = tempfile::tempdir().unwrap();
        let d = driver(temp.path());

        assert!(matches!(
            d.create("child", "ghost"),
            Err(GraftError::LayerNotFound { .. })
        ));
    }

    #[test]
    fn root_layer_get_skips_the_mount() {
        let temp = tempfile::tempdir().unwrap();
        let d = driver(temp.path());

        d.create("a", "").unwrap();
        let path = d.get("a", "").unwrap();
        assert_eq!(path, d.layer_paths().diff("a"));

        // Balanced puts drop the record; further puts stay successful.
        d.put("a").unwrap();
        d.put("a").unwrap();
    }

    #[test]
    fn remove_is_a_noop_while_referenced() {
        let temp = tempfile::tempdir().unwrap();
        let d = driver(temp.path());

        d.create("a", "").unwrap();
        d.get("a", "").unwrap();

        d.remove("a").unwrap();
        assert!(d.exists("a"));

        d.put("a").unwrap();
        d.remove("a").unwrap();
        assert!(!d.exists("a"));
    }

    #[test]
    fn remove_deletes_everything() {
        let temp = tempfile::tempdir().unwrap();
        let d = driver(temp.path());

        d.create("a", "").unwrap();
        fs::write(d.layer_paths().diff("a").join("f"), b"data").unwrap();

        d.remove("a").unwrap();
        assert!(!d.exists("a"));
        assert!(!d.layer_paths().diff("a").exists());
        assert!(!d.layer_paths().mnt("a").exists());
        assert!(!d.layer_paths().work("a").exists());

        // Removing an absent layer is tolerated.
        d.remove("a").unwrap();
    }

    #[test]
    fn status_reports_layer_count() {
        let temp = tempfile::tempdir().unwrap();
        let d = driver(temp.path());

        d.create("a", "").unwrap();
        d.create("b", "a").unwrap();

        let status = d.status();
        assert_eq!(status[0].0, "Root Dir");
        assert_eq!(status[2], ("Layers".to_string(), "2".to_string()));
    }
}
