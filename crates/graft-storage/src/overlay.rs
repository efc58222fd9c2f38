//! Overlay mount construction for layer stacks.

use std::path::{Path, PathBuf};

use graft_common::{GraftError, GraftResult};

/// An overlay mount composed from a stack of layer directories.
#[derive(Debug, Clone)]
pub struct OverlayMount {
    /// Lower directories (read-only layers), highest priority first.
    pub lower_dirs: Vec<PathBuf>,
    /// Upper directory (writable layer).
    pub upper_dir: PathBuf,
    /// Work directory (required by overlayfs).
    pub work_dir: PathBuf,
    /// Merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayMount {
    /// Create a new overlay mount configuration.
    pub fn new(
        lower_dirs: Vec<PathBuf>,
        upper_dir: PathBuf,
        work_dir: PathBuf,
        merged_dir: PathBuf,
    ) -> Self {
        Self {
            lower_dirs,
            upper_dir,
            work_dir,
            merged_dir,
        }
    }

    /// Kernel mount options for this stack.
    ///
    /// The options buffer is passed to the kernel whole; a stack long
    /// enough to exceed the kernel's page-sized argument limit fails at
    /// mount time rather than being split.
    #[must_use]
    pub fn options(&self) -> String {
        let lower = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        format!(
            "lowerdir={},upperdir={},workdir={}",
            lower,
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }

    /// Mount the overlay filesystem.
    #[cfg(target_os = "linux")]
    pub fn mount(&self, mount_label: &str) -> GraftResult<()> {
        use rustix::mount::{mount, MountFlags};
        use std::ffi::CString;

        let options = format_mount_label(&self.options(), mount_label);

        tracing::debug!(
            merged = %self.merged_dir.display(),
            options = %options,
            "Mounting overlay"
        );

        let fstype = CString::new("overlay").unwrap();
        let options_c = CString::new(options.as_str()).map_err(|_| GraftError::Config {
            message: "overlay options contain a null byte".to_string(),
        })?;

        mount(
            "overlay",
            &self.merged_dir,
            fstype.as_c_str(),
            MountFlags::empty(),
            options_c.as_c_str(),
        )
        .map_err(|e| GraftError::MountFailed {
            target: self.merged_dir.clone(),
            source: e.into(),
        })?;

        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn mount(&self, _mount_label: &str) -> GraftResult<()> {
        Err(GraftError::Unsupported {
            reason: "overlay mounts require Linux".to_string(),
        })
    }
}

/// Splice a MAC policy label into a mount options string.
#[must_use]
pub fn format_mount_label(options: &str, mount_label: &str) -> String {
    if mount_label.is_empty() {
        options.to_string()
    } else if options.is_empty() {
        format!("context=\"{mount_label}\"")
    } else {
        format!("{options},context=\"{mount_label}\"")
    }
}

/// Unmount the overlay at `path`.
#[cfg(target_os = "linux")]
pub fn unmount(path: &Path) -> GraftResult<()> {
    use rustix::mount::{unmount, UnmountFlags};

    tracing::debug!(target = %path.display(), "Unmounting overlay");

    unmount(path, UnmountFlags::empty()).map_err(|e| GraftError::Io(e.into()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn unmount(_path: &Path) -> GraftResult<()> {
    Err(GraftError::Unsupported {
        reason: "overlay mounts require Linux".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_mount_options() {
        let overlay = OverlayMount::new(
            vec![PathBuf::from("/layer1"), PathBuf::from("/layer2")],
            PathBuf::from("/upper"),
            PathBuf::from("/work"),
            PathBuf::from("/merged"),
        );

        assert_eq!(
            overlay.options(),
            "lowerdir=/layer1:/layer2,upperdir=/upper,workdir=/work"
        );
    }

    #[test]
    fn mount_label_splicing() {
        assert_eq!(format_mount_label("lowerdir=/a", ""), "lowerdir=/a");
        assert_eq!(
            format_mount_label("lowerdir=/a", "system_u:object_r:svirt_sandbox_file_t:s0"),
            "lowerdir=/a,context=\"system_u:object_r:svirt_sandbox_file_t:s0\""
        );
        assert_eq!(format_mount_label("", "label"), "context=\"label\"");
    }
}
