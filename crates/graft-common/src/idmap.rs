//! UID/GID remapping tables for user-namespaced storage.
//!
//! A remapped driver stores layer content owned by the host identities a
//! container's root maps to. The tables here translate between container
//! ids and host ids and create directories owned by the remapped root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GraftError, GraftResult};

/// A single contiguous id mapping range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// First id inside the container.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of ids covered by this range.
    pub size: u32,
}

impl IdMap {
    /// Create a new mapping range.
    #[must_use]
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }
}

/// Translate a container id to its host id.
#[must_use]
pub fn to_host(maps: &[IdMap], container_id: u32) -> Option<u32> {
    maps.iter()
        .find(|m| container_id >= m.container_id && container_id - m.container_id < m.size)
        .map(|m| m.host_id + (container_id - m.container_id))
}

/// Translate a host id back to the container id it maps to.
#[must_use]
pub fn to_container(maps: &[IdMap], host_id: u32) -> Option<u32> {
    maps.iter()
        .find(|m| host_id >= m.host_id && host_id - m.host_id < m.size)
        .map(|m| m.container_id + (host_id - m.host_id))
}

/// Host uid/gid that container root maps to.
///
/// With no remapping configured this is the current effective identity, so
/// a root daemon owns layer content as real root and an unprivileged
/// process owns it as itself.
pub fn root_pair(uid_maps: &[IdMap], gid_maps: &[IdMap]) -> GraftResult<(u32, u32)> {
    let uid = if uid_maps.is_empty() {
        rustix::process::geteuid().as_raw()
    } else {
        to_host(uid_maps, 0).ok_or_else(|| GraftError::Config {
            message: "uid map does not cover container root".to_string(),
        })?
    };
    let gid = if gid_maps.is_empty() {
        rustix::process::getegid().as_raw()
    } else {
        to_host(gid_maps, 0).ok_or_else(|| GraftError::Config {
            message: "gid map does not cover container root".to_string(),
        })?
    };
    Ok((uid, gid))
}

/// Create a directory chain owned by the given uid/gid.
///
/// Components that already exist are left alone; only directories this
/// call creates are chowned and chmodded.
pub fn mkdir_all_as(path: &Path, mode: u32, uid: u32, gid: u32) -> GraftResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut accumulated = PathBuf::new();
    for component in path.components() {
        accumulated.push(component);
        match fs::create_dir(&accumulated) {
            Ok(()) => {
                fs::set_permissions(&accumulated, fs::Permissions::from_mode(mode))?;
                std::os::unix::fs::chown(&accumulated, Some(uid), Some(gid))?;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_translation() {
        let maps = [IdMap::new(0, 100_000, 65_536)];
        assert_eq!(to_host(&maps, 0), Some(100_000));
        assert_eq!(to_host(&maps, 1000), Some(101_000));
        assert_eq!(to_host(&maps, 65_536), None);
        assert_eq!(to_container(&maps, 100_000), Some(0));
        assert_eq!(to_container(&maps, 101_000), Some(1000));
        assert_eq!(to_container(&maps, 99_999), None);
    }

    #[test]
    fn root_pair_without_maps_is_effective_identity() {
        let (uid, gid) = root_pair(&[], &[]).unwrap();
        assert_eq!(uid, rustix::process::geteuid().as_raw());
        assert_eq!(gid, rustix::process::getegid().as_raw());
    }

    #[test]
    fn root_pair_with_maps() {
        let uid_maps = [IdMap::new(0, 100_000, 65_536)];
        let gid_maps = [IdMap::new(0, 200_000, 65_536)];
        let (uid, gid) = root_pair(&uid_maps, &gid_maps).unwrap();
        assert_eq!((uid, gid), (100_000, 200_000));
    }

    #[test]
    fn root_pair_rejects_uncovered_root() {
        let uid_maps = [IdMap::new(1000, 100_000, 10)];
        assert!(matches!(
            root_pair(&uid_maps, &[]),
            Err(GraftError::Config { .. })
        ));
    }

    #[test]
    fn mkdir_all_as_creates_nested_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("a/b/c");
        let (uid, gid) = root_pair(&[], &[]).unwrap();

        mkdir_all_as(&target, 0o755, uid, gid).unwrap();
        assert!(target.is_dir());

        // Existing directories are tolerated.
        mkdir_all_as(&target, 0o755, uid, gid).unwrap();
    }
}
