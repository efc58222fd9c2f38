//! Host capability probing for the overlay driver.

use std::fmt;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;

use graft_common::{GraftError, GraftResult};

/// Oldest kernel that supports multiple read-only lower layers.
pub const MIN_KERNEL: KernelVersion = KernelVersion {
    major: 3,
    minor: 19,
    patch: 0,
};

/// A kernel version in major.minor.patch form.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct KernelVersion {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
    /// Patch level.
    pub patch: u16,
}

impl KernelVersion {
    /// The version of the currently running kernel.
    pub fn current() -> GraftResult<Self> {
        let release = fs::read_to_string("/proc/sys/kernel/osrelease")?;
        release.trim().parse()
    }
}

impl FromStr for KernelVersion {
    type Err = GraftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "6.8.0-41-generic" carries distro suffixes after the patch level.
        let base = s
            .split(|c: char| c == '-' || c == '+' || c == ' ')
            .next()
            .unwrap_or(s);
        let mut parts = base.splitn(3, '.');

        let invalid = || GraftError::Config {
            message: format!("cannot parse kernel version from {s:?}"),
        };
        let major = parse_component(parts.next().ok_or_else(invalid)?).ok_or_else(invalid)?;
        let minor = parse_component(parts.next().ok_or_else(invalid)?).ok_or_else(invalid)?;
        let patch = parts.next().and_then(parse_component).unwrap_or(0);

        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn parse_component(s: &str) -> Option<u16> {
    let digits: &str = s
        .find(|c: char| !c.is_ascii_digit())
        .map_or(s, |end| &s[..end]);
    digits.parse().ok()
}

/// Check that the running kernel knows the overlay filesystem.
///
/// Tries `modprobe overlay` first so a module-built overlay shows up in
/// `/proc/filesystems`; the modprobe outcome itself is ignored.
pub fn overlay_supported() -> GraftResult<()> {
    let _ = Command::new("modprobe").arg("overlay").status();

    let filesystems = fs::read_to_string("/proc/filesystems")?;
    if filesystems.lines().any(|line| line == "nodev\toverlay") {
        return Ok(());
    }
    tracing::error!("'overlay' is not a supported filesystem on this host");
    Err(GraftError::Unsupported {
        reason: "overlay is missing from /proc/filesystems".to_string(),
    })
}

const FS_NAMES: &[(u64, &str)] = &[
    (0x61756673, "aufs"),
    (0x9123683e, "btrfs"),
    (0x28cd3d45, "cramfs"),
    (0xf15f, "ecryptfs"),
    (0xef53, "extfs"),
    (0xf2f52010, "f2fs"),
    (0x72b6, "jffs2"),
    (0x6969, "nfs"),
    (0x794c7630, "overlayfs"),
    (0x858458f6, "ramfs"),
    (0x52654973, "reiserfs"),
    (0x517b, "smb"),
    (0x73717368, "squashfs"),
    (0x01021994, "tmpfs"),
    (0x58465342, "xfs"),
    (0x2fc12fc1, "zfs"),
];

/// Well-known name for a filesystem magic number.
#[must_use]
pub fn fs_name(magic: u64) -> &'static str {
    FS_NAMES
        .iter()
        .find(|(m, _)| *m == magic)
        .map_or("<unknown>", |(_, name)| name)
}

/// Well-known name of the filesystem backing `path`.
#[cfg(target_os = "linux")]
pub fn backing_fs_name(path: &Path) -> GraftResult<&'static str> {
    let stat = rustix::fs::statfs(path).map_err(std::io::Error::from)?;
    Ok(fs_name(stat.f_type as u64))
}

#[cfg(not(target_os = "linux"))]
pub fn backing_fs_name(_path: &Path) -> GraftResult<&'static str> {
    Ok("<unknown>")
}

/// Whether `path` appears as a mount point in the kernel mount table.
#[cfg(target_os = "linux")]
pub fn mounted(path: &Path) -> GraftResult<bool> {
    let table = fs::read_to_string("/proc/self/mountinfo")?;
    Ok(is_mount_point(&table, path))
}

#[cfg(not(target_os = "linux"))]
pub fn mounted(_path: &Path) -> GraftResult<bool> {
    Ok(false)
}

/// Scan mountinfo text for a mount point equal to `path`.
///
/// The mount point is the fifth whitespace-separated field, with spaces
/// and other specials octal-escaped by the kernel.
fn is_mount_point(mountinfo: &str, path: &Path) -> bool {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .any(|mount_point| Path::new(&unescape_octal(mount_point)) == path)
}

fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let code = u32::from(bytes[i + 1] - b'0') * 64
                + u32::from(bytes[i + 2] - b'0') * 8
                + u32::from(bytes[i + 3] - b'0');
            out.push(code as u8 as char);
            i += 4;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing() {
        let v: KernelVersion = "5.15.0-91-generic".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (5, 15, 0));

        let v: KernelVersion = "6.8".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (6, 8, 0));

        let v: KernelVersion = "4.4.302+".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (4, 4, 302));

        assert!("linux".parse::<KernelVersion>().is_err());
    }

    #[test]
    fn version_ordering() {
        let old = KernelVersion {
            major: 3,
            minor: 18,
            patch: 140,
        };
        let new = KernelVersion {
            major: 4,
            minor: 0,
            patch: 0,
        };
        assert!(old < MIN_KERNEL);
        assert!(new > MIN_KERNEL);
        assert!(MIN_KERNEL >= MIN_KERNEL);
    }

    #[test]
    fn fs_names() {
        assert_eq!(fs_name(0xef53), "extfs");
        assert_eq!(fs_name(0x01021994), "tmpfs");
        assert_eq!(fs_name(0xdeadbeef), "<unknown>");
    }

    #[test]
    fn mount_point_scan() {
        let table = "22 27 0:21 / /proc rw,nosuid - proc proc rw\n\
                     36 35 98:0 / /mnt/my\\040dir rw,noatime - ext3 /dev/root rw\n";
        assert!(is_mount_point(table, Path::new("/proc")));
        assert!(is_mount_point(table, Path::new("/mnt/my dir")));
        assert!(!is_mount_point(table, Path::new("/mnt")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn root_is_mounted() {
        assert!(mounted(Path::new("/")).unwrap());
    }
}
