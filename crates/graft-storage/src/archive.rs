//! Layer changeset streams.
//!
//! A layer's own content is its upper directory; streaming it out and
//! materialising a received stream back into an upper are both plain tar
//! with one twist: overlay marks deletions as character devices with
//! device number 0, while the archive format marks them as empty `.wh.`
//! prefixed entries. Both directions translate between the two.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use graft_common::{idmap, GraftResult, IdMap};
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

/// Prefix marking a deleted entry in a changeset stream.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker entry that hides everything below its directory.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Archive name for a whiteout of `name`.
#[must_use]
pub fn whiteout_name(name: &str) -> String {
    format!("{WHITEOUT_PREFIX}{name}")
}

/// The original name hidden by a whiteout entry, if this is one.
#[must_use]
pub fn whiteout_target(name: &str) -> Option<&str> {
    name.strip_prefix(WHITEOUT_PREFIX)
}

#[cfg(target_os = "linux")]
fn is_overlay_whiteout(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_char_device() && meta.rdev() == 0
}

/// An uncompressed tar stream of a layer's own content.
pub struct DiffStream {
    spool: File,
}

impl Read for DiffStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.spool.read(buf)
    }
}

/// Stream a layer directory as an uncompressed tar archive.
///
/// Overlay whiteout devices become `.wh.` entries, symlinks are not
/// followed, and entry ownership is translated from host ids to the
/// container ids they map to.
pub fn tar_layer(dir: &Path, uid_maps: &[IdMap], gid_maps: &[IdMap]) -> GraftResult<DiffStream> {
    let mut spool = tempfile::tempfile()?;
    {
        let mut builder = Builder::new(&mut spool);
        builder.follow_symlinks(false);
        append_tree(&mut builder, dir, uid_maps, gid_maps)?;
        builder.finish()?;
    }
    spool.seek(SeekFrom::Start(0))?;
    Ok(DiffStream { spool })
}

fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    uid_maps: &[IdMap],
    gid_maps: &[IdMap],
) -> GraftResult<()> {
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();

        #[cfg(target_os = "linux")]
        if is_overlay_whiteout(&meta) {
            if let Some(name) = rel.file_name().and_then(|n| n.to_str()) {
                let mut header = entry_header(&meta, uid_maps, gid_maps);
                header.set_entry_type(EntryType::Regular);
                header.set_mode(0o600);
                header.set_size(0);
                builder.append_data(
                    &mut header,
                    rel.with_file_name(whiteout_name(name)),
                    io::empty(),
                )?;
            }
            continue;
        }

        if file_type.is_dir() {
            let mut header = entry_header(&meta, uid_maps, gid_maps);
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, rel, io::empty())?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let mut header = entry_header(&meta, uid_maps, gid_maps);
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, rel, &target)?;
        } else if file_type.is_file() {
            let mut header = entry_header(&meta, uid_maps, gid_maps);
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            builder.append_data(&mut header, rel, File::open(entry.path())?)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file in layer stream");
        }
    }
    Ok(())
}

fn entry_header(meta: &fs::Metadata, uid_maps: &[IdMap], gid_maps: &[IdMap]) -> Header {
    let mut header = Header::new_gnu();
    header.set_mode(meta.mode() & 0o7777);
    header.set_mtime(meta.mtime().max(0) as u64);
    let uid = idmap::to_container(uid_maps, meta.uid()).unwrap_or(meta.uid());
    let gid = idmap::to_container(gid_maps, meta.gid()).unwrap_or(meta.gid());
    header.set_uid(u64::from(uid));
    header.set_gid(u64::from(gid));
    header
}

/// Materialise an uncompressed tar changeset into a layer directory.
///
/// `.wh.` entries become overlay whiteout device nodes so the result can
/// serve as a lower directory; ownership is translated back from container
/// ids to host ids when remapping is configured.
pub fn untar_layer(
    reader: impl Read,
    dir: &Path,
    uid_maps: &[IdMap],
    gid_maps: &[IdMap],
) -> GraftResult<()> {
    fs::create_dir_all(dir)?;

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            tracing::debug!(path = %path.display(), "Skipping entry escaping the layer root");
            continue;
        }

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name == OPAQUE_WHITEOUT {
                let shadowed = dir.join(path.parent().unwrap_or(Path::new("")));
                if shadowed != dir && shadowed.is_dir() {
                    fs::remove_dir_all(&shadowed)?;
                    fs::create_dir(&shadowed)?;
                }
                continue;
            }
            if let Some(hidden) = whiteout_target(name) {
                let node = dir.join(path.with_file_name(hidden));
                if let Some(parent) = node.parent() {
                    fs::create_dir_all(parent)?;
                }
                make_whiteout(&node)?;
                continue;
            }
        }

        let target = dir.join(&path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        chown_entry(&target, entry.header(), uid_maps, gid_maps)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn make_whiteout(path: &Path) -> GraftResult<()> {
    use rustix::fs::{mknodat, FileType, Mode, CWD};

    mknodat(
        CWD,
        path,
        FileType::CharacterDevice,
        Mode::from_bits_truncate(0o600),
        0,
    )
    .map_err(|e| graft_common::GraftError::Io(e.into()))
}

#[cfg(not(target_os = "linux"))]
fn make_whiteout(_path: &Path) -> GraftResult<()> {
    Err(graft_common::GraftError::Unsupported {
        reason: "overlay whiteouts require Linux".to_string(),
    })
}

fn chown_entry(
    path: &Path,
    header: &Header,
    uid_maps: &[IdMap],
    gid_maps: &[IdMap],
) -> GraftResult<()> {
    if uid_maps.is_empty() && gid_maps.is_empty() {
        return Ok(());
    }
    let uid = header.uid()? as u32;
    let gid = header.gid()? as u32;
    let uid = idmap::to_host(uid_maps, uid).unwrap_or(uid);
    let gid = idmap::to_host(gid_maps, gid).unwrap_or(gid);
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    Ok(())
}

/// Total size in bytes of the regular files under a directory tree.
pub fn tree_size(path: &Path) -> GraftResult<u64> {
    let mut total = 0;

    if !path.exists() {
        return Ok(0);
    }

    for entry in WalkDir::new(path) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }

    Ok(total)
}

/// How a path in a layer differs from its ancestor stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The path does not appear in any ancestor.
    Added,
    /// The path shadows an ancestor entry.
    Modified,
    /// A whiteout hides the ancestor entry.
    Deleted,
}

/// A single difference between a layer and its ancestor stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Path relative to the layer root.
    pub path: PathBuf,
    /// The kind of difference.
    pub kind: ChangeKind,
}

/// Compare a layer's upper directory against its ancestor diff directories.
pub fn changes(upper: &Path, lowers: &[PathBuf]) -> GraftResult<Vec<Change>> {
    let mut out = Vec::new();

    for entry in WalkDir::new(upper).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(rel) = entry.path().strip_prefix(upper) else {
            continue;
        };

        #[cfg(target_os = "linux")]
        {
            let meta = entry.path().symlink_metadata()?;
            if is_overlay_whiteout(&meta) {
                out.push(Change {
                    path: rel.to_path_buf(),
                    kind: ChangeKind::Deleted,
                });
                continue;
            }
        }

        let kind = if lowers.iter().any(|l| l.join(rel).symlink_metadata().is_ok()) {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        out.push(Change {
            path: rel.to_path_buf(),
            kind,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn whiteout_names() {
        assert_eq!(whiteout_name("etc"), ".wh.etc");
        assert_eq!(whiteout_target(".wh.etc"), Some("etc"));
        assert_eq!(whiteout_target("etc"), None);
    }

    #[test]
    fn tar_untar_round_trip() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/nested"), b"nested content").unwrap();
        fs::write(src.path().join("top"), b"top content").unwrap();
        fs::set_permissions(src.path().join("top"), fs::Permissions::from_mode(0o640)).unwrap();
        std::os::unix::fs::symlink("top", src.path().join("link")).unwrap();

        let stream = tar_layer(src.path(), &[], &[]).unwrap();

        let dst = tempfile::tempdir().unwrap();
        untar_layer(stream, dst.path(), &[], &[]).unwrap();

        assert_eq!(
            fs::read(dst.path().join("sub/nested")).unwrap(),
            b"nested content"
        );
        assert_eq!(fs::read(dst.path().join("top")).unwrap(), b"top content");
        assert_eq!(
            fs::metadata(dst.path().join("top")).unwrap().permissions().mode() & 0o7777,
            0o640
        );
        assert_eq!(
            fs::read_link(dst.path().join("link")).unwrap(),
            PathBuf::from("top")
        );
    }

    #[test]
    fn entries_escaping_the_root_are_dropped() {
        // A hand-built stream, since the builder itself refuses `..`.
        let mut header = Header::new_gnu();
        let name = b"../escape";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(4);
        header.set_cksum();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(b"boom");
        bytes.resize(bytes.len() + 508, 0);
        bytes.resize(bytes.len() + 1024, 0);

        let dst = tempfile::tempdir().unwrap();
        untar_layer(&bytes[..], dst.path(), &[], &[]).unwrap();
        assert!(!dst.path().parent().unwrap().join("escape").exists());
    }

    #[test]
    fn tree_size_counts_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b"), vec![0u8; 28]).unwrap();

        assert_eq!(tree_size(dir.path()).unwrap(), 128);
        assert_eq!(tree_size(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn changes_classify_against_lowers() {
        let lower = tempfile::tempdir().unwrap();
        fs::write(lower.path().join("shadowed"), b"old").unwrap();

        let upper = tempfile::tempdir().unwrap();
        fs::write(upper.path().join("shadowed"), b"new").unwrap();
        fs::write(upper.path().join("fresh"), b"fresh").unwrap();

        let found = changes(upper.path(), &[lower.path().to_path_buf()]).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&Change {
            path: PathBuf::from("fresh"),
            kind: ChangeKind::Added,
        }));
        assert!(found.contains(&Change {
            path: PathBuf::from("shadowed"),
            kind: ChangeKind::Modified,
        }));
    }
}
