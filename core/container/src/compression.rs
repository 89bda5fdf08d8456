//! Folder archiving for container payloads.
//!
//! Two formats:
//! - `zip`: deflate archive with explicit directory entries.
//! - `none`: an uncompressed, length-prefixed archive of the same entries.
//!
//! Entries are collected in sorted order so packing the same tree twice
//! yields the same archive. Symlinks and special files are skipped.

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use tvault_common::{CompressionType, Error, Result};

const RAW_MAGIC: &[u8; 4] = b"TVAR";
const RAW_DIR: u8 = 0;
const RAW_FILE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
}

#[derive(Debug, Clone)]
struct Entry {
    /// `/`-separated path relative to the packed folder.
    name: String,
    path: PathBuf,
    kind: EntryKind,
}

/// Summary of an unpack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackStats {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

fn collect_entries(root: &Path) -> Result<Vec<Entry>> {
    let meta = fs::metadata(root)?;
    if !meta.is_dir() {
        return Err(Error::InvalidInput(format!(
            "Not a directory: {}",
            root.display()
        )));
    }

    let mut entries = Vec::new();
    walk(root, "", &mut entries)?;
    Ok(entries)
}

fn walk(dir: &Path, prefix: &str, out: &mut Vec<Entry>) -> Result<()> {
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let file_name = child.file_name();
        let Some(name) = file_name.to_str() else {
            warn!(path = %child.path().display(), "Skipping entry with non UTF-8 name");
            continue;
        };
        let rel = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        };

        let file_type = fs::symlink_metadata(child.path())?.file_type();
        if file_type.is_dir() {
            out.push(Entry {
                name: rel.clone(),
                path: child.path(),
                kind: EntryKind::Dir,
            });
            walk(&child.path(), &rel, out)?;
        } else if file_type.is_file() {
            out.push(Entry {
                name: rel,
                path: child.path(),
                kind: EntryKind::File,
            });
        } else {
            warn!(path = %child.path().display(), "Skipping symlink or special file");
        }
    }
    Ok(())
}

/// Resolve an archive entry name to a path inside the destination.
///
/// # Errors
/// - Absolute paths, `..` components and empty names are rejected
fn safe_relative(name: &str) -> Result<PathBuf> {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() || trimmed.contains('\\') {
        return Err(Error::InvalidInput(format!("Invalid archive entry: {:?}", name)));
    }

    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::InvalidInput(format!(
                    "Archive entry escapes destination: {:?}",
                    name
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(Error::InvalidInput(format!("Invalid archive entry: {:?}", name)));
    }
    Ok(out)
}

/// Pack `folder` into an archive of the given kind.
///
/// # Preconditions
/// - `folder` exists and is a directory
///
/// # Errors
/// - I/O errors while reading the tree
/// - Archive writer errors
pub fn pack(kind: CompressionType, folder: &Path) -> Result<Vec<u8>> {
    let entries = collect_entries(folder)?;
    debug!(folder = %folder.display(), entries = entries.len(), compression = %kind, "Packing folder");

    match kind {
        CompressionType::Zip => pack_zip(&entries),
        CompressionType::None => pack_raw(&entries),
    }
}

fn zip_err(e: zip::result::ZipError) -> Error {
    Error::Format(format!("Zip error: {}", e))
}

fn pack_zip(entries: &[Entry]) -> Result<Vec<u8>> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for entry in entries {
        match entry.kind {
            EntryKind::Dir => writer
                .add_directory(format!("{}/", entry.name), options)
                .map_err(zip_err)?,
            EntryKind::File => {
                writer.start_file(entry.name.clone(), options).map_err(zip_err)?;
                let mut file = fs::File::open(&entry.path)?;
                std::io::copy(&mut file, &mut writer)?;
            }
        }
    }

    Ok(writer.finish().map_err(zip_err)?.into_inner())
}

fn pack_raw(entries: &[Entry]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(RAW_MAGIC);

    for entry in entries {
        let name = entry.name.as_bytes();
        match entry.kind {
            EntryKind::Dir => {
                out.push(RAW_DIR);
                out.extend_from_slice(&(name.len() as u32).to_le_bytes());
                out.extend_from_slice(name);
            }
            EntryKind::File => {
                let content = fs::read(&entry.path)?;
                out.push(RAW_FILE);
                out.extend_from_slice(&(name.len() as u32).to_le_bytes());
                out.extend_from_slice(name);
                out.extend_from_slice(&(content.len() as u64).to_le_bytes());
                out.extend_from_slice(&content);
            }
        }
    }
    Ok(out)
}

/// Unpack an archive of the given kind into `dest`, creating it if needed.
///
/// The archive is extracted into a staging directory next to `dest` first,
/// so a malformed archive leaves `dest` untouched. A missing `dest` is then
/// created by renaming the staging directory; an existing one has the
/// staged entries moved in, overwriting files at the same paths.
///
/// # Errors
/// - Entries that would escape `dest`
/// - Malformed archives
/// - `dest` or a directory inside it is a symlink, or an entry's path is
///   taken by an entry of the other kind
/// - I/O errors
pub fn unpack(kind: CompressionType, bytes: &[u8], dest: &Path) -> Result<UnpackStats> {
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".tvault-unpack-")
        .tempdir_in(parent)?;

    let stats = match kind {
        CompressionType::Zip => unpack_zip(bytes, staging.path())?,
        CompressionType::None => unpack_raw(bytes, staging.path())?,
    };
    place(staging.path(), dest)?;
    debug!(dest = %dest.display(), files = stats.files, bytes = stats.bytes, "Unpacked archive");
    Ok(stats)
}

fn refuse(path: &Path, reason: &str) -> Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{}: {}", reason, path.display()),
    )
    .into()
}

/// Check that every staged entry can land at its place under `dest`.
fn check_placement(entries: &[Entry], dest: &Path) -> Result<()> {
    for entry in entries {
        let mut target = dest.to_path_buf();
        let components: Vec<&str> = entry.name.split('/').collect();
        for (i, part) in components.iter().enumerate() {
            target.push(part);
            let meta = match fs::symlink_metadata(&target) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            };
            if meta.file_type().is_symlink() {
                return Err(refuse(&target, "Destination contains a symlink"));
            }
            let last = i + 1 == components.len();
            let wants_dir = !last || entry.kind == EntryKind::Dir;
            if wants_dir != meta.is_dir() {
                return Err(refuse(&target, "Destination entry has the wrong type"));
            }
        }
    }
    Ok(())
}

/// Move the staged tree at `staged` into `dest`.
fn place(staged: &Path, dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::rename(staged, dest)?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
        Ok(meta) if meta.file_type().is_symlink() || !meta.is_dir() => {
            return Err(refuse(dest, "Destination is not a directory"));
        }
        Ok(_) => {}
    }

    let entries = collect_entries(staged)?;
    check_placement(&entries, dest)?;
    for entry in entries {
        let target = dest.join(&entry.name);
        match entry.kind {
            EntryKind::Dir => fs::create_dir_all(&target)?,
            EntryKind::File => fs::rename(&entry.path, &target)?,
        }
    }
    Ok(())
}

fn write_file(dest: &Path, rel: &Path, content: &mut dyn Read) -> Result<u64> {
    let target = dest.join(rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(&target)?;
    let written = std::io::copy(content, &mut file)?;
    file.flush()?;
    Ok(written)
}

fn unpack_zip(bytes: &[u8], dest: &Path) -> Result<UnpackStats> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(zip_err)?;
    let mut stats = UnpackStats::default();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_err)?;
        let rel = safe_relative(entry.name())?;

        if entry.is_dir() {
            fs::create_dir_all(dest.join(&rel))?;
            stats.directories += 1;
        } else {
            stats.bytes += write_file(dest, &rel, &mut entry)?;
            stats.files += 1;
        }
    }
    Ok(stats)
}

struct RawReader<'a> {
    data: &'a [u8],
}

impl<'a> RawReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(Error::Format("Archive is truncated".to_string()));
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

fn unpack_raw(bytes: &[u8], dest: &Path) -> Result<UnpackStats> {
    let mut reader = RawReader { data: bytes };
    if reader.take(4)? != RAW_MAGIC {
        return Err(Error::Format("Not an uncompressed archive".to_string()));
    }

    let mut stats = UnpackStats::default();
    while !reader.data.is_empty() {
        let kind = reader.take(1)?[0];
        let name_len = reader.u32()? as usize;
        let name = std::str::from_utf8(reader.take(name_len)?)
            .map_err(|_| Error::Format("Archive entry name is not UTF-8".to_string()))?;
        let rel = safe_relative(name)?;

        match kind {
            RAW_DIR => {
                fs::create_dir_all(dest.join(&rel))?;
                stats.directories += 1;
            }
            RAW_FILE => {
                let len = usize::try_from(reader.u64()?)
                    .map_err(|_| Error::Format("Archive entry too large".to_string()))?;
                let mut content = reader.take(len)?;
                stats.bytes += write_file(dest, &rel, &mut content)?;
                stats.files += 1;
            }
            other => {
                return Err(Error::Format(format!("Unknown archive entry kind {}", other)));
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Build a small tree with nested and empty directories.
    pub(crate) fn populate(root: &Path) {
        fs::create_dir_all(root.join("docs/nested")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("a.txt"), b"alpha").unwrap();
        fs::write(root.join("docs/b.bin"), vec![0u8, 1, 2, 3, 255]).unwrap();
        fs::write(root.join("docs/nested/c.txt"), "gamma ".repeat(1000)).unwrap();
        fs::write(root.join("zero.dat"), b"").unwrap();
    }

    /// Snapshot a tree as relative path -> contents (`None` for directories).
    pub(crate) fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
        let mut out = BTreeMap::new();
        for entry in collect_entries(root).unwrap() {
            let content = match entry.kind {
                EntryKind::Dir => None,
                EntryKind::File => Some(fs::read(&entry.path).unwrap()),
            };
            out.insert(entry.name, content);
        }
        out
    }

    fn roundtrip(kind: CompressionType) {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());

        let archive = pack(kind, src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let out = dest.path().join("out");
        let stats = unpack(kind, &archive, &out).unwrap();

        assert_eq!(snapshot(&out), snapshot(src.path()));
        assert_eq!(stats.files, 4);
        assert_eq!(stats.directories, 3);
        assert!(out.join("empty").is_dir());
    }

    #[test]
    fn test_zip_roundtrip() {
        roundtrip(CompressionType::Zip);
    }

    #[test]
    fn test_raw_roundtrip() {
        roundtrip(CompressionType::None);
    }

    #[test]
    fn test_pack_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());
        for kind in [CompressionType::Zip, CompressionType::None] {
            assert_eq!(pack(kind, src.path()).unwrap(), pack(kind, src.path()).unwrap());
        }
    }

    #[test]
    fn test_zip_compresses() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());
        let zip = pack(CompressionType::Zip, src.path()).unwrap();
        let raw = pack(CompressionType::None, src.path()).unwrap();
        assert!(zip.len() < raw.len());
    }

    #[test]
    fn test_unpack_twice_identical() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());
        let archive = pack(CompressionType::Zip, src.path()).unwrap();

        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        unpack(CompressionType::Zip, &archive, d1.path()).unwrap();
        unpack(CompressionType::Zip, &archive, d2.path()).unwrap();
        assert_eq!(snapshot(d1.path()), snapshot(d2.path()));

        // Unpacking over an existing tree overwrites files it writes.
        fs::write(d1.path().join("a.txt"), b"changed").unwrap();
        unpack(CompressionType::Zip, &archive, d1.path()).unwrap();
        assert_eq!(fs::read(d1.path().join("a.txt")).unwrap(), b"alpha");
    }

    #[test]
    fn test_path_traversal_rejected() {
        assert!(safe_relative("../evil").is_err());
        assert!(safe_relative("a/../../evil").is_err());
        assert!(safe_relative("/etc/passwd").is_err());
        assert!(safe_relative("").is_err());
        assert_eq!(safe_relative("a/./b/").unwrap(), PathBuf::from("a/b"));

        let mut evil = RAW_MAGIC.to_vec();
        let name = b"../escape.txt";
        evil.push(RAW_FILE);
        evil.extend_from_slice(&(name.len() as u32).to_le_bytes());
        evil.extend_from_slice(name);
        evil.extend_from_slice(&3u64.to_le_bytes());
        evil.extend_from_slice(b"bad");

        let dest = tempfile::tempdir().unwrap();
        let out = dest.path().join("out");
        assert!(unpack(CompressionType::None, &evil, &out).is_err());
        assert!(!dest.path().join("escape.txt").exists());
    }

    /// A raw archive holding one good file followed by a broken entry.
    fn broken_after_first_file() -> Vec<u8> {
        let mut archive = RAW_MAGIC.to_vec();
        let name = b"first.txt";
        archive.push(RAW_FILE);
        archive.extend_from_slice(&(name.len() as u32).to_le_bytes());
        archive.extend_from_slice(name);
        archive.extend_from_slice(&5u64.to_le_bytes());
        archive.extend_from_slice(b"hello");
        archive.push(9);
        archive
    }

    #[test]
    fn test_failed_unpack_leaves_no_partial_tree() {
        let root = tempfile::tempdir().unwrap();
        let archive = broken_after_first_file();

        let out = root.path().join("out");
        assert!(unpack(CompressionType::None, &archive, &out).is_err());
        assert!(!out.exists());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);

        fs::create_dir(&out).unwrap();
        fs::write(out.join("keep.txt"), b"keep").unwrap();
        assert!(unpack(CompressionType::None, &archive, &out).is_err());
        assert_eq!(snapshot(&out).len(), 1);
        assert_eq!(fs::read(out.join("keep.txt")).unwrap(), b"keep");
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_unpack_into_existing_folder_merges() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());
        let archive = pack(CompressionType::None, src.path()).unwrap();

        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("out");
        fs::create_dir_all(out.join("docs")).unwrap();
        fs::write(out.join("other.txt"), b"other").unwrap();
        unpack(CompressionType::None, &archive, &out).unwrap();

        assert_eq!(fs::read(out.join("other.txt")).unwrap(), b"other");
        assert_eq!(fs::read(out.join("docs/b.bin")).unwrap(), vec![0u8, 1, 2, 3, 255]);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_type_clash_rejected() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());
        let archive = pack(CompressionType::Zip, src.path()).unwrap();

        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(out.join("docs"), b"a file where a folder goes").unwrap();
        assert!(matches!(
            unpack(CompressionType::Zip, &archive, &out),
            Err(Error::Io(_))
        ));
        assert!(!out.join("a.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_in_destination_refused() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());
        let archive = pack(CompressionType::Zip, src.path()).unwrap();

        let root = tempfile::tempdir().unwrap();
        let outside = root.path().join("outside");
        fs::create_dir(&outside).unwrap();
        let out = root.path().join("out");
        fs::create_dir(&out).unwrap();
        std::os::unix::fs::symlink(&outside, out.join("docs")).unwrap();

        assert!(unpack(CompressionType::Zip, &archive, &out).is_err());
        assert_eq!(fs::read_dir(&outside).unwrap().count(), 0);
        assert!(!out.join("a.txt").exists());

        let linked = root.path().join("linked");
        std::os::unix::fs::symlink(&outside, &linked).unwrap();
        assert!(unpack(CompressionType::Zip, &archive, &linked).is_err());
        assert_eq!(fs::read_dir(&outside).unwrap().count(), 0);
    }

    #[test]
    fn test_malformed_archives() {
        let dest = tempfile::tempdir().unwrap();
        assert!(unpack(CompressionType::None, b"nope", dest.path()).is_err());
        assert!(unpack(CompressionType::None, b"TVAR\x01\x05", dest.path()).is_err());
        assert!(unpack(CompressionType::Zip, b"not a zip", dest.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_skipped() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("real.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(src.path().join("real.txt"), src.path().join("link.txt"))
            .unwrap();

        let archive = pack(CompressionType::None, src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        unpack(CompressionType::None, &archive, dest.path()).unwrap();
        assert!(dest.path().join("real.txt").exists());
        assert!(!dest.path().join("link.txt").exists());
    }

    #[test]
    fn test_pack_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pack(CompressionType::Zip, &dir.path().join("missing")).is_err());
    }
}
