//! Content-addressable layer packaging
//!
//! Serializes a directory tree (or a single file) into a tar stream
//! with normalized headers: zeroed modification times, an optional
//! numeric owner override, and synthesized parent-directory entries up
//! to (not including) the filesystem root, so the layer is
//! self-contained when unpacked standalone.
//!
//! The SHA-256 of the raw uncompressed stream is computed while the
//! stream is written to a temporary file, which is then renamed into
//! place as `<hex>.tar`. That digest is the layer's sole identity for
//! caching and reuse lookup: packaging a byte-identical tree always
//! yields the same digest, independent of directory read order or
//! filesystem timestamps.

use crate::error::{StrataError, StrataResult};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};

/// Numeric ownership override applied to every tar header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chown {
    pub uid: u32,
    pub gid: u32,
}

/// A packaged layer: its content digest and the tar file on disk
#[derive(Debug, Clone)]
pub struct PackagedLayer {
    /// Content digest of the uncompressed stream, `sha256:<hex>` form
    pub digest: String,
    /// Digest-named tar file inside the artifacts directory
    pub tar_path: PathBuf,
}

/// Package a directory tree as a tar layer rooted at `dest`.
///
/// `dest` is the virtual in-image path the tree appears under; passing
/// the source path itself keeps the layout identical to disk.
pub fn package_dir(
    artifacts_dir: &Path,
    src: &Path,
    dest: &Path,
    chown: Option<Chown>,
) -> StrataResult<PackagedLayer> {
    package_with(artifacts_dir, |builder| {
        append_parent_dirs(builder, dest, chown)?;
        append_tree(builder, src, dest, chown)
    })
}

/// Package a single file as a tar layer at the virtual path `dest`
pub fn package_file(
    artifacts_dir: &Path,
    src: &Path,
    dest: &Path,
    chown: Option<Chown>,
) -> StrataResult<PackagedLayer> {
    package_with(artifacts_dir, |builder| {
        append_parent_dirs(builder, dest, chown)?;
        let meta = fs::symlink_metadata(src)
            .map_err(|e| StrataError::io(format!("reading {}", src.display()), e))?;
        append_file(builder, src, dest, &meta, chown)
    })
}

/// Writer that hashes everything it forwards
struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn package_with<F>(artifacts_dir: &Path, build: F) -> StrataResult<PackagedLayer>
where
    F: FnOnce(&mut Builder<DigestWriter<File>>) -> StrataResult<()>,
{
    fs::create_dir_all(artifacts_dir).map_err(|e| {
        StrataError::io(
            format!("creating artifacts dir {}", artifacts_dir.display()),
            e,
        )
    })?;

    // Collision-free per-invocation temp name; renamed once the digest
    // is known.
    let tmp_path = artifacts_dir.join(format!(".{}.tar.partial", uuid::Uuid::new_v4()));
    let file = File::create(&tmp_path)
        .map_err(|e| StrataError::io(format!("creating {}", tmp_path.display()), e))?;

    let mut builder = Builder::new(DigestWriter {
        inner: file,
        hasher: Sha256::new(),
    });

    let result = build(&mut builder).and_then(|()| {
        let mut writer = builder
            .into_inner()
            .map_err(|e| StrataError::io("finishing layer tarball", e))?;
        writer
            .flush()
            .map_err(|e| StrataError::io("flushing layer tarball", e))?;
        Ok(hex::encode(writer.hasher.finalize()))
    });

    let digest = match result {
        Ok(digest) => digest,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
    };

    let tar_path = artifacts_dir.join(format!("{digest}.tar"));
    fs::rename(&tmp_path, &tar_path)
        .map_err(|e| StrataError::io(format!("renaming into {}", tar_path.display()), e))?;

    Ok(PackagedLayer {
        digest: format!("sha256:{digest}"),
        tar_path,
    })
}

/// Archive entry name for a virtual path: tar members are stored
/// without the leading root so they unpack cleanly anywhere.
fn entry_name(path: &Path) -> PathBuf {
    path.strip_prefix("/").unwrap_or(path).to_path_buf()
}

fn set_owner(header: &mut Header, meta: Option<&fs::Metadata>, chown: Option<Chown>) {
    match (chown, meta) {
        (Some(c), _) => {
            header.set_uid(u64::from(c.uid));
            header.set_gid(u64::from(c.gid));
        }
        (None, Some(m)) => {
            header.set_uid(m.uid().into());
            header.set_gid(m.gid().into());
        }
        (None, None) => {
            header.set_uid(0);
            header.set_gid(0);
        }
    }
}

/// Synthesized directory entries for every ancestor of `dest`,
/// excluding the filesystem root and `dest` itself, topmost first.
fn append_parent_dirs<W: Write>(
    builder: &mut Builder<W>,
    dest: &Path,
    chown: Option<Chown>,
) -> StrataResult<()> {
    let mut parents: Vec<&Path> = dest
        .ancestors()
        .skip(1)
        .filter(|p| p.file_name().is_some())
        .collect();
    parents.reverse();

    for parent in parents {
        append_dir_header(builder, parent, 0o755, None, chown)?;
    }
    Ok(())
}

fn append_dir_header<W: Write>(
    builder: &mut Builder<W>,
    dest: &Path,
    mode: u32,
    meta: Option<&fs::Metadata>,
    chown: Option<Chown>,
) -> StrataResult<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(mode);
    header.set_mtime(0);
    set_owner(&mut header, meta, chown);
    builder
        .append_data(&mut header, entry_name(dest), io::empty())
        .map_err(|e| StrataError::io(format!("writing dir header {}", dest.display()), e))
}

fn append_file<W: Write>(
    builder: &mut Builder<W>,
    src: &Path,
    dest: &Path,
    meta: &fs::Metadata,
    chown: Option<Chown>,
) -> StrataResult<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(meta.len());
    header.set_mode(meta.permissions().mode() & 0o7777);
    header.set_mtime(0);
    set_owner(&mut header, Some(meta), chown);

    let mut file =
        File::open(src).map_err(|e| StrataError::io(format!("opening {}", src.display()), e))?;
    builder
        .append_data(&mut header, entry_name(dest), &mut file)
        .map_err(|e| StrataError::io(format!("archiving {}", src.display()), e))
}

fn append_symlink<W: Write>(
    builder: &mut Builder<W>,
    src: &Path,
    dest: &Path,
    meta: &fs::Metadata,
    chown: Option<Chown>,
) -> StrataResult<()> {
    let target = fs::read_link(src)
        .map_err(|e| StrataError::io(format!("reading link {}", src.display()), e))?;

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Symlink);
    header.set_size(0);
    header.set_mode(0o777);
    header.set_mtime(0);
    set_owner(&mut header, Some(meta), chown);
    builder
        .append_link(&mut header, entry_name(dest), &target)
        .map_err(|e| StrataError::io(format!("archiving link {}", src.display()), e))
}

/// Recursively archive `src` under the virtual path `dest`.
/// Entries are visited in name order so the stream is deterministic.
fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    src: &Path,
    dest: &Path,
    chown: Option<Chown>,
) -> StrataResult<()> {
    let meta = fs::symlink_metadata(src)
        .map_err(|e| StrataError::io(format!("reading {}", src.display()), e))?;
    append_dir_header(
        builder,
        dest,
        meta.permissions().mode() & 0o7777,
        Some(&meta),
        chown,
    )?;

    let mut entries: Vec<_> = fs::read_dir(src)
        .map_err(|e| StrataError::io(format!("reading dir {}", src.display()), e))?
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| StrataError::io(format!("reading dir {}", src.display()), e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let child_src = entry.path();
        let child_dest = dest.join(entry.file_name());
        let child_meta = fs::symlink_metadata(&child_src)
            .map_err(|e| StrataError::io(format!("reading {}", child_src.display()), e))?;

        if child_meta.file_type().is_symlink() {
            append_symlink(builder, &child_src, &child_dest, &child_meta, chown)?;
        } else if child_meta.is_dir() {
            append_tree(builder, &child_src, &child_dest, chown)?;
        } else if child_meta.is_file() {
            append_file(builder, &child_src, &child_dest, &child_meta, chown)?;
        }
        // other file types (sockets, fifos) have no tar representation here
    }
    Ok(())
}
