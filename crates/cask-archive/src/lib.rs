//! Artifact packing
//!
//! Turns a local directory (or a single file) into one gzip-compressed tar
//! blob and back. Archives are built canonically: entries sorted by path,
//! mtime/uid/gid zeroed and modes normalized to 0644/0755, so packing the same
//! tree twice yields equivalent bytes.
//!
//! Layout inside the blob:
//! - directory source: every entry relative to the directory, empty
//!   subdirectories included
//! - file source: a single entry named after the file

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, Header};
use walkdir::WalkDir;

/// Gzip magic bytes; anything else is rejected before tar parsing.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors for packing and unpacking.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Source does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("Symlink escapes source root: {path}")]
    SymlinkEscapesRoot { path: PathBuf },

    #[error("Corrupt archive: {0}")]
    Corrupt(String),
}

impl ArchiveError {
    /// Whether this error means the blob itself is unusable.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Kind of entry collected from the source tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Directory,
    Symlink,
}

struct EntryInfo {
    kind: EntryKind,
    /// Absolute path on disk
    full_path: PathBuf,
    symlink_target: Option<PathBuf>,
}

/// Summary of an unpack operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackStats {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
}

/// Packs and unpacks artifact blobs.
#[derive(Debug, Clone)]
pub struct Archiver {
    level: Compression,
    dereference_symlinks: bool,
}

impl Default for Archiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
            dereference_symlinks: false,
        }
    }

    /// Set gzip level (0-9). Values above 9 are clamped.
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }

    /// Archive symlink targets instead of the links themselves.
    pub fn with_dereference_symlinks(mut self, dereference: bool) -> Self {
        self.dereference_symlinks = dereference;
        self
    }

    /// Pack `source` into an in-memory blob.
    pub fn pack(&self, source: &Path) -> ArchiveResult<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), self.level);
        let encoder = self.write_archive(source, encoder)?;
        Ok(encoder.finish()?)
    }

    /// Pack `source` into a blob file at `blob_path`, returning its size.
    pub fn pack_to_file(&self, source: &Path, blob_path: &Path) -> ArchiveResult<u64> {
        let file = File::create(blob_path)?;
        let encoder = GzEncoder::new(BufWriter::new(file), self.level);
        let encoder = self.write_archive(source, encoder)?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        drop(writer);
        Ok(fs::metadata(blob_path)?.len())
    }

    /// Unpack an in-memory blob into `destination`.
    pub fn unpack(&self, blob: &[u8], destination: &Path) -> ArchiveResult<UnpackStats> {
        if blob.len() < GZIP_MAGIC.len() || blob[..2] != GZIP_MAGIC {
            return Err(ArchiveError::Corrupt("not a gzip stream".to_string()));
        }
        self.extract(blob, destination)
    }

    /// Unpack a blob file into `destination`.
    pub fn unpack_file(&self, blob_path: &Path, destination: &Path) -> ArchiveResult<UnpackStats> {
        let mut reader = BufReader::new(File::open(blob_path)?);
        let mut magic = [0u8; 2];
        if let Err(e) = reader.read_exact(&mut magic) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Err(ArchiveError::Corrupt("blob is too short".to_string()));
            }
            return Err(e.into());
        }
        if magic != GZIP_MAGIC {
            return Err(ArchiveError::Corrupt("not a gzip stream".to_string()));
        }
        self.extract(magic.as_slice().chain(reader), destination)
    }

    /// Collect entries to archive, sorted by relative path.
    fn collect_entries(&self, root: &Path) -> ArchiveResult<BTreeMap<PathBuf, EntryInfo>> {
        let mut entries = BTreeMap::new();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        {
            let entry = entry?;
            let path = entry.path();

            let rel_path = match path.strip_prefix(root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            if rel_path.as_os_str().is_empty() {
                continue;
            }

            let file_type = entry.file_type();
            let info = if file_type.is_symlink() {
                let target = fs::read_link(path)?;
                let resolved = if target.is_absolute() {
                    target.clone()
                } else {
                    path.parent().unwrap_or(path).join(&target)
                };
                let canonical = resolved.canonicalize().unwrap_or(resolved);
                let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
                if !canonical.starts_with(&canonical_root) {
                    return Err(ArchiveError::SymlinkEscapesRoot {
                        path: path.to_path_buf(),
                    });
                }

                if self.dereference_symlinks {
                    let kind = if fs::metadata(&canonical)?.is_dir() {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    };
                    EntryInfo {
                        kind,
                        full_path: canonical,
                        symlink_target: None,
                    }
                } else {
                    EntryInfo {
                        kind: EntryKind::Symlink,
                        full_path: path.to_path_buf(),
                        symlink_target: Some(target),
                    }
                }
            } else if file_type.is_dir() {
                EntryInfo {
                    kind: EntryKind::Directory,
                    full_path: path.to_path_buf(),
                    symlink_target: None,
                }
            } else {
                EntryInfo {
                    kind: EntryKind::File,
                    full_path: path.to_path_buf(),
                    symlink_target: None,
                }
            };

            entries.insert(rel_path.to_path_buf(), info);
        }

        Ok(entries)
    }

    fn write_archive<W: Write>(&self, source: &Path, writer: W) -> ArchiveResult<W> {
        let metadata = match fs::metadata(source) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArchiveError::SourceMissing(source.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut builder = Builder::new(writer);

        if metadata.is_dir() {
            let entries = self.collect_entries(source)?;
            for (rel_path, info) in &entries {
                match info.kind {
                    EntryKind::File => append_file(&mut builder, rel_path, &info.full_path)?,
                    EntryKind::Directory => {
                        let mut header = canonical_header(tar::EntryType::Directory, 0o755);
                        header.set_size(0);
                        builder.append_data(&mut header, rel_path, io::empty())?;
                    }
                    EntryKind::Symlink => {
                        let target = info.symlink_target.as_deref().unwrap_or(Path::new(""));
                        let mut header = canonical_header(tar::EntryType::Symlink, 0o777);
                        header.set_size(0);
                        builder.append_link(&mut header, rel_path, target)?;
                    }
                }
            }
            tracing::debug!(source = %source.display(), entries = entries.len(), "packed directory");
        } else {
            let name = source
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| ArchiveError::SourceMissing(source.to_path_buf()))?;
            append_file(&mut builder, &name, source)?;
            tracing::debug!(source = %source.display(), "packed single file");
        }

        Ok(builder.into_inner()?)
    }

    fn extract<R: Read>(&self, reader: R, destination: &Path) -> ArchiveResult<UnpackStats> {
        fs::create_dir_all(destination)?;

        let mut archive = Archive::new(GzDecoder::new(reader));
        archive.set_preserve_mtime(false);
        archive.set_overwrite(true);

        let mut stats = UnpackStats::default();
        let entries = archive.entries().map_err(corrupt_or_io)?;
        for entry in entries {
            let mut entry = entry.map_err(corrupt_or_io)?;
            let rel_path = entry.path().map_err(corrupt_or_io)?.into_owned();

            if !is_contained(&rel_path) {
                return Err(ArchiveError::Corrupt(format!(
                    "entry escapes destination: {}",
                    rel_path.display()
                )));
            }

            match entry.header().entry_type() {
                tar::EntryType::Directory => stats.directories += 1,
                tar::EntryType::Symlink => stats.symlinks += 1,
                _ => stats.files += 1,
            }

            let unpacked = entry.unpack_in(destination).map_err(corrupt_or_io)?;
            if !unpacked {
                return Err(ArchiveError::Corrupt(format!(
                    "entry rejected: {}",
                    rel_path.display()
                )));
            }
        }

        Ok(stats)
    }
}

fn canonical_header(entry_type: tar::EntryType, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header
}

fn append_file<W: Write>(builder: &mut Builder<W>, rel_path: &Path, full_path: &Path) -> ArchiveResult<()> {
    let file = File::open(full_path)?;
    let size = file.metadata()?.len();
    let mode = if is_executable(full_path) { 0o755 } else { 0o644 };

    let mut header = canonical_header(tar::EntryType::Regular, mode);
    header.set_size(size);

    // append_data handles long names and the checksum
    builder.append_data(&mut header, rel_path, file)?;
    Ok(())
}

/// Relative, and never climbs above its root.
fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Errors raised while reading archive data mean the blob is bad; anything
/// else is a local filesystem failure.
fn corrupt_or_io(e: io::Error) -> ArchiveError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::Other => ArchiveError::Corrupt(e.to_string()),
        _ => ArchiveError::Io(e),
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            return metadata.permissions().mode() & 0o111 != 0;
        }
    }
    false
}
