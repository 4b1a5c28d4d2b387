//! Content archiving
//!
//! Walks the content tree top-down in file-name order, applies exclusion
//! rules, and streams every kept entry into a compressed tar file while
//! recording a per-file manifest. Excluded directories are pruned: nothing
//! beneath them is visited or recorded.

mod exclude;
mod manifest;

pub use exclude::{standard_patterns, ExcludeError, ExcludeRules, STANDARD_EXCLUDES};
pub use manifest::{ExclusionReason, ExclusionRecord, FileRecord, Manifest};

use std::fs::{self, File, Metadata};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tar::{Builder, EntryType, Header};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::checksum::{self, EMPTY_SENTINEL, SYMLINK_SENTINEL};
use crate::compression::{CompressionError, CompressionMethod, Encoder, DEFAULT_LEVEL};

/// Base name of the archive file, before the method extension
pub const ARCHIVE_BASENAME: &str = "content";

/// File synthesized into the archive when the content tree is empty
pub const EMPTY_PLACEHOLDER_NAME: &str = "README_SHELLPACK_EMPTY.txt";

/// Contents of the synthesized placeholder
pub const EMPTY_PLACEHOLDER_TEXT: &str = "shellpack: empty source tree\n";

/// Errors for archiving operations
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("content directory not found: {0}")]
    SourceMissing(PathBuf),

    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("exclude rules error: {0}")]
    Exclude(#[from] ExcludeError),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("path is not within content root: {0}")]
    PathNotInRoot(PathBuf),
}

/// Result of archiving a content tree
#[derive(Debug)]
pub struct ArchiveOutput {
    /// Path of the compressed archive
    pub path: PathBuf,
    /// Method the archive was written with
    pub method: CompressionMethod,
    /// Manifest with checksum and size filled in
    pub manifest: Manifest,
    /// Whether the placeholder file was synthesized
    pub synthesized_placeholder: bool,
}

impl ArchiveOutput {
    /// File name of the archive (`content.tar.gz`, ...)
    pub fn file_name(&self) -> String {
        archive_file_name(self.method)
    }
}

/// Archive file name for a method
pub fn archive_file_name(method: CompressionMethod) -> String {
    format!("{}{}", ARCHIVE_BASENAME, method.extension())
}

/// Archiver for a content tree
pub struct Archiver {
    /// Content root
    root: PathBuf,
    /// Exclusion rules
    exclude: ExcludeRules,
    /// Compression method
    method: CompressionMethod,
    /// Compression level (ignored for store)
    level: u32,
}

impl Archiver {
    /// Create an archiver for the given content root
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            exclude: ExcludeRules::default(),
            method: CompressionMethod::default(),
            level: DEFAULT_LEVEL,
        }
    }

    /// Set exclusion rules
    pub fn with_exclude(mut self, exclude: ExcludeRules) -> Self {
        self.exclude = exclude;
        self
    }

    /// Set compression method and level
    pub fn with_compression(mut self, method: CompressionMethod, level: u32) -> Self {
        self.method = method;
        self.level = level;
        self
    }

    /// Set compression from a method name as found in configuration
    pub fn with_compression_name(self, name: &str, level: u32) -> Result<Self, ArchiveError> {
        let method = name
            .parse::<CompressionMethod>()
            .map_err(|_| ArchiveError::UnsupportedCompression(name.to_string()))?;
        Ok(self.with_compression(method, level))
    }

    /// Write `content.tar*` into `out_dir` and return it with its manifest.
    ///
    /// A partially written archive is removed before an error propagates.
    pub fn create(&self, out_dir: &Path) -> Result<ArchiveOutput, ArchiveError> {
        if !self.root.is_dir() {
            return Err(ArchiveError::SourceMissing(self.root.clone()));
        }

        let path = out_dir.join(archive_file_name(self.method));
        info!(
            "Archiving {} ({}{})",
            self.root.display(),
            self.method,
            if self.method.uses_level() {
                format!(", level {}", self.level)
            } else {
                String::new()
            }
        );

        let result = self.write_archive(&path);
        let (mut manifest, synthesized_placeholder) = match result {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        manifest.archive_sha256 = checksum::sha256_file(&path)?;
        manifest.archive_size = fs::metadata(&path)?.len();

        let (excluded_files, excluded_dirs) = manifest.exclusion_counts();
        info!(
            "{} files included ({} bytes), {} files and {} directories excluded",
            manifest.files.len(),
            manifest.total_size(),
            excluded_files,
            excluded_dirs
        );
        debug!("Archive checksum: {}", manifest.archive_sha256);

        Ok(ArchiveOutput {
            path,
            method: self.method,
            manifest,
            synthesized_placeholder,
        })
    }

    fn write_archive(&self, path: &Path) -> Result<(Manifest, bool), ArchiveError> {
        let file = File::create(path)?;
        let encoder = Encoder::new(BufWriter::new(file), self.method, self.level)?;
        let mut builder = Builder::new(encoder);
        let mut manifest = Manifest::default();

        let mut walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() > 0 => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let rel_path = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|_| ArchiveError::PathNotInRoot(entry.path().to_path_buf()))?;

            // Skip root itself
            if rel_path.as_os_str().is_empty() {
                continue;
            }
            let rel = posix_path(rel_path);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                let dir_rel = format!("{}/", rel);
                if let Some(pattern) = self.exclude.matching_pattern(&dir_rel) {
                    debug!("Excluding directory {} ({})", dir_rel, pattern);
                    manifest.excluded.push(ExclusionRecord {
                        path: dir_rel,
                        reason: ExclusionReason::Pattern,
                        pattern: pattern.to_string(),
                    });
                    walker.skip_current_dir();
                    continue;
                }
                let metadata = entry.metadata()?;
                let mut header = base_header(&metadata);
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, &dir_rel, io::empty())?;
                continue;
            }

            if let Some(pattern) = self.exclude.matching_pattern(&rel) {
                debug!("Excluding {} ({})", rel, pattern);
                manifest.excluded.push(ExclusionRecord {
                    path: rel,
                    reason: ExclusionReason::Pattern,
                    pattern: pattern.to_string(),
                });
                continue;
            }

            let appended = if file_type.is_symlink() {
                self.append_symlink(&mut builder, entry.path(), &rel)
            } else if file_type.is_file() {
                self.append_file(&mut builder, entry.path(), &rel)
            } else {
                warn!("Skipping special file {}", rel);
                continue;
            };

            match appended {
                Ok(record) => manifest.files.push(record),
                Err(ArchiveError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("File disappeared during archiving: {}", rel);
                }
                Err(e) => return Err(e),
            }
        }

        let synthesized = manifest.files.is_empty();
        if synthesized {
            warn!("Content tree is empty, adding {}", EMPTY_PLACEHOLDER_NAME);
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(EMPTY_PLACEHOLDER_TEXT.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            builder.append_data(
                &mut header,
                EMPTY_PLACEHOLDER_NAME,
                EMPTY_PLACEHOLDER_TEXT.as_bytes(),
            )?;
        }

        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;

        Ok((manifest, synthesized))
    }

    fn append_file<W: Write>(
        &self,
        builder: &mut Builder<W>,
        path: &Path,
        rel: &str,
    ) -> Result<FileRecord, ArchiveError> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        let size = metadata.len();

        // Hash the bytes the archive receives
        let mut reader = checksum::HashingReader::new(file);
        let mut header = base_header(&metadata);
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        builder.append_data(&mut header, rel, io::Read::take(&mut reader, size))?;
        if reader.bytes_read() != size {
            return Err(io::Error::other(format!("{} changed while being archived", rel)).into());
        }

        let checksum_sha256 = if size == 0 {
            EMPTY_SENTINEL.to_string()
        } else {
            reader.finish()
        };

        Ok(FileRecord {
            path: rel.to_string(),
            size,
            checksum_sha256,
            mtime: mtime_secs(&metadata),
            is_link: false,
        })
    }

    fn append_symlink<W: Write>(
        &self,
        builder: &mut Builder<W>,
        path: &Path,
        rel: &str,
    ) -> Result<FileRecord, ArchiveError> {
        let metadata = fs::symlink_metadata(path)?;
        let target = fs::read_link(path)?;

        let mut header = base_header(&metadata);
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, rel, &target)?;

        Ok(FileRecord {
            path: rel.to_string(),
            size: metadata.len(),
            checksum_sha256: SYMLINK_SENTINEL.to_string(),
            mtime: mtime_secs(&metadata),
            is_link: true,
        })
    }
}

/// Join path components with `/`
pub fn posix_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Header with ownership normalized and mode/mtime taken from the file
fn base_header(metadata: &Metadata) -> Header {
    let mut header = Header::new_gnu();
    header.set_mode(file_mode(metadata));
    header.set_mtime(mtime_secs(metadata));
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn mtime_secs(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn file_mode(metadata: &Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        if metadata.is_dir() {
            0o755
        } else {
            0o644
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::create_decoder;
    use std::collections::BTreeMap;
    use std::io::Read;
    use tempfile::TempDir;

    fn create_test_dir() -> TempDir {
        let dir = TempDir::new().unwrap();

        fs::write(dir.path().join("file1.txt"), "content1").unwrap();
        fs::write(dir.path().join("file2.txt"), "content2").unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        fs::write(dir.path().join("subdir/file3.txt"), "content3").unwrap();

        dir
    }

    fn read_entries(output: &ArchiveOutput) -> BTreeMap<String, Vec<u8>> {
        let file = File::open(&output.path).unwrap();
        let mut archive = tar::Archive::new(create_decoder(file, output.method));
        let mut entries = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            entries.insert(path, data);
        }
        entries
    }

    #[test]
    fn test_archiver_basic() {
        let dir = create_test_dir();
        let out = TempDir::new().unwrap();

        let output = Archiver::new(dir.path().to_path_buf())
            .create(out.path())
            .unwrap();

        assert_eq!(output.path.file_name().unwrap(), "content.tar.gz");
        assert_eq!(output.manifest.archive_sha256.len(), 64);
        assert_eq!(output.manifest.files.len(), 3);
        assert!(!output.synthesized_placeholder);

        let entries = read_entries(&output);
        assert_eq!(entries["subdir/file3.txt"], b"content3");
    }

    #[test]
    fn test_walk_order_is_sorted() {
        let dir = create_test_dir();
        fs::write(dir.path().join("z_file.txt"), "z").unwrap();
        fs::write(dir.path().join("a_file.txt"), "a").unwrap();
        let out = TempDir::new().unwrap();

        let output = Archiver::new(dir.path().to_path_buf())
            .create(out.path())
            .unwrap();

        let paths: Vec<_> = output.manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["a_file.txt", "file1.txt", "file2.txt", "subdir/file3.txt", "z_file.txt"]
        );
    }

    #[test]
    fn test_excluded_directory_is_pruned() {
        let dir = create_test_dir();
        fs::create_dir_all(dir.path().join("cache/deep")).unwrap();
        fs::write(dir.path().join("cache/deep/x.bin"), "x").unwrap();
        fs::write(dir.path().join("cache/y.bin"), "y").unwrap();
        let out = TempDir::new().unwrap();

        let rules = ExcludeRules::new(&["cache/"], false).unwrap();
        let output = Archiver::new(dir.path().to_path_buf())
            .with_exclude(rules)
            .create(out.path())
            .unwrap();

        let excluded: Vec<_> = output.manifest.excluded.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(excluded, vec!["cache/"]);
        assert!(output.manifest.files.iter().all(|f| !f.path.starts_with("cache")));
        assert!(read_entries(&output).keys().all(|k| !k.starts_with("cache")));
    }

    #[test]
    fn test_excluded_file_recorded_once() {
        let dir = create_test_dir();
        fs::write(dir.path().join("subdir/debug.log"), "log").unwrap();
        let out = TempDir::new().unwrap();

        let rules = ExcludeRules::new(&["*.log"], false).unwrap();
        let output = Archiver::new(dir.path().to_path_buf())
            .with_exclude(rules)
            .create(out.path())
            .unwrap();

        assert!(output.manifest.is_excluded("subdir/debug.log"));
        assert!(output.manifest.find_file("subdir/debug.log").is_none());
        assert_eq!(output.manifest.excluded[0].pattern, "*.log");
    }

    #[test]
    fn test_manifest_checksums_match_archived_bytes() {
        let dir = create_test_dir();
        let big: Vec<u8> = (0..(checksum::BLOCK_SIZE * 2 + 3)).map(|i| (i % 97) as u8).collect();
        fs::write(dir.path().join("big.bin"), &big).unwrap();
        let out = TempDir::new().unwrap();

        let output = Archiver::new(dir.path().to_path_buf())
            .create(out.path())
            .unwrap();

        let entries = read_entries(&output);
        for record in &output.manifest.files {
            assert_eq!(record.checksum_sha256, checksum::sha256_bytes(&entries[&record.path]));
        }
        assert_eq!(output.manifest.find_file("big.bin").unwrap().size, big.len() as u64);
    }

    #[test]
    fn test_empty_file_sentinel() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("empty.txt"), "").unwrap();
        let out = TempDir::new().unwrap();

        let output = Archiver::new(dir.path().to_path_buf())
            .create(out.path())
            .unwrap();

        let record = output.manifest.find_file("empty.txt").unwrap();
        assert_eq!(record.checksum_sha256, EMPTY_SENTINEL);
        assert_eq!(record.size, 0);
    }

    #[test]
    fn test_empty_tree_gets_placeholder() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let output = Archiver::new(dir.path().to_path_buf())
            .create(out.path())
            .unwrap();

        assert!(output.synthesized_placeholder);
        assert!(output.manifest.files.is_empty());
        assert!(!dir.path().join(EMPTY_PLACEHOLDER_NAME).exists());
        assert_eq!(
            read_entries(&output)[EMPTY_PLACEHOLDER_NAME],
            EMPTY_PLACEHOLDER_TEXT.as_bytes()
        );
    }

    #[test]
    fn test_missing_root() {
        let out = TempDir::new().unwrap();
        let err = Archiver::new(out.path().join("missing"))
            .create(out.path())
            .unwrap_err();
        assert!(matches!(err, ArchiveError::SourceMissing(_)));
    }

    #[test]
    fn test_every_method() {
        let dir = create_test_dir();
        for method in CompressionMethod::PROBE_ORDER {
            let out = TempDir::new().unwrap();
            let output = Archiver::new(dir.path().to_path_buf())
                .with_compression(method, 9)
                .create(out.path())
                .unwrap();
            assert_eq!(output.file_name(), format!("content{}", method.extension()));
            assert_eq!(read_entries(&output)["file1.txt"], b"content1");
        }
    }

    #[test]
    fn test_unsupported_compression_name() {
        let dir = create_test_dir();
        let err = Archiver::new(dir.path().to_path_buf())
            .with_compression_name("zip", 6)
            .err()
            .unwrap();
        assert!(matches!(err, ArchiveError::UnsupportedCompression(_)));
    }

    #[test]
    fn test_deterministic_output() {
        let dir = create_test_dir();
        let out1 = TempDir::new().unwrap();
        let out2 = TempDir::new().unwrap();

        let a = Archiver::new(dir.path().to_path_buf()).create(out1.path()).unwrap();
        let b = Archiver::new(dir.path().to_path_buf()).create(out2.path()).unwrap();

        assert_eq!(a.manifest.archive_sha256, b.manifest.archive_sha256);
    }

    #[cfg(unix)]
    mod symlink_tests {
        use super::*;
        use std::os::unix::fs::symlink;

        #[test]
        fn test_symlink_archived_as_link() {
            let dir = TempDir::new().unwrap();
            fs::write(dir.path().join("target.txt"), "target content").unwrap();
            symlink("target.txt", dir.path().join("link.txt")).unwrap();
            let out = TempDir::new().unwrap();

            let output = Archiver::new(dir.path().to_path_buf())
                .create(out.path())
                .unwrap();

            let record = output.manifest.find_file("link.txt").unwrap();
            assert!(record.is_link);
            assert_eq!(record.checksum_sha256, SYMLINK_SENTINEL);

            let file = File::open(&output.path).unwrap();
            let mut archive = tar::Archive::new(create_decoder(file, output.method));
            let link = archive
                .entries()
                .unwrap()
                .map(|e| e.unwrap())
                .find(|e| e.path().unwrap().to_string_lossy() == "link.txt")
                .unwrap();
            assert_eq!(link.header().entry_type(), EntryType::Symlink);
            assert_eq!(
                link.link_name().unwrap().unwrap().to_string_lossy(),
                "target.txt"
            );
        }

        #[test]
        fn test_dangling_symlink_kept() {
            let dir = TempDir::new().unwrap();
            symlink("nowhere", dir.path().join("dangling")).unwrap();
            let out = TempDir::new().unwrap();

            let output = Archiver::new(dir.path().to_path_buf())
                .create(out.path())
                .unwrap();

            assert!(output.manifest.find_file("dangling").unwrap().is_link);
        }
    }
}
