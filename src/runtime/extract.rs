//! Unpacking and post-extraction verification

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path};

use tar::Archive;
use tracing::{debug, info, warn};

use shellpack_protocol::header::ManifestLine;
use shellpack_protocol::CompressionMethod;

use crate::checksum;
use crate::compression::create_decoder;

/// Result of unpacking an archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unpacked {
    /// Method that decoded the archive
    pub method: Option<CompressionMethod>,
    /// Entries written
    pub entries: usize,
    /// Entries refused because they would land outside the target
    pub skipped: Vec<String>,
}

/// Result of checking extracted files against the manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    pub checked: usize,
    /// Paths whose checksum differs
    pub mismatched: Vec<String>,
    /// Paths listed in the manifest but absent on disk
    pub missing: Vec<String>,
}

impl Verification {
    pub fn is_ok(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// Methods to try: the declared one first, then the probe order
pub fn candidate_methods(declared: Option<CompressionMethod>) -> Vec<CompressionMethod> {
    let mut methods: Vec<CompressionMethod> = declared.into_iter().collect();
    for method in CompressionMethod::PROBE_ORDER {
        if !methods.contains(&method) {
            methods.push(method);
        }
    }
    methods
}

/// Whether the archive reads as a well-formed tar stream with `method`
fn readable_as(archive: &Path, method: CompressionMethod) -> bool {
    let check = || -> io::Result<usize> {
        let file = BufReader::new(File::open(archive)?);
        let mut tar = Archive::new(create_decoder(file, method));
        let mut count = 0;
        for entry in tar.entries()? {
            let mut entry = entry?;
            io::copy(&mut entry, &mut io::sink())?;
            count += 1;
        }
        Ok(count)
    };
    matches!(check(), Ok(n) if n > 0)
}

/// Archive entry path that stays inside the target when joined
fn is_safe_entry_path(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Whether any existing parent of `rel` under `dest` resolves outside `dest`
fn escapes_through_symlink(dest: &Path, rel: &Path) -> bool {
    let Ok(root) = dest.canonicalize() else {
        return true;
    };
    let mut current = dest.to_path_buf();
    let parents: Vec<_> = rel.components().collect();
    for component in parents.iter().take(parents.len().saturating_sub(1)) {
        current.push(component);
        match current.canonicalize() {
            Ok(resolved) if !resolved.starts_with(&root) => return true,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    false
}

/// Unpack `archive` into `dest`, trying `declared` first and then probing.
///
/// Entries with absolute paths, `..` components or a symlinked parent
/// leading out of `dest` are skipped with a warning.
pub fn unpack(
    archive: &Path,
    dest: &Path,
    declared: Option<CompressionMethod>,
) -> Result<Unpacked, String> {
    let method = candidate_methods(declared)
        .into_iter()
        .find(|m| {
            let ok = readable_as(archive, *m);
            if !ok && Some(*m) == declared {
                warn!("Archive does not decode as {}, probing other formats", m);
            }
            ok
        })
        .ok_or_else(|| "archive does not decode with any supported method".to_string())?;
    debug!("Extracting as {}", method);

    fs::create_dir_all(dest).map_err(|e| format!("cannot create {}: {}", dest.display(), e))?;
    unpack_with(archive, dest, method).map_err(|e| format!("extraction failed: {}", e))
}

fn unpack_with(archive: &Path, dest: &Path, method: CompressionMethod) -> io::Result<Unpacked> {
    let file = BufReader::new(File::open(archive)?);
    let mut tar = Archive::new(create_decoder(file, method));
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);

    let mut result = Unpacked {
        method: Some(method),
        ..Unpacked::default()
    };

    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let shown = path.display().to_string();

        if !is_safe_entry_path(&path) || escapes_through_symlink(dest, &path) {
            warn!("Skipping unsafe archive entry {}", shown);
            result.skipped.push(shown);
            continue;
        }
        if entry.unpack_in(dest)? {
            result.entries += 1;
        } else {
            warn!("Skipping unsafe archive entry {}", shown);
            result.skipped.push(shown);
        }
    }

    info!("Extracted {} entries to {}", result.entries, dest.display());
    Ok(result)
}

/// Recompute checksums of extracted regular files.
///
/// Sentinel entries (empty files, symlinks) are not hashed. A file missing
/// on disk is reported separately from a mismatch.
pub fn verify_manifest(dir: &Path, manifest: &[ManifestLine]) -> io::Result<Verification> {
    let mut result = Verification::default();
    for line in manifest.iter().filter(|l| l.is_hashed()) {
        let path = dir.join(&line.path);
        let metadata = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Missing after extraction: {}", line.path);
                result.missing.push(line.path.clone());
                continue;
            }
            Err(e) => return Err(e),
        };
        if !metadata.is_file() {
            warn!("Not a regular file after extraction: {}", line.path);
            result.mismatched.push(line.path.clone());
            continue;
        }
        let actual = checksum::sha256_file(&path)?;
        if actual != line.checksum {
            warn!("Checksum mismatch: {}", line.path);
            result.mismatched.push(line.path.clone());
        }
        result.checked += 1;
    }
    debug!(
        "Verified {} files, {} missing, {} mismatched",
        result.checked,
        result.missing.len(),
        result.mismatched.len()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archiver;
    use tempfile::TempDir;

    fn content() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/run.sh"), "#!/bin/sh\necho ok\n").unwrap();
        fs::write(dir.path().join("data.txt"), "payload").unwrap();
        dir
    }

    #[test]
    fn test_candidates_put_declared_first() {
        let methods = candidate_methods(Some(CompressionMethod::Xz));
        assert_eq!(methods[0], CompressionMethod::Xz);
        assert_eq!(methods.len(), 4);
        assert_eq!(candidate_methods(None), CompressionMethod::PROBE_ORDER.to_vec());
    }

    #[test]
    fn test_unpack_probes_when_declared_is_wrong() {
        let src = content();
        let work = TempDir::new().unwrap();
        let out = Archiver::new(src.path().to_path_buf())
            .with_compression(CompressionMethod::Xz, 6)
            .create(work.path())
            .unwrap();

        let dest = work.path().join("dest");
        let unpacked = unpack(&out.path, &dest, Some(CompressionMethod::Gzip)).unwrap();
        assert_eq!(unpacked.method, Some(CompressionMethod::Xz));
        assert_eq!(fs::read_to_string(dest.join("data.txt")).unwrap(), "payload");

        let verification = verify_manifest(&dest, &out.manifest.header_lines()).unwrap();
        assert!(verification.is_ok());
        assert_eq!(verification.checked, 2);
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let work = TempDir::new().unwrap();
        let junk = work.path().join("junk");
        fs::write(&junk, b"definitely not a tar archive").unwrap();
        assert!(unpack(&junk, &work.path().join("d"), None).is_err());
    }

    #[test]
    fn test_unsafe_paths() {
        assert!(is_safe_entry_path(Path::new("a/b.txt")));
        assert!(is_safe_entry_path(Path::new("./a")));
        assert!(!is_safe_entry_path(Path::new("../evil")));
        assert!(!is_safe_entry_path(Path::new("a/../../evil")));
        assert!(!is_safe_entry_path(Path::new("/etc/passwd")));
    }

    #[test]
    fn test_unpack_skips_entries_leaving_the_target() {
        let work = TempDir::new().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in [("ok.txt", &b"fine"[..]), ("../evil.txt", &b"nope"[..])] {
            let mut header = tar::Header::new_old();
            header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, data).unwrap();
        }
        let archive = work.path().join("payload.tar");
        fs::write(&archive, builder.into_inner().unwrap()).unwrap();

        let dest = work.path().join("dest");
        let unpacked = unpack(&archive, &dest, Some(CompressionMethod::Store)).unwrap();
        assert_eq!(unpacked.entries, 1);
        assert_eq!(unpacked.skipped, vec!["../evil.txt"]);
        assert!(dest.join("ok.txt").is_file());
        assert!(!work.path().join("evil.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_parent_escape_detected() {
        let outside = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dest.path().join("link")).unwrap();
        assert!(escapes_through_symlink(dest.path(), Path::new("link/file")));
        assert!(!escapes_through_symlink(dest.path(), Path::new("inner/file")));
    }

    #[test]
    fn test_verify_reports_missing_and_mismatch() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("changed.txt"), "tampered").unwrap();
        let manifest = vec![
            ManifestLine::new(checksum::sha256_bytes(b"original"), "changed.txt"),
            ManifestLine::new(checksum::sha256_bytes(b"x"), "gone.txt"),
            ManifestLine::new("empty", "empty.txt"),
        ];
        let verification = verify_manifest(dir.path(), &manifest).unwrap();
        assert_eq!(verification.mismatched, vec!["changed.txt"]);
        assert_eq!(verification.missing, vec!["gone.txt"]);
        assert!(!verification.is_ok());
    }
}
