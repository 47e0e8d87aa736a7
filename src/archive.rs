//! Archive codec for workspaces and results.
//!
//! Inbound workspaces may be zip, tar.gz or plain tar; the format is sniffed
//! from magic bytes. Outbound results are always zipped with sorted entries
//! and a fixed timestamp so identical directories yield identical bytes.

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use crate::error::{PublishError, WorkspaceError};

/// Supported inbound archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveFormat {
    /// Detect the format from leading bytes.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(b"PK\x03\x04") || data.starts_with(b"PK\x05\x06") {
            Some(Self::Zip)
        } else if data.starts_with(&[0x1f, 0x8b]) {
            Some(Self::TarGz)
        } else if data.len() > 262 && &data[257..262] == b"ustar" {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Upper bound on the total bytes a workspace archive may expand to (4 GiB).
pub const MAX_EXTRACTED_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Extract `data` into `dest`, returning the number of files written.
///
/// Blocking; call from `spawn_blocking`.
pub fn extract(data: &[u8], dest: &Path) -> Result<usize, WorkspaceError> {
    extract_with_limit(data, dest, MAX_EXTRACTED_BYTES)
}

/// Like [`extract`], failing once more than `limit` bytes would be written.
///
/// Sizes declared in archive headers are never trusted; entries are streamed
/// to disk and counted as they are written.
pub fn extract_with_limit(data: &[u8], dest: &Path, limit: u64) -> Result<usize, WorkspaceError> {
    match ArchiveFormat::detect(data) {
        Some(ArchiveFormat::Zip) => extract_zip(data, dest, limit),
        Some(ArchiveFormat::TarGz) => extract_tar(GzDecoder::new(data), dest, limit),
        Some(ArchiveFormat::Tar) => extract_tar(data, dest, limit),
        None => Err(WorkspaceError::Extract(
            "unsupported or corrupt archive (unknown format)".to_string(),
        )),
    }
}

fn too_large(limit: u64) -> WorkspaceError {
    WorkspaceError::Extract(format!("archive expands beyond the {limit} byte limit"))
}

fn extract_zip(data: &[u8], dest: &Path, limit: u64) -> Result<usize, WorkspaceError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| WorkspaceError::Extract(format!("failed to open zip: {e}")))?;

    let mut written = 0;
    let mut total: u64 = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| WorkspaceError::Extract(format!("failed to read zip entry: {e}")))?;

        let relative = entry.enclosed_name().ok_or_else(|| {
            WorkspaceError::Extract(format!("entry escapes workspace: {}", entry.name()))
        })?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let name = entry.name().to_string();
        let budget = limit.saturating_sub(total);
        let mut file = fs::File::create(&target)?;
        let copied = io::copy(&mut (&mut entry).take(budget.saturating_add(1)), &mut file)
            .map_err(|e| WorkspaceError::Extract(format!("corrupt zip entry {name}: {e}")))?;
        if copied > budget {
            return Err(too_large(limit));
        }
        total += copied;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))?;
        }

        written += 1;
    }

    Ok(written)
}

fn extract_tar<R: Read>(reader: R, dest: &Path, limit: u64) -> Result<usize, WorkspaceError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| WorkspaceError::Extract(format!("failed to read tar: {e}")))?;

    let mut written = 0;
    let mut total: u64 = 0;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| WorkspaceError::Extract(format!("corrupt tar entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| WorkspaceError::Extract(format!("invalid tar path: {e}")))?
            .into_owned();

        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(WorkspaceError::Extract(format!(
                "entry escapes workspace: {}",
                path.display()
            )));
        }

        // Entry data is read from the stream, so it can never exceed the header size.
        total = total.saturating_add(entry.size());
        if total > limit {
            return Err(too_large(limit));
        }

        let is_file = entry.header().entry_type().is_file();
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| WorkspaceError::Extract(format!("failed to unpack {}: {e}", path.display())))?;
        if !unpacked {
            return Err(WorkspaceError::Extract(format!(
                "entry escapes workspace: {}",
                path.display()
            )));
        }
        if is_file {
            written += 1;
        }
    }

    Ok(written)
}

/// Zip the contents of `dir` (not the directory itself).
///
/// Fails with `PublishError::Packaging` if the directory is missing or holds
/// no files.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>, PublishError> {
    if !dir.is_dir() {
        return Err(PublishError::Packaging(format!(
            "results directory {} does not exist",
            dir.display()
        )));
    }

    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let mut files = 0usize;

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| PublishError::Packaging(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| PublishError::Packaging(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            writer
                .add_directory(format!("{name}/"), options)
                .map_err(|e| PublishError::Packaging(e.to_string()))?;
        } else if entry.file_type().is_file() {
            let contents = fs::read(entry.path())
                .map_err(|e| PublishError::Packaging(format!("{}: {e}", entry.path().display())))?;
            writer
                .start_file(name, options)
                .map_err(|e| PublishError::Packaging(e.to_string()))?;
            writer
                .write_all(&contents)
                .map_err(|e| PublishError::Packaging(e.to_string()))?;
            files += 1;
        }
    }

    if files == 0 {
        return Err(PublishError::Packaging(format!(
            "results directory {} is empty",
            dir.display()
        )));
    }

    let cursor = writer
        .finish()
        .map_err(|e| PublishError::Packaging(e.to_string()))?;
    Ok(cursor.into_inner())
}
