//! Archive codec for `.ipa` app packages and developer disk archives.
//!
//! Extraction preserves directory structure and POSIX permission bits and
//! tolerates metadata differences between the archive and the host
//! filesystem: `__MACOSX` resource entries are skipped and colons are mapped
//! to a `__colon__` token.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{ArchiveError, SignError};

const READ_BUFFER_SIZE: usize = 8192;
const RESERVED_METADATA_PREFIX: &str = "__MACOSX";
const COLON_TOKEN: &str = "__colon__";

/// Extracts `archive_path` into `output_dir`.
///
/// A failure mid-way leaves a partially populated output directory; callers
/// extract into a fresh temporary directory when they need isolation.
pub fn extract(archive_path: &Path, output_dir: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive_path).map_err(|_| ArchiveError::NoSuchFile)?;
    let mut archive = ZipArchive::new(file).map_err(|_| ArchiveError::CorruptFile)?;

    let mut buffer = [0u8; READ_BUFFER_SIZE];

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|_| ArchiveError::Unknown)?;
        let name = entry.name().to_string();

        if name.starts_with(RESERVED_METADATA_PREFIX) {
            debug!("Skipping reserved metadata entry {name}");
            continue;
        }

        let is_directory = name.ends_with('/');
        let relative = sanitized_path(&name)?;
        let destination = output_dir.join(&relative);

        if is_directory {
            fs::create_dir_all(&destination).map_err(|_| ArchiveError::UnknownWrite)?;
            continue;
        }

        if let Some(parent) = destination.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|_| ArchiveError::UnknownWrite)?;
            }
        }

        let mut output = File::create(&destination).map_err(|_| ArchiveError::UnknownWrite)?;
        loop {
            let count = entry
                .read(&mut buffer)
                .map_err(|_| ArchiveError::Unknown)?;
            if count == 0 {
                break;
            }
            output
                .write_all(&buffer[..count])
                .map_err(|_| ArchiveError::UnknownWrite)?;
        }

        // Permission bits live in the upper 16 bits of the entry's external
        // attributes, POSIX mode_t layout.
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(mode & 0o777);
            fs::set_permissions(&destination, permissions)
                .map_err(|_| ArchiveError::UnknownWrite)?;
        }
    }

    Ok(())
}

/// Translates an archive-internal name into a host-relative path.
///
/// Forward slashes become the host separator and colons become the
/// `__colon__` token. Absolute or parent-escaping entries are rejected.
fn sanitized_path(name: &str) -> Result<PathBuf, ArchiveError> {
    let mut path = PathBuf::new();
    for component in name.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(ArchiveError::Unknown),
            component => path.push(component.replace(':', COLON_TOKEN)),
        }
    }
    Ok(path)
}

/// Locates the `.app` bundle under `extracted_root/Payload/`.
///
/// The suffix match is case-insensitive; the first matching entry in
/// directory iteration order wins.
pub fn locate_app_bundle(extracted_root: &Path) -> Result<PathBuf, SignError> {
    let payload = extracted_root.join("Payload");
    let entries = fs::read_dir(&payload).map_err(|_| SignError::MissingAppBundle)?;

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let lowered = file_name.to_string_lossy().to_lowercase();
        if lowered.ends_with(".app") {
            return Ok(payload.join(file_name));
        }
    }

    Err(SignError::MissingAppBundle)
}

/// Packs the app bundle at `bundle_path` into `<parent>/<stem>.ipa`.
///
/// An existing archive at the target path is replaced, not appended to. The
/// archive roots every entry at `Payload/<bundleName>/`.
pub fn create_app_archive(bundle_path: &Path) -> Result<PathBuf, ArchiveError> {
    let bundle_name = bundle_path
        .file_name()
        .ok_or(ArchiveError::UnknownWrite)?
        .to_string_lossy()
        .to_string();
    let stem = bundle_path
        .file_stem()
        .ok_or(ArchiveError::UnknownWrite)?
        .to_string_lossy()
        .to_string();

    let parent = bundle_path.parent().unwrap_or_else(|| Path::new("."));
    let archive_path = parent.join(format!("{stem}.ipa"));

    if archive_path.exists() {
        fs::remove_file(&archive_path).map_err(|_| ArchiveError::UnknownWrite)?;
    }

    let file = File::create(&archive_path).map_err(|_| ArchiveError::UnknownWrite)?;
    let mut writer = ZipWriter::new(file);

    let prefix = PathBuf::from("Payload").join(&bundle_name);
    write_directory_contents(&mut writer, bundle_path, &prefix)?;

    writer.finish().map_err(|_| ArchiveError::UnknownWrite)?;

    Ok(archive_path)
}

fn write_directory_contents(
    writer: &mut ZipWriter<File>,
    directory: &Path,
    prefix: &Path,
) -> Result<(), ArchiveError> {
    let entries = fs::read_dir(directory).map_err(|_| ArchiveError::UnknownWrite)?;

    for entry in entries {
        let entry = entry.map_err(|_| ArchiveError::UnknownWrite)?;
        let path = entry.path();
        let relative = prefix.join(entry.file_name());
        let name = archive_entry_name(&relative);

        if path.is_dir() {
            writer
                .add_directory(format!("{name}/"), SimpleFileOptions::default())
                .map_err(|_| ArchiveError::UnknownWrite)?;
            write_directory_contents(writer, &path, &relative)?;
        } else {
            let permissions = file_permissions(&path);
            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(0o100000 | permissions);

            writer
                .start_file(name, options)
                .map_err(|_| ArchiveError::UnknownWrite)?;

            // Whole-file read is acceptable for app bundle sizes.
            let bytes = fs::read(&path).map_err(|_| ArchiveError::UnknownWrite)?;
            if !bytes.is_empty() {
                writer
                    .write_all(&bytes)
                    .map_err(|_| ArchiveError::UnknownWrite)?;
            }
        }
    }

    Ok(())
}

/// Archive entry names are forward-slash separated with no leading separator.
fn archive_entry_name(relative: &Path) -> String {
    let name = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    name.trim_start_matches('/').to_string()
}

#[cfg(unix)]
fn file_permissions(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    match fs::metadata(path) {
        Ok(metadata) => metadata.permissions().mode() & 0o777,
        Err(e) => {
            warn!("Failed to read permissions for {}: {e}", path.display());
            0o644
        }
    }
}

#[cfg(not(unix))]
fn file_permissions(_path: &Path) -> u32 {
    0o644
}
