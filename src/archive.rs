// envbackup/src/archive.rs
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::{Builder, EntryType};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{AppError, Result};

/// Entry name of the database dump inside every backup archive.
pub const DUMP_ENTRY_NAME: &str = "db_dump.sql";
/// Directory prefix for file-tree entries inside every backup archive.
pub const FILES_ENTRY_PREFIX: &str = "files";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

fn archive_err(action: &str, path: &Path, err: impl std::fmt::Display) -> AppError {
    AppError::Archive(format!("{} {}: {}", action, path.display(), err))
}

/// Creates a GZipped TAR archive holding the dump and every regular file under `files_root`.
///
/// The dump is stored as [`DUMP_ENTRY_NAME`]. Files are stored under
/// [`FILES_ENTRY_PREFIX`] with their path relative to `files_root`, always
/// using `/` as separator. Directories are not stored as entries.
pub fn create_backup_archive(
    archive_path: &Path,
    dump_path: &Path,
    files_root: &Path,
) -> Result<ArchiveSummary> {
    if !dump_path.is_file() {
        return Err(AppError::Archive(format!(
            "Database dump is not a file: {}",
            dump_path.display()
        )));
    }
    if !files_root.is_dir() {
        return Err(AppError::Archive(format!(
            "Source for archival is not a directory: {}",
            files_root.display()
        )));
    }
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| archive_err("Failed to create parent directory for", parent, e))?;
    }

    info!(archive = %archive_path.display(), "Creating backup archive");

    let archive_file = File::create(archive_path)
        .map_err(|e| archive_err("Failed to create archive file", archive_path, e))?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);
    let mut summary = ArchiveSummary::default();

    tar_builder
        .append_path_with_name(dump_path, DUMP_ENTRY_NAME)
        .map_err(|e| archive_err("Failed to add database dump", dump_path, e))?;
    summary.files += 1;
    summary.bytes += fs::metadata(dump_path)?.len();

    for entry in WalkDir::new(files_root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            if entry.file_type().is_symlink() {
                debug!(path = %entry.path().display(), "Skipping symlink");
            }
            continue;
        }
        let relative = entry.path().strip_prefix(files_root).map_err(|_| {
            AppError::Archive(format!(
                "Failed to strip prefix {} from {}",
                files_root.display(),
                entry.path().display()
            ))
        })?;
        let name = entry_name_for(relative)?;

        tar_builder
            .append_path_with_name(entry.path(), &name)
            .map_err(|e| archive_err("Failed to append file", entry.path(), e))?;
        summary.files += 1;
        summary.bytes += entry.metadata()?.len();
    }

    let encoder = tar_builder
        .into_inner()
        .map_err(|e| archive_err("Failed to finish tar stream for", archive_path, e))?;
    encoder
        .finish()
        .map_err(|e| archive_err("Failed to finish Gzip encoding for", archive_path, e))?;

    info!(
        archive = %archive_path.display(),
        entries = summary.files,
        bytes = summary.bytes,
        "✓ Backup archive created"
    );
    Ok(summary)
}

/// `files/<a>/<b>` from a relative path, with `/` separators on every platform.
fn entry_name_for(relative: &Path) -> Result<String> {
    let mut name = String::from(FILES_ENTRY_PREFIX);
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    AppError::Archive(format!(
                        "File name is not valid UTF-8: {}",
                        relative.display()
                    ))
                })?;
                name.push('/');
                name.push_str(part);
            }
            _ => {
                return Err(AppError::Archive(format!(
                    "Unexpected path component in {}",
                    relative.display()
                )));
            }
        }
    }
    Ok(name)
}

/// Extracts a backup archive into `dest_root`.
///
/// Entries that are absolute or climb out of `dest_root` abort extraction
/// with [`AppError::UnsafeArchiveEntry`]. Output written before the failing
/// entry is left on disk.
pub fn extract_backup_archive(archive_path: &Path, dest_root: &Path) -> Result<ExtractSummary> {
    if !archive_path.is_file() {
        return Err(AppError::Archive(format!(
            "Archive for extraction is not a file: {}",
            archive_path.display()
        )));
    }
    fs::create_dir_all(dest_root)
        .map_err(|e| archive_err("Failed to create extraction directory", dest_root, e))?;

    info!(
        archive = %archive_path.display(),
        dest = %dest_root.display(),
        "Extracting backup archive"
    );

    let archive_file = File::open(archive_path)
        .map_err(|e| archive_err("Failed to open archive file", archive_path, e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(archive_file));
    let mut summary = ExtractSummary::default();

    let entries = archive
        .entries()
        .map_err(|e| archive_err("Failed to read entries of", archive_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| archive_err("Failed to read tar header in", archive_path, e))?;
        let raw_path = entry
            .path()
            .map_err(|e| archive_err("Failed to decode entry path in", archive_path, e))?
            .into_owned();

        let Some(relative) = contained_relative_path(&raw_path)? else {
            continue;
        };
        let target = dest_root.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)
                    .map_err(|e| archive_err("Failed to create directory", &target, e))?;
                summary.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| archive_err("Failed to create parent directory", parent, e))?;
                }
                let mut out = File::create(&target)
                    .map_err(|e| archive_err("Failed to create file", &target, e))?;
                let written = io::copy(&mut entry, &mut out)
                    .map_err(|e| archive_err("Failed to extract file", &target, e))?;
                summary.files += 1;
                summary.bytes += written;
            }
            other => {
                warn!(entry = %raw_path.display(), kind = ?other, "Skipping unsupported archive entry");
            }
        }
    }

    info!(
        files = summary.files,
        directories = summary.directories,
        bytes = summary.bytes,
        "✓ Backup archive extracted"
    );
    Ok(summary)
}

/// Normalizes an entry path to one that stays inside the extraction root.
///
/// `Ok(None)` means the entry names the root itself (`./`).
fn contained_relative_path(raw: &Path) -> Result<Option<PathBuf>> {
    let mut relative = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::UnsafeArchiveEntry(raw.display().to_string()));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap();
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                (key, fs::read(e.path()).unwrap())
            })
            .collect()
    }

    fn entry_names(archive_path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive_path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    /// Writes a tar.gz whose entry names bypass the builder's path checks.
    fn write_raw_archive(archive_path: &Path, entries: &[(&str, &[u8])]) {
        let enc = GzEncoder::new(File::create(archive_path).unwrap(), Compression::default());
        let mut builder = Builder::new(enc);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            let bytes = name.as_bytes();
            header.as_gnu_mut().unwrap().name[..bytes.len()].copy_from_slice(bytes);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(EntryType::Regular);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn round_trip_preserves_dump_and_tree() {
        let src = TempDir::new().unwrap();
        let dump = src.path().join("db_dump.sql");
        write(&dump, b"CREATE TABLE test (id INT);\n");
        let files = src.path().join("files");
        write(&files.join("index.html"), b"<html></html>");
        write(&files.join("uploads/2024/photo.jpg"), &[0xff, 0xd8, 0x00, 0x10]);
        write(&files.join("uploads/empty.txt"), b"");
        fs::create_dir_all(files.join("cache/empty-dir")).unwrap();

        let out = TempDir::new().unwrap();
        let archive_path = out.path().join("backup_archive.tar.gz");
        let created = create_backup_archive(&archive_path, &dump, &files).unwrap();
        assert_eq!(created.files, 4);

        let dest = TempDir::new().unwrap();
        let extracted = extract_backup_archive(&archive_path, dest.path()).unwrap();
        assert_eq!(extracted.files, 4);
        assert_eq!(extracted.directories, 0);

        assert_eq!(
            fs::read(dest.path().join(DUMP_ENTRY_NAME)).unwrap(),
            fs::read(&dump).unwrap()
        );
        assert_eq!(read_tree(&dest.path().join("files")), read_tree(&files));
    }

    #[test]
    fn dump_comes_first_and_directories_are_not_stored() {
        let src = TempDir::new().unwrap();
        let dump = src.path().join("dump.sql");
        write(&dump, b"--");
        let files = src.path().join("files");
        write(&files.join("b/two.txt"), b"2");
        write(&files.join("a.txt"), b"1");

        let archive_path = src.path().join("out.tar.gz");
        create_backup_archive(&archive_path, &dump, &files).unwrap();

        assert_eq!(
            entry_names(&archive_path),
            vec!["db_dump.sql", "files/a.txt", "files/b/two.txt"]
        );
    }

    #[test]
    fn empty_file_tree_yields_dump_only() {
        let src = TempDir::new().unwrap();
        let dump = src.path().join("db_dump.sql");
        write(&dump, b"SELECT 1;");
        let files = src.path().join("files");
        fs::create_dir_all(&files).unwrap();

        let archive_path = src.path().join("out.tar.gz");
        create_backup_archive(&archive_path, &dump, &files).unwrap();
        assert_eq!(entry_names(&archive_path), vec!["db_dump.sql"]);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_file_name_is_rejected() {
        use std::os::unix::ffi::OsStrExt;

        let src = TempDir::new().unwrap();
        let dump = src.path().join("db_dump.sql");
        write(&dump, b"--");
        let files = src.path().join("files");
        fs::create_dir_all(&files).unwrap();
        fs::write(files.join(std::ffi::OsStr::from_bytes(b"bad\xff.txt")), b"x").unwrap();

        let err = create_backup_archive(&src.path().join("out.tar.gz"), &dump, &files).unwrap_err();
        assert!(matches!(err, AppError::Archive(ref msg) if msg.contains("UTF-8")), "{err:?}");
    }

    #[test]
    fn rejects_path_traversal_entry() {
        let work = TempDir::new().unwrap();
        let archive_path = work.path().join("evil.tar.gz");
        write_raw_archive(
            &archive_path,
            &[("db_dump.sql", &b"ok"[..]), ("../../etc/passed", &b"owned"[..])],
        );

        let dest = work.path().join("a/b/dest");
        let err = extract_backup_archive(&archive_path, &dest).unwrap_err();
        assert!(matches!(err, AppError::UnsafeArchiveEntry(ref name) if name == "../../etc/passed"));
        assert!(!work.path().join("a/etc/passed").exists());
        assert!(!work.path().join("etc/passed").exists());
        // entries before the bad one were already written
        assert!(dest.join("db_dump.sql").exists());
    }

    #[test]
    fn rejects_absolute_entry() {
        let work = TempDir::new().unwrap();
        let archive_path = work.path().join("abs.tar.gz");
        write_raw_archive(&archive_path, &[("/tmp/envbackup-abs-entry", &b"x"[..])]);

        let err = extract_backup_archive(&archive_path, &work.path().join("dest")).unwrap_err();
        assert!(matches!(err, AppError::UnsafeArchiveEntry(_)));
    }

    #[test]
    fn creates_explicit_directory_entries() {
        let work = TempDir::new().unwrap();
        let archive_path = work.path().join("dirs.tar.gz");
        let enc = GzEncoder::new(File::create(&archive_path).unwrap(), Compression::default());
        let mut builder = Builder::new(enc);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        builder
            .append_data(&mut header, "files/empty/", io::empty())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = work.path().join("dest");
        let summary = extract_backup_archive(&archive_path, &dest).unwrap();
        assert_eq!(summary.directories, 1);
        assert!(dest.join("files/empty").is_dir());
    }

    #[test]
    fn garbage_input_is_an_archive_error() {
        let work = TempDir::new().unwrap();
        let archive_path = work.path().join("junk.tar.gz");
        fs::write(&archive_path, b"definitely not gzip").unwrap();
        let err = extract_backup_archive(&archive_path, &work.path().join("dest")).unwrap_err();
        assert!(matches!(err, AppError::Archive(_)));
    }

    #[test]
    fn extracted_bytes_match_exactly() {
        let src = TempDir::new().unwrap();
        let dump = src.path().join("db_dump.sql");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        write(&dump, &payload);
        let files = src.path().join("files");
        fs::create_dir_all(&files).unwrap();

        let archive_path = src.path().join("big.tar.gz");
        create_backup_archive(&archive_path, &dump, &files).unwrap();
        let dest = TempDir::new().unwrap();
        extract_backup_archive(&archive_path, dest.path()).unwrap();

        let mut restored = Vec::new();
        File::open(dest.path().join(DUMP_ENTRY_NAME))
            .unwrap()
            .read_to_end(&mut restored)
            .unwrap();
        assert_eq!(restored, payload);
    }
}
