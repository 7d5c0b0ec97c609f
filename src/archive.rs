use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use thiserror::Error;
use zip::{ZipArchive, ZipWriter, result::ZipError, write::SimpleFileOptions};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Zip error in {}: {source}", path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: ZipError,
    },
    #[error("archive {} has no entry named {entry:?}", archive.display())]
    EntryNotFound { archive: PathBuf, entry: String },
    #[error("archive entry {0:?} points outside of the target directory")]
    UnsafeEntry(String),
}

impl ArchiveError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
        move |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn zip(path: &Path) -> impl FnOnce(ZipError) -> ArchiveError + '_ {
        move |source| ArchiveError::Zip {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Progress of an [`unpack`] call, reported once per archive entry.
#[derive(Debug, Clone, Copy)]
pub struct UnpackProgress {
    pub entries_done: usize,
    pub entries_total: usize,
}

impl UnpackProgress {
    pub fn fraction(&self) -> f32 {
        if self.entries_total == 0 {
            1.0
        } else {
            self.entries_done as f32 / self.entries_total as f32
        }
    }
}

/// Extracts every entry of `archive` below `target_dir`, keeping the relative
/// directory structure.
///
/// Existing files are overwritten. Nothing already written is removed when a
/// later entry fails. Returns the number of file bytes written.
pub fn unpack(
    archive: &Path,
    target_dir: &Path,
    mut on_progress: impl FnMut(UnpackProgress),
) -> Result<u64, ArchiveError> {
    fs::create_dir_all(target_dir).map_err(ArchiveError::io(target_dir))?;

    let file = File::open(archive).map_err(ArchiveError::io(archive))?;
    let mut zip = ZipArchive::new(BufReader::new(file)).map_err(ArchiveError::zip(archive))?;
    let entries_total = zip.len();
    let mut written = 0;

    for index in 0..entries_total {
        let mut entry = zip.by_index(index).map_err(ArchiveError::zip(archive))?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafeEntry(entry.name().to_string()))?;
        let out_path = target_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(ArchiveError::io(&out_path))?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(ArchiveError::io(parent))?;
            }
            let out = File::create(&out_path).map_err(ArchiveError::io(&out_path))?;
            let mut writer = BufWriter::new(out);
            written += io::copy(&mut entry, &mut writer).map_err(ArchiveError::io(&out_path))?;
            writer
                .into_inner()
                .map_err(|err| ArchiveError::io(&out_path)(err.into_error()))?;
        }

        log::trace!("unpacked {}", out_path.display());
        on_progress(UnpackProgress {
            entries_done: index + 1,
            entries_total,
        });
    }

    log::info!(
        "unpacked {} entries ({} bytes) into {}",
        entries_total,
        written,
        target_dir.display()
    );

    Ok(written)
}

/// A single archive entry extracted into its own temporary directory.
///
/// The directory is removed by [`ExtractedEntry::close`], or on drop.
#[derive(Debug)]
pub struct ExtractedEntry {
    dir: TempDir,
    path: PathBuf,
}

impl ExtractedEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the temporary directory and reports failures to do so.
    pub fn close(self) -> Result<(), ArchiveError> {
        let dir = self.dir.path().to_path_buf();
        self.dir.close().map_err(ArchiveError::io(&dir))
    }
}

/// Extracts the entry named exactly `entry_name` into a fresh temporary
/// directory.
pub fn extract_single_entry(
    archive: &Path,
    entry_name: &str,
) -> Result<ExtractedEntry, ArchiveError> {
    let file = File::open(archive).map_err(ArchiveError::io(archive))?;
    let mut zip = ZipArchive::new(BufReader::new(file)).map_err(ArchiveError::zip(archive))?;

    let mut entry = match zip.by_name(entry_name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => {
            return Err(ArchiveError::EntryNotFound {
                archive: archive.to_path_buf(),
                entry: entry_name.to_string(),
            });
        }
        Err(err) => return Err(ArchiveError::zip(archive)(err)),
    };
    let relative = entry
        .enclosed_name()
        .ok_or_else(|| ArchiveError::UnsafeEntry(entry_name.to_string()))?;
    let file_name = relative
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| ArchiveError::UnsafeEntry(entry_name.to_string()))?;

    let dir = tempfile::Builder::new()
        .prefix("frost_setup")
        .tempdir()
        .map_err(ArchiveError::io(&std::env::temp_dir()))?;
    let path = dir.path().join(file_name);
    let mut out = File::create(&path).map_err(ArchiveError::io(&path))?;
    io::copy(&mut entry, &mut out).map_err(ArchiveError::io(&path))?;

    Ok(ExtractedEntry { dir, path })
}

/// Recursively collect all files in a directory
fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

/// Zips every file below `source_dir` into `archive`, using forward slashes in
/// entry names. Returns the summed size of the packed files.
pub fn pack_directory(source_dir: &Path, archive: &Path) -> Result<u64, ArchiveError> {
    pack_directory_with(source_dir, archive, &[])
}

/// Like [`pack_directory`], plus generated entries. A generated entry
/// replaces a file of the same name in `source_dir`.
pub fn pack_directory_with(
    source_dir: &Path,
    archive: &Path,
    generated: &[(&str, &[u8])],
) -> Result<u64, ArchiveError> {
    let mut files = Vec::new();
    collect_files(source_dir, &mut files).map_err(ArchiveError::io(source_dir))?;
    files.sort();

    let out = File::create(archive).map_err(ArchiveError::io(archive))?;
    let mut zip = ZipWriter::new(BufWriter::new(out));
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(6i64));
    let mut unpacked_size = 0;

    for path in files {
        let zip_path = path
            .strip_prefix(source_dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        if generated.iter().any(|(name, _)| *name == zip_path) {
            log::debug!("{} replaced by a generated entry", path.display());
            continue;
        }

        zip.start_file(zip_path, options)
            .map_err(ArchiveError::zip(archive))?;
        let mut reader = BufReader::new(File::open(&path).map_err(ArchiveError::io(&path))?);
        unpacked_size += io::copy(&mut reader, &mut zip).map_err(ArchiveError::io(archive))?;
    }

    for (name, contents) in generated {
        zip.start_file(*name, options)
            .map_err(ArchiveError::zip(archive))?;
        zip.write_all(contents).map_err(ArchiveError::io(archive))?;
        unpacked_size += contents.len() as u64;
    }

    zip.finish()
        .map_err(ArchiveError::zip(archive))?
        .flush()
        .map_err(ArchiveError::io(archive))?;

    Ok(unpacked_size)
}
