use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use tar::EntryType;

use crate::{is_within, normalize_entry_path, DeckutilsError, DeckutilsResult};

use super::CompressionFormat;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Progress callbacks are only fired when the fraction moved by at least this much.
const PROGRESS_STEP: f32 = 0.01;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What an extraction wrote to disk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Regular files written.
    pub files: usize,

    /// Directories created.
    pub directories: usize,

    /// Symbolic and hard links created.
    pub links: usize,

    /// Entry names that were skipped, either because they escape the target directory or
    /// because their type cannot be represented on this platform.
    pub skipped: Vec<String>,
}

/// Counts the compressed bytes pulled through the decoder.
struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

/// Every path created during one extraction, so a failed run can be rolled back.
#[derive(Default)]
struct Created {
    paths: Vec<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Extracts a compressed archive on disk into `target`.
///
/// The format is determined from the file name. Extraction runs on the blocking pool.
///
/// ## Arguments
///
/// * `archive` - Path to the `.txz`/`.tzst` archive
/// * `target` - Directory to unpack into, created if missing
/// * `progress` - Called with a fraction in `[0, 1]` as compressed bytes are consumed
///
/// ## Errors
///
/// Fails immediately if the archive does not exist. A corrupt stream fails the extraction
/// and everything it had written is removed again.
pub async fn extract_file(
    archive: impl AsRef<Path>,
    target: impl AsRef<Path>,
    progress: impl FnMut(f32) + Send + 'static,
) -> DeckutilsResult<ExtractSummary> {
    let archive = archive.as_ref().to_path_buf();
    let format = CompressionFormat::from_path(&archive)?;

    let file = match File::open(&archive) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(DeckutilsError::Extraction {
                archive: archive.display().to_string(),
                reason: "archive does not exist".to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    let total = file.metadata()?.len();

    extract_stream(
        archive.display().to_string(),
        file,
        total,
        format,
        target,
        progress,
    )
    .await
}

/// Extracts a compressed archive read from an arbitrary byte stream into `target`.
///
/// `total` is the compressed length and is only used for progress reporting; pass `0` when
/// it is unknown and progress will jump straight to completion.
pub async fn extract_stream<R>(
    name: impl Into<String>,
    reader: R,
    total: u64,
    format: CompressionFormat,
    target: impl AsRef<Path>,
    mut progress: impl FnMut(f32) + Send + 'static,
) -> DeckutilsResult<ExtractSummary>
where
    R: Read + Send + 'static,
{
    let name = name.into();
    let target = target.as_ref().to_path_buf();

    tokio::task::spawn_blocking(move || {
        extract_blocking(&name, reader, total, format, &target, &mut progress)
    })
    .await
    .map_err(DeckutilsError::custom)?
}

/// Synchronous extraction core shared by the async entry points.
pub fn extract_blocking<R: Read>(
    name: &str,
    reader: R,
    total: u64,
    format: CompressionFormat,
    target: &Path,
    progress: &mut dyn FnMut(f32),
) -> DeckutilsResult<ExtractSummary> {
    let mut created = Created::default();
    let target_existed = target.exists();
    fs::create_dir_all(target)?;
    if !target_existed {
        created.paths.push(target.to_path_buf());
    }

    tracing::info!(archive = %name, format = %format, target = %target.display(), "extracting archive");

    match unpack_entries(reader, total, format, target, progress, &mut created) {
        Ok(summary) => {
            progress(1.0);
            if !summary.skipped.is_empty() {
                tracing::warn!(
                    archive = %name,
                    skipped = summary.skipped.len(),
                    "some archive entries were skipped"
                );
            }
            tracing::info!(
                archive = %name,
                files = summary.files,
                directories = summary.directories,
                links = summary.links,
                "archive extracted"
            );
            Ok(summary)
        }
        Err(e) => {
            tracing::error!(archive = %name, error = %e, "extraction failed, removing partial output");
            created.rollback();
            Err(DeckutilsError::Extraction {
                archive: name.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

fn unpack_entries<R: Read>(
    reader: R,
    total: u64,
    format: CompressionFormat,
    target: &Path,
    progress: &mut dyn FnMut(f32),
    created: &mut Created,
) -> io::Result<ExtractSummary> {
    let consumed = Arc::new(AtomicU64::new(0));
    let counting = CountingReader {
        inner: reader,
        consumed: Arc::clone(&consumed),
    };

    let mut archive = tar::Archive::new(format.decoder(counting)?);
    let mut summary = ExtractSummary::default();
    let mut last_reported = 0.0f32;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_name = entry.path()?.to_string_lossy().into_owned();

        let relative = match normalize_entry_path(&raw_name) {
            Ok(relative) => relative,
            Err(e) => {
                tracing::warn!(entry = %raw_name, error = %e, "skipping archive entry");
                summary.skipped.push(raw_name);
                continue;
            }
        };

        let dest = target.join(relative.as_str());
        if !is_within(target, &dest)? {
            tracing::warn!(entry = %raw_name, "skipping archive entry that resolves outside the target");
            summary.skipped.push(raw_name);
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Directory => {
                created.create_dir_all(&dest)?;
                summary.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = dest.parent() {
                    created.create_dir_all(parent)?;
                }
                remove_stale_link(&dest)?;

                let mut file = File::create(&dest)?;
                created.paths.push(dest.clone());
                io::copy(&mut entry, &mut file)?;

                let mode = entry.header().mode().unwrap_or(0o644);
                set_mode(&dest, mode)?;
                summary.files += 1;
            }
            EntryType::Symlink => {
                let Some(link_target) = entry.link_name()? else {
                    summary.skipped.push(raw_name);
                    continue;
                };

                #[cfg(unix)]
                {
                    if let Some(parent) = dest.parent() {
                        created.create_dir_all(parent)?;
                    }
                    remove_stale_link(&dest)?;
                    std::os::unix::fs::symlink(link_target.as_ref(), &dest)?;
                    created.paths.push(dest.clone());
                    summary.links += 1;
                }

                #[cfg(not(unix))]
                {
                    let _ = link_target;
                    tracing::debug!(entry = %raw_name, "symbolic links are not supported here");
                    summary.skipped.push(raw_name);
                }
            }
            EntryType::Link => {
                let Some(link_target) = entry.link_name()? else {
                    summary.skipped.push(raw_name);
                    continue;
                };

                let source = match normalize_entry_path(&link_target.to_string_lossy()) {
                    Ok(source) => target.join(source.as_str()),
                    Err(_) => {
                        summary.skipped.push(raw_name);
                        continue;
                    }
                };

                if !source.exists() || !is_within(target, &source)? {
                    summary.skipped.push(raw_name);
                    continue;
                }

                if let Some(parent) = dest.parent() {
                    created.create_dir_all(parent)?;
                }
                remove_stale_link(&dest)?;
                fs::hard_link(&source, &dest)?;
                created.paths.push(dest.clone());
                summary.links += 1;
            }
            other => {
                tracing::debug!(entry = %raw_name, kind = ?other, "ignoring archive entry type");
                summary.skipped.push(raw_name);
            }
        }

        if total > 0 {
            let fraction = (consumed.load(Ordering::Relaxed) as f32 / total as f32).min(1.0);
            if fraction - last_reported >= PROGRESS_STEP {
                last_reported = fraction;
                progress(fraction);
            }
        }
    }

    Ok(summary)
}

/// Removes a symlink sitting where a new entry will be written, so the write cannot be
/// redirected through it.
fn remove_stale_link(dest: &Path) -> io::Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(metadata) if metadata.file_type().is_symlink() || metadata.is_file() => {
            fs::remove_file(dest)
        }
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, stored_mode: u32) -> io::Result<()> {
    let mode = if stored_mode & 0o111 != 0 { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _stored_mode: u32) -> io::Result<()> {
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Created {
    /// Creates `dir` and its missing ancestors, remembering each one that did not exist.
    fn create_dir_all(&mut self, dir: &Path) -> io::Result<()> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(path) = current {
            if path.exists() {
                break;
            }
            missing.push(path.to_path_buf());
            current = path.parent();
        }

        fs::create_dir_all(dir)?;
        self.paths.extend(missing.into_iter().rev());
        Ok(())
    }

    /// Removes everything created so far, newest first.
    fn rollback(self) {
        for path in self.paths.into_iter().rev() {
            let result = match fs::symlink_metadata(&path) {
                Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path),
                Ok(_) => fs::remove_file(&path),
                Err(_) => continue,
            };

            if let Err(e) = result {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output");
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
