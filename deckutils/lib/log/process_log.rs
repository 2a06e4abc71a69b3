use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};

use crate::{DeckutilsResult, LOG_SUFFIX, ROTATED_LOG_SUFFIX};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default size a process log may reach before it is rotated out.
pub const DEFAULT_LOG_MAX_SIZE: u64 = 8 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// The child's standard output.
    Stdout,

    /// The child's standard error.
    Stderr,
}

/// An append-only log of one child process's output.
///
/// A previous log with the same name is moved to `<name>.log.old` when the log is opened, and
/// again whenever the current file grows past its size limit. At most one rotated file is kept.
#[derive(Debug)]
pub struct ProcessLog {
    file: File,
    path: PathBuf,
    max_size: u64,
    written: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessLog {
    /// Opens `<dir>/<name>.log` with the default size limit.
    pub async fn create(dir: impl AsRef<Path>, name: &str) -> DeckutilsResult<Self> {
        Self::with_max_size(
            dir.as_ref().join(format!("{name}.{LOG_SUFFIX}")),
            DEFAULT_LOG_MAX_SIZE,
        )
        .await
    }

    /// Opens a log at `path`, rotating any existing file out of the way first.
    pub async fn with_max_size(path: impl Into<PathBuf>, max_size: u64) -> DeckutilsResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if fs::try_exists(&path).await? {
            rotate(&path).await?;
        }

        let file = open_log(&path).await?;
        Ok(Self {
            file,
            path,
            max_size,
            written: 0,
        })
    }

    /// The path of the live log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line of output, tagged with the stream it came from.
    pub async fn write_line(&mut self, stream: OutputStream, line: &str) -> DeckutilsResult<()> {
        let entry = format!("[{stream}] {line}\n");
        let len = entry.len() as u64;

        if self.written > 0 && self.written + len > self.max_size {
            self.file.flush().await?;
            rotate(&self.path).await?;
            self.file = open_log(&self.path).await?;
            self.written = 0;
        }

        self.file.write_all(entry.as_bytes()).await?;
        self.file.flush().await?;
        self.written += len;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the path a log is rotated to.
pub fn rotated_log_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{ROTATED_LOG_SUFFIX}"));
    PathBuf::from(name)
}

async fn rotate(path: &Path) -> DeckutilsResult<()> {
    let backup = rotated_log_path(path);
    if let Err(e) = fs::rename(path, &backup).await {
        tracing::warn!(log = %path.display(), error = %e, "failed to rotate log file");
    }
    Ok(())
}

async fn open_log(path: &Path) -> DeckutilsResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;

    let mut perms = file.metadata().await?.permissions();
    perms.set_mode(0o644);
    file.set_permissions(perms).await?;

    Ok(file)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
