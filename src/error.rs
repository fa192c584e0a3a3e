//! Failure taxonomy for a single conversion unit (one archive).

use std::path::Path;
use thiserror::Error;

/// Why a conversion unit failed.
///
/// Every variant except [`UnitError::Workspace`] is isolated to its archive; the
/// orchestrator records it and moves on to the next one.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("archive error: {0}")]
    Archive(String),
    #[error("naming error: {0}")]
    Naming(String),
    #[error("series error: {0}")]
    Series(String),
    #[error("classification error: {0}")]
    Classification(String),
    #[error("conversion error: {0}")]
    Conversion(String),
    #[error("filesystem error: {0}")]
    Filesystem(String),
    /// The working directory could not be created at all.
    #[error("workspace error: {0}")]
    Workspace(String),
    /// The unit never ran to completion (worker panic, batch aborted).
    #[error("aborted: {0}")]
    Aborted(String),
}

impl UnitError {
    /// Stable label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            UnitError::Archive(_) => "Archive",
            UnitError::Naming(_) => "Naming",
            UnitError::Series(_) => "Series",
            UnitError::Classification(_) => "Classification",
            UnitError::Conversion(_) => "Conversion",
            UnitError::Filesystem(_) => "Filesystem",
            UnitError::Workspace(_) => "Workspace",
            UnitError::Aborted(_) => "Aborted",
        }
    }

    /// Whether the failure should stop the whole batch.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, UnitError::Workspace(_))
    }

    pub fn fs(action: &str, path: &Path, err: std::io::Error) -> Self {
        UnitError::Filesystem(format!("{} {}: {}", action, path.display(), err))
    }
}

pub type UnitResult<T> = std::result::Result<T, UnitError>;

/// Attaches a filesystem action and path to an I/O error.
pub trait FsContext<T> {
    fn fs_context(self, action: &str, path: &Path) -> UnitResult<T>;
}

impl<T> FsContext<T> for std::io::Result<T> {
    fn fs_context(self, action: &str, path: &Path) -> UnitResult<T> {
        self.map_err(|e| UnitError::fs(action, path, e))
    }
}

/// Runs blocking filesystem or DICOM work off the async worker threads.
pub async fn blocking<T, F>(f: F) -> UnitResult<T>
where
    F: FnOnce() -> UnitResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| UnitError::Aborted(format!("blocking task failed: {}", e)))?
}
