use crate::{FaultCapture, FaultTimestamp};
use std::{
    fs::File,
    path::{Path, PathBuf},
};

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("unable to create '{}'", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(target_os = "windows")]
    #[error(transparent)]
    Writer(#[from] minidump_writer::errors::Error),
    /// The minidump writer failed, with the message it reported
    #[error("minidump writer failed: {0}")]
    Failed(String),
    /// The helper process that writes the minidump could not be started
    #[error("unable to start the dump helper process")]
    Helper(#[source] std::io::Error),
    /// The helper process that writes the minidump did not exit cleanly
    #[error("the dump helper process exited with status {0}")]
    HelperExited(i32),
    /// The helper process that writes the minidump was killed
    #[error("the dump helper process was killed by signal {0}")]
    HelperSignaled(i32),
}

/// The minidump produced for a fault
#[derive(Debug)]
pub struct SnapshotArtifact {
    /// Where the minidump was, or would have been, written
    pub path: PathBuf,
    pub outcome: Result<(), SnapshotError>,
}

impl SnapshotArtifact {
    #[inline]
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    #[inline]
    pub fn file_name(&self) -> std::borrow::Cow<'_, str> {
        self.path
            .file_name()
            .map_or_else(|| self.path.to_string_lossy(), |name| name.to_string_lossy())
    }
}

/// Whether a minidump was attempted for a fault
#[derive(Debug)]
pub enum SnapshotStatus {
    /// Minidumps are disabled in the [`crate::Config`]
    Skipped,
    Attempted(SnapshotArtifact),
}

impl SnapshotStatus {
    #[inline]
    pub fn artifact(&self) -> Option<&SnapshotArtifact> {
        match self {
            Self::Skipped => None,
            Self::Attempted(artifact) => Some(artifact),
        }
    }
}

/// Writes the minidump for the fault described by `capture` into `dir`.
///
/// Creating the file and writing the minidump can fail independently, either
/// failure is recorded in the returned artifact.
pub(crate) fn write_snapshot(
    capture: &dyn FaultCapture,
    dir: &Path,
    timestamp: &FaultTimestamp,
) -> SnapshotArtifact {
    let path = dir.join(timestamp.snapshot_file_name());

    let outcome = match File::create(&path) {
        Ok(mut file) => capture
            .write_snapshot(&mut file)
            .and_then(|()| file.sync_all().map_err(SnapshotError::from)),
        Err(source) => Err(SnapshotError::Create {
            path: path.clone(),
            source,
        }),
    };

    match &outcome {
        Ok(()) => log::debug!("wrote minidump to '{}'", path.display()),
        Err(err) => log::error!("failed to write minidump: {err}"),
    }

    SnapshotArtifact { path, outcome }
}
