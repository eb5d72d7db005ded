//! The collaborators the finished report is handed to.

use crate::CrashReport;
use std::path::{Path, PathBuf};

/// Presents the final report to the user.
///
/// This is the last thing that runs for a fault. Implementations may end the
/// process themselves, if they return the fault is handed back to the
/// operating system which terminates the process.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, report: &CrashReport);
}

/// Writes the shutdown banner and the report to stderr
#[derive(Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, title: &str, report: &CrashReport) {
        let banner = format!(
            "\n====================\n{title}\nPROGRAM SHUTDOWN\n\n\n{report}\n====================\n"
        );
        crate::write_stderr(&banner);
    }
}

/// Writes the plain text crash log
pub trait LogWriter: Send + Sync {
    /// Writes `report` to `file_name` inside `dir`, returning the full path
    fn write_log(&self, dir: &Path, file_name: &str, report: &str) -> std::io::Result<PathBuf>;
}

/// Writes the report as-is to a file on disk
#[derive(Default)]
pub struct FileLogWriter;

impl LogWriter for FileLogWriter {
    fn write_log(&self, dir: &Path, file_name: &str, report: &str) -> std::io::Result<PathBuf> {
        use std::io::Write;

        let path = dir.join(file_name);
        let mut file = std::fs::File::create(&path)?;
        file.write_all(report.as_bytes())?;
        file.sync_all()?;
        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = FileLogWriter
            .write_log(dir.path(), "crash_01_02_03_04.txt", "Crash detected!\n")
            .unwrap();

        assert_eq!(path, dir.path().join("crash_01_02_03_04.txt"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "Crash detected!\n");
    }

    #[test]
    fn missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(FileLogWriter.write_log(&missing, "crash.txt", "").is_err());
    }
}
