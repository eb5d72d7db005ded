use std::path::PathBuf;

/// The default number of frames rendered in a report
pub const DEFAULT_MAX_FRAMES: usize = 10;

/// Stack headroom reserved for the handler, 32k
pub const DEFAULT_EMERGENCY_STACK_SIZE: usize = 32 * 1024;

/// Settings consumed by the [`crate::CrashReporter`].
///
/// This is plain data, it is read when a fault is handled and, for
/// [`Self::emergency_stack_size`], when the handler is installed.
#[derive(Clone, Debug)]
pub struct Config {
    /// Display name used for the notification title and the report header
    pub program_name: String,
    /// Version shown in the report header
    pub program_version: String,
    /// Whether a minidump is written when a fault is handled
    pub create_snapshot: bool,
    /// The directory the log and minidump are written to. If `None` the
    /// directory containing the running executable is used.
    pub output_dir: Option<PathBuf>,
    /// The maximum number of stack frames to walk
    pub max_frames: usize,
    /// The minimum stack space, in bytes, available to the handler
    pub emergency_stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            program_name: "Program name".to_owned(),
            program_version: "1.0.0".to_owned(),
            create_snapshot: true,
            output_dir: None,
            max_frames: DEFAULT_MAX_FRAMES,
            emergency_stack_size: DEFAULT_EMERGENCY_STACK_SIZE,
        }
    }
}

impl Config {
    #[inline]
    pub fn new(program_name: impl Into<String>, program_version: impl Into<String>) -> Self {
        Self {
            program_name: program_name.into(),
            program_version: program_version.into(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn create_snapshot(mut self, enabled: bool) -> Self {
        self.create_snapshot = enabled;
        self
    }

    #[inline]
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    #[inline]
    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    #[inline]
    pub fn emergency_stack_size(mut self, size: usize) -> Self {
        self.emergency_stack_size = size;
        self
    }

    /// The title handed to the [`crate::Notifier`]
    pub fn notification_title(&self) -> String {
        format!("{} has shut down", self.program_name)
    }

    /// Resolves the directory artifacts are written to.
    ///
    /// Falls back to the current directory if the executable's location
    /// can't be determined.
    pub fn resolve_output_dir(&self) -> PathBuf {
        if let Some(dir) = &self.output_dir {
            return dir.clone();
        }

        match std::env::current_exe() {
            Ok(exe) => {
                if let Some(parent) = exe.parent() {
                    return parent.to_owned();
                }
            }
            Err(err) => {
                log::warn!("unable to locate the executable: {err}");
            }
        }

        std::env::current_dir().unwrap_or_else(|_err| PathBuf::from("."))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.max_frames, 10);
        assert!(cfg.create_snapshot);
        assert_eq!(cfg.notification_title(), "Program name has shut down");
    }

    #[test]
    fn explicit_output_dir_wins() {
        let cfg = Config::new("thing", "2.0.1").output_dir("/tmp/over-here");
        assert_eq!(cfg.resolve_output_dir(), PathBuf::from("/tmp/over-here"));
    }

    #[test]
    fn defaults_to_exe_dir() {
        let exe = std::env::current_exe().unwrap();
        assert_eq!(Config::default().resolve_output_dir(), exe.parent().unwrap());
    }
}
