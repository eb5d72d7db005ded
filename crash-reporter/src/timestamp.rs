use std::fmt;

/// Extension of the minidump written for a fault
pub const SNAPSHOT_EXTENSION: &str = "dmp";
/// Extension of the plain text crash log
pub const LOG_EXTENSION: &str = "txt";

/// The local wall-clock time a fault was captured at, at the resolution used
/// to name the crash artifacts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaultTimestamp {
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl FaultTimestamp {
    /// Captures the current local time
    #[inline]
    pub fn now() -> Self {
        Self::from_datetime(&chrono::Local::now())
    }

    pub fn from_datetime<T>(dt: &T) -> Self
    where
        T: chrono::Datelike + chrono::Timelike,
    {
        Self {
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
            second: dt.second() as u8,
        }
    }

    /// The file name, without extension, shared by every artifact of a fault,
    /// eg. `crash_05_03_07_09`
    pub fn file_stem(&self) -> String {
        sanitize_file_component(&format!("crash_{self}"))
    }

    #[inline]
    pub fn snapshot_file_name(&self) -> String {
        format!("{}.{SNAPSHOT_EXTENSION}", self.file_stem())
    }

    #[inline]
    pub fn log_file_name(&self) -> String {
        format!("{}.{LOG_EXTENSION}", self.file_stem())
    }
}

impl fmt::Display for FaultTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}_{:02}_{:02}_{:02}",
            self.day, self.hour, self.minute, self.second
        )
    }
}

/// Makes `component` usable as a file name, `:` is replaced with `-` and
/// `[`, `]` and spaces are removed
pub fn sanitize_file_component(component: &str) -> String {
    component
        .chars()
        .filter_map(|c| match c {
            ':' => Some('-'),
            '[' | ']' | ' ' => None,
            c => Some(c),
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    const FIXED: FaultTimestamp = FaultTimestamp {
        day: 5,
        hour: 3,
        minute: 7,
        second: 9,
    };

    #[test]
    fn zero_padded() {
        assert_eq!(FIXED.to_string(), "05_03_07_09");
        assert_eq!(FIXED.file_stem(), "crash_05_03_07_09");
        assert_eq!(FIXED.snapshot_file_name(), "crash_05_03_07_09.dmp");
        assert_eq!(FIXED.log_file_name(), "crash_05_03_07_09.txt");
    }

    #[test]
    fn from_datetime() {
        let dt = chrono::Utc
            .with_ymd_and_hms(2025, 11, 28, 23, 59, 1)
            .single()
            .unwrap();
        let ts = FaultTimestamp::from_datetime(&dt);
        assert_eq!(ts.to_string(), "28_23_59_01");
    }

    #[test]
    fn file_names_are_safe() {
        let now = FaultTimestamp::now();
        for name in [now.file_stem(), now.snapshot_file_name(), now.log_file_name()] {
            assert!(!name.contains([':', '[', ']', ' ']), "{name}");
        }
    }

    #[test]
    fn sanitizes() {
        assert_eq!(sanitize_file_component("[05 03:07:09]"), "0503-07-09");
        assert_eq!(sanitize_file_component("crash_05_03"), "crash_05_03");
    }
}
