use crate::{Classification, Config, FaultEvent, SnapshotStatus, StackFrame};
use std::fmt::{self, Write};

const SEPARATOR: &str = "========================================";

/// The final, human readable report for a fault
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrashReport {
    text: String,
}

impl CrashReport {
    /// Assembles the report from the output of each pipeline stage
    pub fn assemble(
        config: &Config,
        event: &FaultEvent,
        classification: &Classification,
        frames: &[StackFrame],
        snapshot: &SnapshotStatus,
    ) -> Self {
        let mut text = String::with_capacity(2048);

        // Writing to a String can't fail
        let _ = Self::write_all(&mut text, config, event, classification, frames, snapshot);

        Self { text }
    }

    fn write_all(
        w: &mut String,
        config: &Config,
        event: &FaultEvent,
        classification: &Classification,
        frames: &[StackFrame],
        snapshot: &SnapshotStatus,
    ) -> fmt::Result {
        writeln!(w, "Crash detected!\n")?;
        writeln!(w, "Program: {} {}", config.program_name, config.program_version)?;
        writeln!(w, "Exception code: {:#x}", event.code)?;
        writeln!(w, "Address: {:#x}", event.instruction_address)?;
        if let Some((signo, code)) = event.signal {
            writeln!(w, "Signal: {signo} (code {code})")?;
        }
        writeln!(w, "Thread: {}\n", event.thread_id)?;

        writeln!(w, "Reason: {classification}")?;

        writeln!(w, "\n{SEPARATOR}\n")?;
        writeln!(w, "Call stack:")?;
        if frames.is_empty() {
            writeln!(w, "  (no frames could be walked)")?;
        }
        for frame in frames {
            writeln!(w, "{frame}")?;
        }
        writeln!(w, "\n{SEPARATOR}\n")?;

        match snapshot {
            SnapshotStatus::Skipped => {
                write!(w, "Dump file creation was skipped (disabled in configuration).")
            }
            SnapshotStatus::Attempted(artifact) => match &artifact.outcome {
                Ok(()) => write!(
                    w,
                    "A dump file '{}' was created in '{}'.",
                    artifact.file_name(),
                    artifact
                        .path
                        .parent()
                        .map_or_else(String::new, |p| p.display().to_string())
                ),
                Err(err) => {
                    write!(w, "Failed to create dump file '{}': {err}", artifact.file_name())?;
                    let mut source = std::error::Error::source(err);
                    while let Some(inner) = source {
                        write!(w, ": {inner}")?;
                        source = std::error::Error::source(inner);
                    }
                    Ok(())
                }
            },
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl AsRef<str> for CrashReport {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        FaultTimestamp, ResolveError, SnapshotArtifact, SnapshotError, SourceLocation, classify,
        codes,
    };

    fn event() -> FaultEvent {
        FaultEvent {
            code: codes::INT_DIVIDE_BY_ZERO,
            instruction_address: 0x1234,
            access: None,
            thread_id: 7,
            signal: None,
            timestamp: FaultTimestamp {
                day: 1,
                hour: 2,
                minute: 3,
                second: 4,
            },
        }
    }

    #[test]
    fn layout() {
        let event = event();
        let frames = [
            StackFrame {
                depth: 0,
                pc: 0x1234,
                symbol: Ok("math::divide".to_owned()),
                location: Ok(SourceLocation {
                    file: "src/math.rs".to_owned(),
                    line: 9,
                }),
            },
            StackFrame {
                depth: 1,
                pc: 0x5678,
                symbol: Err(ResolveError::NotFound(0x5677)),
                location: Err(ResolveError::NoLineInfo(0x5677)),
            },
        ];

        let report = CrashReport::assemble(
            &Config::new("Thing", "0.3.0"),
            &event,
            &classify(event.code, None),
            &frames,
            &SnapshotStatus::Skipped,
        );

        let expected = "\
Crash detected!

Program: Thing 0.3.0
Exception code: 0xc0000094
Address: 0x1234
Thread: 7

Reason: Integer divide by zero

========================================

Call stack:
  0: math::divide
        file: src/math.rs
        line: 9 [0x1234]
  1: (symbol not found) [0x5678]

========================================

Dump file creation was skipped (disabled in configuration).";

        assert_eq!(report.as_str(), expected);
    }

    #[test]
    fn empty_stack() {
        let event = event();
        let report = CrashReport::assemble(
            &Config::default(),
            &event,
            &classify(event.code, None),
            &[],
            &SnapshotStatus::Skipped,
        );

        assert!(report.as_str().contains("Call stack:\n  (no frames could be walked)\n"));
    }

    #[test]
    fn snapshot_lines() {
        let event = event();
        let class = classify(event.code, None);
        let dir = std::path::Path::new("exe-dir");

        let ok = SnapshotStatus::Attempted(SnapshotArtifact {
            path: dir.join("crash_01_02_03_04.dmp"),
            outcome: Ok(()),
        });
        let report = CrashReport::assemble(&Config::default(), &event, &class, &[], &ok);
        assert!(
            report
                .as_str()
                .ends_with("A dump file 'crash_01_02_03_04.dmp' was created in 'exe-dir'.")
        );

        let failed = SnapshotStatus::Attempted(SnapshotArtifact {
            path: dir.join("crash_01_02_03_04.dmp"),
            outcome: Err(SnapshotError::Create {
                path: dir.join("crash_01_02_03_04.dmp"),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            }),
        });
        let report = CrashReport::assemble(&Config::default(), &event, &class, &[], &failed);
        assert!(report.as_str().ends_with(&format!(
            "Failed to create dump file 'crash_01_02_03_04.dmp': unable to create '{}': denied",
            dir.join("crash_01_02_03_04.dmp").display()
        )));
    }
}
