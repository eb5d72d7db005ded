use std::{
    fmt,
    path::{Path, PathBuf},
    process::ExitStatus,
};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Abort,
    Fpe,
    Illegal,
    /// A write to [`INVALID_ADDRESS`]
    InvalidWrite,
    Segv,
    StackOverflow,
    Trap,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Illegal => "illegal",
            Self::Trap => "trap",
            Self::Abort => "abort",
            Self::Fpe => "fpe",
            Self::InvalidWrite => "invalid-write",
            Self::Segv => "segv",
            Self::StackOverflow => "stack-overflow",
        })
    }
}

impl Signal {
    /// The reasons the report may give for the signal
    pub fn expected_reasons(self) -> &'static [&'static str] {
        match self {
            Self::Abort => &["Abnormal program termination (abort was called)"],
            Self::Fpe => &["Integer divide by zero"],
            Self::Illegal => &["Illegal CPU instruction executed"],
            Self::InvalidWrite => &[INVALID_WRITE_REASON],
            Self::Segv => &["Access violation - attempted to"],
            Self::StackOverflow => &["Stack overflow (likely due to infinite recursion)"],
            Self::Trap => &["Breakpoint hit (INT 3 instruction executed)"],
        }
    }
}

/// The address written to by [`Signal::InvalidWrite`]
pub const INVALID_ADDRESS: usize = 0xDEAD_0000;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "windows", target_arch = "x86", target_arch = "x86_64"))] {
        /// The exact reason reported for [`Signal::InvalidWrite`]
        pub const INVALID_WRITE_REASON: &str =
            "Access violation - attempted to write to invalid memory at address 0xdead0000";
    } else {
        /// The exact reason reported for [`Signal::InvalidWrite`], the kind of
        /// access is only known on x86 Linux
        pub const INVALID_WRITE_REASON: &str =
            "Access violation - unknown access to invalid memory at address 0xdead0000";
    }
}

/// The output of a single crash-client run
pub struct CrashRun {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    /// The output directory the reporter wrote its artifacts to
    pub dir: tempfile::TempDir,
}

impl CrashRun {
    fn find(&self, extension: &str) -> Option<PathBuf> {
        std::fs::read_dir(self.dir.path())
            .expect("failed to read output dir")
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .find(|path| {
                path.extension().is_some_and(|ext| ext == extension)
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with("crash_"))
            })
    }

    /// The path of the crash log
    #[inline]
    pub fn log_path(&self) -> PathBuf {
        self.find("txt").unwrap_or_else(|| {
            panic!(
                "no crash log found in {}\nstderr:\n{}",
                self.dir.path().display(),
                self.stderr
            )
        })
    }

    /// The contents of the crash log
    #[inline]
    pub fn log(&self) -> String {
        let path = self.log_path();
        std::fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()))
    }

    /// The path of the minidump, if one was written
    #[inline]
    pub fn dump_path(&self) -> Option<PathBuf> {
        self.find("dmp")
    }
}

/// Locates a binary built alongside the test executable
pub fn bin_path(name: &str) -> PathBuf {
    use std::env;

    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut cmd_path = env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }

    cmd_path.push(name);
    if !env::consts::EXE_SUFFIX.is_empty() {
        cmd_path.set_extension(env::consts::EXE_SUFFIX.trim_start_matches('.'));
    }

    cmd_path
}

pub fn run_client(signal: Signal, use_thread: bool, create_snapshot: bool) -> CrashRun {
    let dir = tempfile::tempdir().expect("failed to create output dir");

    let mut cmd = std::process::Command::new(bin_path("crash-client"));
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    cmd.arg("--signal")
        .arg(signal.to_string())
        .arg("--dir")
        .arg(dir.path());
    if use_thread {
        cmd.arg("--use-thread");
    }
    if !create_snapshot {
        cmd.arg("--no-dump");
    }

    let child = cmd.spawn().expect("failed to run crash-client");
    let output = child.wait_with_output().expect("failed to wait for output");

    let run = CrashRun {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        dir,
    };

    println!("{}", run.stdout);
    eprintln!("{}", run.stderr);

    // Ensure it was interrupted and did not exit properly
    #[cfg(unix)]
    assert!(
        run.status.code().is_none(),
        "crash-client exited with {}",
        run.status
    );
    #[cfg(windows)]
    assert_ne!(run.status.code(), Some(0));

    run
}

/// Checks that the log and console report were produced, and agree with each other
pub fn assert_report(run: &CrashRun, signal: Signal) -> String {
    let log = run.log();

    assert!(log.starts_with("Crash detected!\n"), "{log}");
    assert!(log.contains("Program: crash-client "), "{log}");
    assert!(log.contains("\nCall stack:\n"), "{log}");

    let reason = log
        .lines()
        .find_map(|line| line.strip_prefix("Reason: "))
        .unwrap_or_else(|| panic!("no reason in log:\n{log}"));
    assert!(
        signal
            .expected_reasons()
            .iter()
            .any(|expected| reason.starts_with(expected)),
        "unexpected reason for {signal}: '{reason}'"
    );

    // The console banner carries the same report as the log
    assert!(run.stderr.contains("crash-client has shut down\nPROGRAM SHUTDOWN"));
    assert!(run.stderr.contains(&log), "report missing from stderr");

    log
}

pub use minidump::system_info::{Cpu, Os};

#[inline]
pub fn get_native_os() -> Os {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            Os::Linux
        } else if #[cfg(target_os = "windows")] {
            Os::Windows
        } else {
            compile_error!("implement me");
        }
    }
}

#[inline]
pub fn get_native_cpu() -> Cpu {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            Cpu::X86_64
        } else if #[cfg(target_arch = "x86")] {
            Cpu::X86
        } else if #[cfg(target_arch = "aarch64")] {
            Cpu::Arm64
        } else if #[cfg(target_arch = "arm")] {
            Cpu::Arm
        } else {
            compile_error!("implement me");
        }
    }
}

pub fn assert_minidump(md_path: &Path, signal: Signal) {
    use minidump::CrashReason;
    use minidump_common::errors as format;

    let md_buf = std::fs::read(md_path)
        .unwrap_or_else(|e| panic!("failed to read minidump from {}: {e}", md_path.display()));
    let md = minidump::Minidump::read(md_buf.as_slice()).expect("failed to parse minidump");

    let exc: minidump::MinidumpException<'_> =
        md.get_stream().expect("unable to find exception stream");

    let native_os = get_native_os();
    let native_cpu = get_native_cpu();

    let crash_reason = exc.get_crash_reason(native_os, native_cpu);

    match native_os {
        Os::Linux => match signal {
            Signal::Abort => {
                assert!(matches!(
                    crash_reason,
                    CrashReason::LinuxGeneral(format::ExceptionCodeLinux::SIGABRT, _)
                ));
            }
            Signal::Fpe => {
                assert!(matches!(
                    crash_reason,
                    CrashReason::LinuxSigfpe(format::ExceptionCodeLinuxSigfpeKind::FPE_INTDIV)
                ));
            }
            Signal::Illegal => {
                assert!(matches!(
                    crash_reason,
                    CrashReason::LinuxSigill(format::ExceptionCodeLinuxSigillKind::ILL_ILLOPN)
                ));
            }
            Signal::Segv | Signal::InvalidWrite => {
                assert!(matches!(
                    crash_reason,
                    CrashReason::LinuxSigsegv(format::ExceptionCodeLinuxSigsegvKind::SEGV_MAPERR)
                ));
            }
            Signal::StackOverflow => {
                // A stack overflow on the main thread is reported as SEGV_MAPERR
                // rather than SEGV_ACCERR like for non-main threads, so accept either
                assert!(matches!(
                    crash_reason,
                    CrashReason::LinuxSigsegv(
                        format::ExceptionCodeLinuxSigsegvKind::SEGV_ACCERR
                            | format::ExceptionCodeLinuxSigsegvKind::SEGV_MAPERR
                    )
                ));
            }
            Signal::Trap => {
                assert!(matches!(
                    crash_reason,
                    CrashReason::LinuxGeneral(format::ExceptionCodeLinux::SIGTRAP, _)
                ));
            }
        },
        Os::Windows => match signal {
            Signal::Segv | Signal::InvalidWrite => {
                assert!(matches!(
                    crash_reason,
                    CrashReason::WindowsAccessViolation(_)
                ));
            }
            Signal::StackOverflow => {
                assert!(matches!(
                    crash_reason,
                    CrashReason::WindowsGeneral(format::ExceptionCodeWindows::EXCEPTION_STACK_OVERFLOW)
                ));
            }
            _ => {}
        },
        _ => unimplemented!(),
    }

    if signal == Signal::InvalidWrite {
        assert_eq!(
            exc.get_crash_address(native_os, native_cpu),
            INVALID_ADDRESS as u64
        );
    }
}

/// Crashes the client with `signal` and checks everything it wrote
pub fn run_test(signal: Signal, use_thread: bool) -> CrashRun {
    let run = run_client(signal, use_thread, true);
    let log = assert_report(&run, signal);

    let dump = run.dump_path();
    if log.contains("A dump file 'crash_") {
        let dump = dump.unwrap_or_else(|| panic!("report claims a dump, but none exists:\n{log}"));
        assert_minidump(&dump, signal);
    } else {
        // Writing a minidump needs ptrace, which may not be available in a
        // sandboxed environment, but the failure must still be reported
        assert!(log.contains("Failed to create dump file 'crash_"), "{log}");
    }

    run
}

pub fn run_threaded_test(signal: Signal, count: u32) {
    use rayon::prelude::*;

    (0..count).into_par_iter().for_each(|_| {
        run_test(signal, true);
    });
}
