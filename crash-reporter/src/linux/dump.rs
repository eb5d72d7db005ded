use crate::SnapshotError;
use std::{
    fs::File,
    io::{Read, Write},
    os::fd::{FromRawFd, OwnedFd},
};

/// Writes a minidump of this process into `file`.
///
/// A process can't `ptrace` itself, so the dump is written by a forked child
/// which inherits `file`. Any error the writer reports is sent back over a
/// pipe.
pub(super) fn write_minidump(
    cc: &crash_context::CrashContext,
    file: &mut File,
) -> Result<(), SnapshotError> {
    // SAFETY: syscalls
    unsafe {
        // Allow the child to attach to us
        let _dumpable = super::state::SetDumpable::new();

        let mut fds = [-1; 2];
        if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) == -1 {
            return Err(SnapshotError::Helper(std::io::Error::last_os_error()));
        }
        let read_end = OwnedFd::from_raw_fd(fds[0]);
        let write_end = OwnedFd::from_raw_fd(fds[1]);

        let pid = libc::fork();
        if pid == -1 {
            return Err(SnapshotError::Helper(std::io::Error::last_os_error()));
        }

        if pid == 0 {
            drop(read_end);
            run_helper(cc, file, File::from(write_end));
        }

        drop(write_end);
        debug_print!("spawned dump helper");

        let mut message = String::new();
        let _ = File::from(read_end).read_to_string(&mut message);

        let mut status = 0;
        loop {
            if libc::waitpid(pid, &mut status, 0) != -1 {
                break;
            }

            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(SnapshotError::Helper(err));
            }
        }

        if libc::WIFSIGNALED(status) {
            return Err(SnapshotError::HelperSignaled(libc::WTERMSIG(status)));
        }

        match libc::WEXITSTATUS(status) {
            0 => Ok(()),
            1 => Err(SnapshotError::Failed(message)),
            code => Err(SnapshotError::HelperExited(code)),
        }
    }
}

/// The body of the forked child, never returns
unsafe fn run_helper(cc: &crash_context::CrashContext, file: &mut File, mut report: File) -> ! {
    unsafe {
        // A fault in the child must kill it rather than park it in our handler
        super::state::install_default_handlers();

        let mut writer = minidump_writer::minidump_writer::MinidumpWriter::new(cc.pid, cc.tid);
        writer.set_crash_context(minidump_writer::crash_context::CrashContext {
            inner: cc.clone(),
        });

        let code = match writer.dump(file) {
            Ok(_) => 0,
            Err(err) => {
                let _ = write!(report, "{err}");
                1
            }
        };

        libc::_exit(code)
    }
}
