use crash_reporter_test::Signal;

use clap::Parser;

#[derive(Parser)]
struct Command {
    /// The signal/exception to raise
    #[clap(long)]
    signal: Signal,
    /// The directory the crash log and minidump are written to
    #[clap(long)]
    dir: std::path::PathBuf,
    /// Raises the signal on a separate thread rather than the main thread
    #[clap(long)]
    use_thread: bool,
    /// Disables writing of the minidump
    #[clap(long)]
    no_dump: bool,
    /// The maximum number of frames to walk
    #[clap(long, default_value_t = crash_reporter::DEFAULT_MAX_FRAMES)]
    max_frames: usize,
}

#[allow(unsafe_code)]
fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .init();

    log::info!("pid: {}", std::process::id());

    let config = crash_reporter::Config::new("crash-client", env!("CARGO_PKG_VERSION"))
        .output_dir(&cmd.dir)
        .create_snapshot(!cmd.no_dump)
        .max_frames(cmd.max_frames);

    crash_reporter::initialize(crash_reporter::CrashReporter::new(config))?;

    let signal = cmd.signal;

    let raise_signal = move || {
        // Threads other than the one that called `initialize` need their own
        // emergency stack
        if let Err(e) = crash_reporter::prepare_thread() {
            log::error!("failed to prepare thread: {e}");
        }

        // SAFETY: we're about to intentionally crash ourselves via shenanigans,
        // none of this is safe
        unsafe {
            match signal {
                Signal::Illegal => {
                    sadness_generator::raise_illegal_instruction();
                }
                Signal::Trap => {
                    sadness_generator::raise_trap();
                }
                Signal::Abort => {
                    sadness_generator::raise_abort();
                }
                Signal::Fpe => {
                    sadness_generator::raise_floating_point_exception();
                }
                Signal::InvalidWrite => {
                    std::ptr::write_volatile(
                        crash_reporter_test::INVALID_ADDRESS as *mut u32,
                        1,
                    );
                }
                Signal::Segv => {
                    sadness_generator::raise_segfault();
                }
                Signal::StackOverflow => {
                    sadness_generator::raise_stack_overflow();
                }
            }
        }
    };

    // Idle threads, so the minidump has more than the crashing thread in it
    for _ in 0..4 {
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::MAX);
        });
    }

    if cmd.use_thread {
        std::thread::spawn(raise_signal)
            .join()
            .map_err(|_e| anyhow::anyhow!("failed to join thread"))?;
    } else {
        raise_signal();
    }

    anyhow::bail!("we should have raised a signal and exited");
}

fn main() {
    // We want this program to crash and have a report written, it _shouldn't_
    // have errors that prevent that from happening, so emit an error code if we
    // do encounter an error so that we can fail the test
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");

        // When exiting due to a crash, the exit code will be 128 + the integer
        // signal number, at least on unixes
        #[allow(clippy::exit)]
        std::process::exit(222);
    }
}
