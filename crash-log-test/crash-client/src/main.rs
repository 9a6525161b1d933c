use crash_log_test::{CLEANUP_MARKER, Escape, Fault};

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
struct Command {
    /// The fault to raise
    #[clap(long, value_enum)]
    fault: Fault,
    /// The directory artifacts are written to
    #[clap(long)]
    dir: PathBuf,
    /// Reports the specified escape condition when the crash is handled
    #[clap(long, value_enum)]
    escape: Option<Escape>,
    /// Adds application state sections to the report
    #[clap(long)]
    state_sections: bool,
    /// Raises the specified fault while producing the application state
    /// sections
    #[clap(long, value_enum)]
    fault_in_report: Option<Fault>,
    /// Panics while producing the application state sections
    #[clap(long)]
    panic_in_report: bool,
    /// Holds the stderr lock on another thread for the rest of the process
    #[clap(long)]
    hold_stderr: bool,
    /// The error message included in the report
    #[clap(long)]
    message: Option<String>,
    /// The socket name of the dump server to request a minidump from
    #[clap(long)]
    dump_server: Option<String>,
    /// Raises the fault on a separate thread rather than the main thread
    #[clap(long)]
    use_thread: bool,
}

struct Hooks {
    escape: Option<Escape>,
    state_sections: bool,
    fault_in_report: Option<Fault>,
    panic_in_report: bool,
    scratch: PathBuf,
    cleanup_marker: PathBuf,
}

impl crash_log::CrashHooks for Hooks {
    fn is_emergency_state(&self) -> bool {
        self.escape == Some(Escape::Emergency)
    }

    fn is_missing_components(&self) -> bool {
        self.escape == Some(Escape::MissingComponents)
    }

    fn state_sections(&self) -> Vec<crash_log::StateSection> {
        if let Some(fault) = self.fault_in_report {
            fault.raise(&self.scratch);
        }

        assert!(!self.panic_in_report, "failed to gather application state");

        if !self.state_sections {
            return Vec::new();
        }

        vec![
            crash_log::StateSection::new(
                "Gamelog",
                "Tick 1: new game started\nTick 240: setting changed\n",
            ),
            crash_log::StateSection::new("Modules", "openttd-gfx 7.1\nopensfx 1.0.3"),
        ]
    }

    fn cleanup(&self) {
        let _ = std::fs::write(&self.cleanup_marker, "done");
    }
}

fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    println!("pid: {}", std::process::id());

    if let Some(message) = cmd.message {
        crash_log::set_error_message(message);
    }

    let mut settings = crash_log::Settings::default()
        .with_output_dir(&cmd.dir)
        .with_app("crash-client", env!("CARGO_PKG_VERSION"));

    if let Some(server) = cmd.dump_server {
        settings = settings.with_dump_server(server);
    }

    let hooks = Hooks {
        escape: cmd.escape,
        state_sections: cmd.state_sections,
        fault_in_report: cmd.fault_in_report,
        panic_in_report: cmd.panic_in_report,
        scratch: cmd.dir.clone(),
        cleanup_marker: cmd.dir.join(CLEANUP_MARKER),
    };

    let _handler =
        crash_log::CrashLogHandler::install(crash_log::CrashLog::new(settings, Box::new(hooks)))?;

    if cmd.hold_stderr {
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _lock = std::io::stderr().lock();
            let _ = locked_tx.send(());
            loop {
                std::thread::park();
            }
        });
        locked_rx.recv()?;
    }

    let fault = cmd.fault;
    let scratch = cmd.dir.clone();

    if cmd.use_thread {
        std::thread::spawn(move || {
            crash_log::init_thread().expect("failed to init thread");
            fault.raise(&scratch);
        })
        .join()
        .map_err(|_err| anyhow::anyhow!("fault thread panicked"))?;
    } else {
        fault.raise(&scratch);
    }

    anyhow::bail!("we should have raised a signal and aborted");
}

fn main() {
    // We want this program to crash and have a report written, it _shouldn't_
    // have errors that prevent that from happening, so emit an error code if we
    // do encounter an error so that we can fail the test
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");

        #[allow(clippy::exit)]
        std::process::exit(222);
    }
}
