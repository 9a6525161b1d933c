use std::{
    fmt,
    io::Read,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// The faults the crash client can raise
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Segv,
    Abort,
    Fpe,
    Bus,
    Illegal,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Segv => "segv",
            Self::Abort => "abort",
            Self::Fpe => "fpe",
            Self::Bus => "bus",
            Self::Illegal => "illegal",
        })
    }
}

impl Fault {
    /// The signal the fault raises
    #[inline]
    pub fn signal(self) -> crash_log::Signal {
        use crash_log::Signal;

        match self {
            Self::Segv => Signal::Segv,
            Self::Abort => Signal::Abort,
            Self::Fpe => Signal::Fpe,
            Self::Bus => Signal::Bus,
            Self::Illegal => Signal::Illegal,
        }
    }

    /// Makes the current thread very sad. `scratch` is a directory the bus
    /// error can create its backing file in.
    pub fn raise(self, scratch: &Path) {
        match self {
            Self::Segv => raise_segfault(),
            Self::Abort => std::process::abort(),
            Self::Fpe => raise_floating_point_exception(),
            Self::Bus => raise_bus(&scratch.join("bus.bin")),
            Self::Illegal => raise_illegal_instruction(),
        }
    }
}

/// Raises `SIGSEGV` by reading from the (unmapped) zero page
#[inline(never)]
pub fn raise_segfault() {
    let addr = std::hint::black_box(std::ptr::without_provenance::<u8>(0x10));

    // SAFETY: not at all, that's the point
    let value = unsafe { std::ptr::read_volatile(addr) };
    println!("read {value} from the zero page, somehow");
}

/// Raises `SIGFPE` with an integer division by zero
#[inline(never)]
pub fn raise_floating_point_exception() {
    #[cfg(target_arch = "x86_64")]
    {
        let quotient: u32;
        // SAFETY: not at all, that's the point
        unsafe {
            std::arch::asm!(
                "mov eax, 1",
                "cdq",
                "mov {div:e}, 0",
                "idiv {div:e}",
                div = out(reg) quotient,
                out("eax") _,
                out("edx") _,
            );
        }
        println!("1 / 0 = {quotient}");
    }

    // Integer division by zero doesn't trap on eg. aarch64
    #[cfg(not(target_arch = "x86_64"))]
    raise_unblocked(libc::SIGFPE);
}

/// Raises `SIGILL` by executing an undefined instruction
#[inline(never)]
pub fn raise_illegal_instruction() {
    // SAFETY: not at all, that's the point
    unsafe {
        #[cfg(target_arch = "x86_64")]
        std::arch::asm!("ud2");
        #[cfg(target_arch = "aarch64")]
        std::arch::asm!("udf #0");
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    raise_unblocked(libc::SIGILL);
}

/// Sends `sig` to the calling thread, even if it is currently blocked, eg.
/// because we are inside the handler for another crash signal. Hardware
/// faults are delivered regardless of the signal mask, `raise` is not.
#[cfg(not(target_arch = "x86_64"))]
fn raise_unblocked(sig: i32) {
    // SAFETY: syscalls
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, sig);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
        libc::raise(sig);
    }
}

/// Raises `SIGBUS` by reading past the end of a shared mapping of an empty
/// file
#[inline(never)]
pub fn raise_bus(backing: &Path) {
    use std::os::fd::AsRawFd;

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(backing)
        .expect("failed to create bus backing file");

    // SAFETY: not at all, that's the point
    unsafe {
        let mapping = libc::mmap(
            std::ptr::null_mut(),
            128,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        );
        assert_ne!(mapping, libc::MAP_FAILED, "failed to map bus backing file");

        let value = std::ptr::read_volatile(mapping.cast::<u8>().add(1));
        println!("read {value} past the end of the file, somehow");
    }
}

/// Escape conditions the client can report
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Escape {
    Emergency,
    MissingComponents,
}

impl fmt::Display for Escape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Emergency => "emergency",
            Self::MissingComponents => "missing-components",
        })
    }
}

/// The name of the file the client's cleanup hook creates
pub const CLEANUP_MARKER: &str = "cleanup.done";

/// How the crash client is run
pub struct ClientOptions<'dir> {
    pub fault: Fault,
    pub dir: &'dir Path,
    pub escape: Option<Escape>,
    pub state_sections: bool,
    /// Raises this fault while the state sections are being produced
    pub fault_in_report: Option<Fault>,
    /// Panics while the state sections are being produced
    pub panic_in_report: bool,
    /// Holds the stderr lock on another thread while crashing
    pub hold_stderr: bool,
    pub message: Option<&'static str>,
    pub dump_server: Option<&'dir str>,
    pub use_thread: bool,
}

impl<'dir> ClientOptions<'dir> {
    pub fn new(fault: Fault, dir: &'dir Path) -> Self {
        Self {
            fault,
            dir,
            escape: None,
            state_sections: false,
            fault_in_report: None,
            panic_in_report: false,
            hold_stderr: false,
            message: None,
            dump_server: None,
            use_thread: false,
        }
    }
}

pub struct ClientOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ClientOutput {
    /// The signal that terminated the client
    #[inline]
    pub fn signal(&self) -> Option<i32> {
        self.status.signal()
    }

    /// Asserts the client was terminated by `abort`, and nothing else
    #[track_caller]
    pub fn assert_aborted(&self) {
        assert_eq!(
            self.signal(),
            Some(libc::SIGABRT),
            "client exited with {}\nstderr:\n{}",
            self.status,
            self.stderr
        );
    }
}

/// How long the client gets to crash, report and abort
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

fn drain(mut pipe: impl Read + Send + 'static) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

pub fn run_client(opts: &ClientOptions<'_>) -> ClientOutput {
    use std::env;

    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut cmd_path = env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }

    cmd_path.push("crash-client");
    if !env::consts::EXE_SUFFIX.is_empty() {
        cmd_path.set_extension(env::consts::EXE_SUFFIX);
    }

    let mut cmd = std::process::Command::new(&cmd_path);
    cmd.arg("--fault")
        .arg(opts.fault.to_string())
        .arg("--dir")
        .arg(opts.dir);

    if let Some(escape) = opts.escape {
        cmd.args(["--escape", &escape.to_string()]);
    }
    if opts.state_sections {
        cmd.arg("--state-sections");
    }
    if let Some(fault) = opts.fault_in_report {
        cmd.args(["--fault-in-report", &fault.to_string()]);
    }
    if opts.panic_in_report {
        cmd.arg("--panic-in-report");
    }
    if opts.hold_stderr {
        cmd.arg("--hold-stderr");
    }
    if let Some(message) = opts.message {
        cmd.args(["--message", message]);
    }
    if let Some(server) = opts.dump_server {
        cmd.args(["--dump-server", server]);
    }
    if opts.use_thread {
        cmd.arg("--use-thread");
    }

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to run crash-client");

    let stdout = drain(child.stdout.take().expect("stdout is piped"));
    let stderr = drain(child.stderr.take().expect("stderr is piped"));

    // A client stuck in its signal handler would otherwise hang the test
    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().expect("failed to wait on crash-client") {
            break status;
        }

        if start.elapsed() > CLIENT_TIMEOUT {
            let _ = child.kill();
            let _ = child.wait();
            panic!(
                "crash-client did not terminate within {CLIENT_TIMEOUT:?}\nstderr:\n{}",
                stderr.join().unwrap_or_default()
            );
        }

        std::thread::sleep(Duration::from_millis(20));
    };

    let out = ClientOutput {
        status,
        stdout: stdout.join().expect("failed to read stdout"),
        stderr: stderr.join().expect("failed to read stderr"),
    };

    println!("{}", out.stdout);
    eprintln!("{}", out.stderr);

    // Ensure it was interrupted and did not exit properly
    assert!(
        out.status.code().is_none(),
        "client exited normally with {}",
        out.status
    );

    out
}

/// Lists the files in `dir` with the specified extension
pub fn artifacts(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let mut found: Vec<_> = std::fs::read_dir(dir)
        .expect("failed to read artifact dir")
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            (path.extension()? == extension).then_some(path)
        })
        .collect();
    found.sort();
    found
}

/// Reads the one and only report in `dir`
#[track_caller]
pub fn read_report(dir: &Path) -> String {
    let reports = artifacts(dir, "log");
    assert_eq!(reports.len(), 1, "expected exactly one report: {reports:?}");
    std::fs::read_to_string(&reports[0]).expect("failed to read report")
}

/// Asserts each of `expected` appears in `report`, in order
#[track_caller]
pub fn assert_in_order(report: &str, expected: &[&str]) {
    let mut last = 0;
    for exp in expected {
        let Some(pos) = report[last..].find(exp) else {
            panic!("'{exp}' missing or out of order in report:\n{report}");
        };
        last += pos + exp.len();
    }
}

#[inline]
pub fn cleanup_ran(dir: &Path) -> bool {
    dir.join(CLEANUP_MARKER).exists()
}

pub struct DumpServer {
    pub name: String,
    shutdown: Arc<AtomicBool>,
    run_loop: Option<std::thread::JoinHandle<()>>,
}

impl Drop for DumpServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(jh) = self.run_loop.take() {
            jh.join().expect("failed to join server thread");
        }
    }
}

/// Starts a dump server on a background thread
pub fn spinup_dump_server(name: &str) -> DumpServer {
    capture_output();

    let mut server = crash_log::DumpServer::with_name(name).expect("failed to start server");

    let shutdown = Arc::new(AtomicBool::new(false));
    let exit = shutdown.clone();

    let run_loop = std::thread::spawn(move || {
        server.run(&exit).expect("failed to run server loop");
    });

    DumpServer {
        name: name.to_owned(),
        shutdown,
        run_loop: Some(run_loop),
    }
}

#[inline]
pub fn capture_output() {
    static SUB: std::sync::Once = std::sync::Once::new();

    SUB.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().init();
    });
}

/// Crashes the client with `fault` and verifies a complete report, with
/// application state, was written before the process aborted
pub fn run_fault_test(fault: Fault, use_thread: bool) {
    let dir = tempfile::tempdir().expect("failed to create artifact dir");

    let mut opts = ClientOptions::new(fault, dir.path());
    opts.state_sections = true;
    opts.use_thread = use_thread;

    let output = run_client(&opts);
    output.assert_aborted();

    let signal = fault.signal();
    let report = read_report(dir.path());

    assert_in_order(
        &report,
        &[
            "*** crash-client Crash Report ***",
            "Operating system:\n Name:     ",
            &format!(
                "Crash reason:\n Signal:  {} ({})\n Message: <none>\n",
                signal.description(),
                signal as i32
            ),
            "Stacktrace:\n [00] ",
            "Build:\n",
            "Gamelog:\n",
            "Modules:\n",
        ],
    );

    assert!(cleanup_ran(dir.path()), "cleanup hook did not run");
    assert!(
        output.stderr.contains("Crash log written to"),
        "report was not announced"
    );
    assert!(artifacts(dir.path(), "dmp").is_empty());
}
