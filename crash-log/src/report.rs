use crate::{CrashHooks, Settings};
use chrono::{DateTime, Utc};
use std::{
    fmt::{self, Write},
    fs::File,
    io::{self, Write as _},
    panic::{self, AssertUnwindSafe},
    path::Path,
};

/// The result of asking the platform to write a minidump.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum DumpStatus {
    /// The dump facility failed, the crash handling continues regardless
    Failed = -1,
    /// No dump facility is available in this build, or none was configured
    Unsupported = 0,
    /// The dump was written to the dump artifact path
    Written = 1,
}

/// An opaque block of text describing application state, appended to the
/// report after the platform sections.
#[derive(Clone, Debug)]
pub struct StateSection {
    pub title: String,
    pub body: String,
}

impl StateSection {
    #[inline]
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// The platform specific producers of report sections.
///
/// Exactly one implementation exists per target, selected at build time. Each
/// producer must degrade locally, ie. write an explanation of why the data is
/// missing into the buffer, rather than fail.
pub trait PlatformReport {
    /// Writes the name, release, version and architecture of the OS.
    fn log_os_version(&self, out: &mut ReportBuffer);
    /// Writes the description of the fault, along with the optional message
    /// set via [`set_error_message`].
    fn log_error(&self, out: &mut ReportBuffer, message: &str);
    /// Writes the stack trace of the crashing thread, or the degraded
    /// "not supported" marker, see [`write_stacktrace`].
    fn log_stacktrace(&self, out: &mut ReportBuffer);
    /// Writes the CPU registers at the time of the crash, if available.
    fn log_registers(&self, _out: &mut ReportBuffer) {}
    /// Writes a minidump of the process to `path`.
    fn write_crash_dump(&mut self, _path: &Path) -> DumpStatus {
        DumpStatus::Unsupported
    }
}

/// Append only text buffer the report is built in.
///
/// If a sink is attached, every completed section is written through to it
/// immediately, so a fault while producing a later section leaves everything
/// before it on disk.
pub struct ReportBuffer {
    text: String,
    flushed: usize,
    sink: Option<File>,
    sink_error: Option<io::Error>,
}

impl ReportBuffer {
    /// Creates a buffer that only lives in memory
    #[inline]
    pub fn new() -> Self {
        Self {
            text: String::with_capacity(16 * 1024),
            flushed: 0,
            sink: None,
            sink_error: None,
        }
    }

    /// Creates a buffer that writes through to the specified file
    #[inline]
    pub fn with_sink(file: File) -> Self {
        let mut rb = Self::new();
        rb.sink = Some(file);
        rb
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[inline]
    pub fn into_string(self) -> String {
        self.text
    }

    #[inline]
    pub fn push_str(&mut self, s: &str) {
        self.text.push_str(s);
    }

    #[inline]
    pub fn push(&mut self, c: char) {
        self.text.push(c);
    }

    /// The first error encountered while writing to the sink, after which the
    /// sink is abandoned.
    #[inline]
    pub fn sink_error(&self) -> Option<&io::Error> {
        self.sink_error.as_ref()
    }

    /// Writes everything appended since the last flush to the sink.
    pub fn flush(&mut self) {
        let Some(sink) = &mut self.sink else {
            return;
        };

        let pending = &self.text.as_bytes()[self.flushed..];
        match sink.write_all(pending) {
            Ok(()) => self.flushed = self.text.len(),
            Err(err) => {
                self.sink = None;
                self.sink_error = Some(err);
            }
        }
    }

    /// Runs a single section producer, then flushes.
    ///
    /// A panicking producer is replaced by a marker line, whatever it managed
    /// to append before panicking is kept.
    pub fn section(&mut self, name: &str, produce: impl FnOnce(&mut Self)) {
        if panic::catch_unwind(AssertUnwindSafe(|| produce(self))).is_err() {
            if !self.text.ends_with('\n') {
                self.text.push('\n');
            }
            let _ = writeln!(self, "Section failed: {name}\n");
        }

        self.flush();
    }
}

impl Default for ReportBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for ReportBuffer {
    #[inline]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.text.push_str(s);
        Ok(())
    }
}

/// Marker written in place of frames when stack capture is unavailable
pub const STACKTRACE_UNSUPPORTED: &str = " Not supported.";

/// Renders the stack trace section, one index prefixed line per frame, or
/// the degraded marker if `frames` is `None`.
pub fn write_stacktrace<I>(out: &mut ReportBuffer, frames: Option<I>)
where
    I: IntoIterator,
    I::Item: fmt::Display,
{
    out.push_str("Stacktrace:\n");

    match frames {
        Some(frames) => {
            for (i, frame) in frames.into_iter().enumerate() {
                let _ = writeln!(out, " [{i:02}] {frame}");
            }
        }
        None => {
            out.push_str(STACKTRACE_UNSUPPORTED);
            out.push('\n');
        }
    }

    out.push('\n');
}

static ERROR_MESSAGE: parking_lot::Mutex<Option<String>> = parking_lot::const_mutex(None);

/// Sets a message that is included in the error section of the report if the
/// process crashes, eg. to explain a fatal condition detected just before an
/// intentional abort.
pub fn set_error_message(message: impl Into<String>) {
    *ERROR_MESSAGE.lock() = Some(message.into());
}

/// Clears the message set with [`set_error_message`]
pub fn clear_error_message() {
    ERROR_MESSAGE.lock().take();
}

/// Calls `f` with the current error message. This never blocks, if the
/// message is being modified at the time of the crash it is unavailable.
fn with_error_message(f: impl FnOnce(&str)) {
    match ERROR_MESSAGE.try_lock() {
        Some(msg) => f(msg.as_deref().unwrap_or("<none>")),
        None => f("<unavailable>"),
    }
}

/// Builds the full report into `out`, one section at a time, in a fixed
/// order.
pub(crate) fn assemble(
    platform: &dyn PlatformReport,
    settings: &Settings,
    hooks: &dyn CrashHooks,
    when: DateTime<Utc>,
    out: &mut ReportBuffer,
) {
    out.section("header", |out| {
        let _ = write!(
            out,
            "*** {} Crash Report ***\n\n\
            Crash at: {} (UTC)\n\
            Version:  {}\n\
            Process:  {}\n\n",
            settings.app_name,
            when.format("%Y-%m-%d %H:%M:%S"),
            settings.app_version,
            std::process::id(),
        );
    });

    out.section("os", |out| {
        platform.log_os_version(out);
        out.push('\n');
    });
    out.section("error", |out| {
        with_error_message(|msg| platform.log_error(out, msg));
    });
    out.section("stacktrace", |out| platform.log_stacktrace(out));
    out.section("registers", |out| platform.log_registers(out));
    out.section("build", log_build);

    let mut sections = Vec::new();
    out.section("state", |_out| sections = hooks.state_sections());

    for section in sections {
        out.section(&section.title, |out| {
            let _ = writeln!(out, "{}:", section.title);
            out.push_str(&section.body);
            if !section.body.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        });
    }
}

fn log_build(out: &mut ReportBuffer) {
    let _ = write!(
        out,
        "Build:\n \
        Crate:   {} {}\n \
        Target:  {}-{}\n \
        Profile: {}\n\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH,
        std::env::consts::OS,
        if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    );
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::NoHooks;
    use chrono::TimeZone;

    /// A platform with no capabilities at all
    pub(crate) struct Degraded {
        pub(crate) dump: DumpStatus,
    }

    impl PlatformReport for Degraded {
        fn log_os_version(&self, out: &mut ReportBuffer) {
            let _ = writeln!(
                out,
                "Could not get OS version: {}",
                io::Error::other("uname is unavailable")
            );
        }

        fn log_error(&self, out: &mut ReportBuffer, message: &str) {
            let _ = write!(
                out,
                "Crash reason:\n Signal:  Segmentation fault (11)\n Message: {message}\n\n"
            );
        }

        fn log_stacktrace(&self, out: &mut ReportBuffer) {
            write_stacktrace::<Vec<String>>(out, None);
        }

        fn write_crash_dump(&mut self, _path: &Path) -> DumpStatus {
            self.dump
        }
    }

    struct Sections;

    impl CrashHooks for Sections {
        fn state_sections(&self) -> Vec<StateSection> {
            vec![
                StateSection::new("Gamelog", "loaded save\nchanged settings"),
                StateSection::new("Modules", "mod-a 1.0\n"),
            ]
        }
    }

    fn when() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 17, 5, 42).unwrap()
    }

    #[test]
    fn stacktrace_frames() {
        let mut out = ReportBuffer::new();
        write_stacktrace(&mut out, Some(["main", "start"]));

        assert_eq!(out.as_str(), "Stacktrace:\n [00] main\n [01] start\n\n");
    }

    #[test]
    fn stacktrace_unsupported() {
        let mut out = ReportBuffer::new();
        write_stacktrace::<Vec<String>>(&mut out, None);

        assert_eq!(out.as_str(), "Stacktrace:\n Not supported.\n\n");
        assert!(!out.as_str().contains(" [00]"));
    }

    #[test]
    fn panicking_section_is_skipped() {
        let mut out = ReportBuffer::new();

        out.section("first", |out| out.push_str("one\n"));
        out.section("boom", |out| {
            out.push_str("partial");
            panic!("section blew up");
        });
        out.section("last", |out| out.push_str("three\n"));

        assert_eq!(
            out.as_str(),
            "one\npartial\nSection failed: boom\n\nthree\n"
        );
    }

    #[test]
    fn flushes_each_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.log");

        let mut out = ReportBuffer::with_sink(File::create(&path).unwrap());
        out.section("first", |out| out.push_str("one\n"));

        // Nothing buffered in the sink, the first section is already on disk
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\n");

        // Unflushed text stays in memory only
        out.push_str("pending");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\n");

        out.section("second", |out| out.push_str("\ntwo\n"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\npending\ntwo\n");
        assert!(out.sink_error().is_none());
    }

    #[test]
    fn assembles_in_order() {
        set_error_message("NewGRF load failure");

        let mut out = ReportBuffer::new();
        assemble(
            &Degraded {
                dump: DumpStatus::Unsupported,
            },
            &Settings::default().with_app("simulator", "14.1"),
            &Sections,
            when(),
            &mut out,
        );

        let report = out.into_string();

        assert!(report.starts_with("*** simulator Crash Report ***\n\nCrash at: 2024-03-09 17:05:42 (UTC)\nVersion:  14.1\n"));

        let order = [
            "Could not get OS version: ",
            "Crash reason:\n Signal:  Segmentation fault (11)\n Message: NewGRF load failure\n",
            "Stacktrace:\n Not supported.\n\n",
            "Build:\n",
            "Gamelog:\nloaded save\nchanged settings\n\n",
            "Modules:\nmod-a 1.0\n\n",
        ];

        let mut last = 0;
        for expected in order {
            let pos = report[last..]
                .find(expected)
                .unwrap_or_else(|| panic!("'{expected}' missing or out of order in:\n{report}"));
            last += pos + expected.len();
        }

        // This is the only test that touches the message, so check the unset
        // case here as well rather than racing another test
        clear_error_message();

        let mut out = ReportBuffer::new();
        assemble(
            &Degraded {
                dump: DumpStatus::Unsupported,
            },
            &Settings::default(),
            &NoHooks,
            when(),
            &mut out,
        );

        assert!(out.as_str().contains(" Message: <none>\n"));
    }

    #[test]
    fn build_section() {
        let mut out = ReportBuffer::new();
        assemble(
            &Degraded {
                dump: DumpStatus::Unsupported,
            },
            &Settings::default(),
            &NoHooks,
            when(),
            &mut out,
        );

        let report = out.as_str();
        assert!(report.contains("Build:\n Crate:   crash-log "));
        assert!(
            report.ends_with(" Profile: debug\n\n") || report.ends_with(" Profile: release\n\n")
        );
    }
}
