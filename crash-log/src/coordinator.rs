use crate::{
    ArtifactPaths, DumpStatus, PlatformReport, ReportBuffer, Settings, StateSection, report,
    write_stderr, write_stderr_bytes, write_stderr_fmt,
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Once,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

/// Application collaborators consulted while handling a crash.
///
/// Every method is called from within the signal handler, see the crate
/// documentation for what that implies. Panics from any of them are caught
/// and treated as if the method returned its default.
pub trait CrashHooks: Send + Sync {
    /// True if the process is running from an emergency/fallback state, in
    /// which case a report would be misleading and none is written.
    fn is_emergency_state(&self) -> bool {
        false
    }

    /// True if the loaded state is missing components it requires, in which
    /// case a report would be misleading and none is written.
    fn is_missing_components(&self) -> bool {
        false
    }

    /// Pre-rendered blocks of application state appended to the report after
    /// the platform sections.
    fn state_sections(&self) -> Vec<StateSection> {
        Vec::new()
    }

    /// Releases resources that would otherwise outlive the process, eg.
    /// shared memory segments. Called once, after the report and dump.
    fn cleanup(&self) {}
}

/// [`CrashHooks`] that never escape, add no sections and clean up nothing
pub struct NoHooks;

impl CrashHooks for NoHooks {}

/// Where in the handling of a crash the [`CrashLog`] currently is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    /// Handlers are installed, no crash has occurred
    Armed,
    /// A fatal signal was received and our handlers were disabled
    Triggered,
    /// An escape condition was met, no report is written
    Escaped,
    Reporting,
    Dumping,
    CleaningUp,
    /// The process is about to abort
    Terminated,
}

impl Stage {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Armed,
            1 => Self::Triggered,
            2 => Self::Escaped,
            3 => Self::Reporting,
            4 => Self::Dumping,
            5 => Self::CleaningUp,
            _ => Self::Terminated,
        }
    }
}

/// The escape condition that suppressed the report
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EscapeReason {
    EmergencyState,
    MissingComponents,
}

impl EscapeReason {
    fn message(self) -> &'static str {
        match self {
            Self::EmergencyState => {
                "A serious fault condition occurred in the process. The process will shut down.\n\
                As you loaded an emergency state no crash information will be generated.\n"
            }
            Self::MissingComponents => {
                "A serious fault condition occurred in the process. The process will shut down.\n\
                As you loaded a state for which you do not have the required components\n\
                no crash information will be generated.\n"
            }
        }
    }
}

/// What [`CrashLog::make_crash_log`] did
#[derive(Debug)]
pub enum Outcome {
    /// Nothing was written due to an escape condition
    Escaped(EscapeReason),
    /// A report was produced
    Reported {
        /// The artifact paths, or `None` if the report file could not be
        /// created, in which case the report was written to stderr instead
        paths: Option<ArtifactPaths>,
        dump: DumpStatus,
    },
}

/// Set once a crash is being handled, after which panics are caught without
/// any output
static QUIET_PANICS: AtomicBool = AtomicBool::new(false);

/// Wraps the current panic hook so that it is skipped once [`quiet_panics`]
/// has been called.
///
/// Sections that panic while the crash is handled are caught, but the default
/// hook would first print the panic through the [`std::io::stderr`] lock,
/// which another thread may be holding forever. Installing the hook is not
/// possible from within the signal handler, so this is done ahead of time.
pub(crate) fn filter_panic_output() {
    static FILTER: Once = Once::new();

    FILTER.call_once(|| {
        let hook = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !QUIET_PANICS.load(Ordering::Acquire) {
                hook(info);
            }
        }));
    });
}

/// Silences every panic from now on, the process is about to abort
#[inline]
pub(crate) fn quiet_panics() {
    QUIET_PANICS.store(true, Ordering::Release);
}

/// Coordinates the handling of a single crash: escape checks, the report,
/// the optional dump and the cleanup hook.
///
/// Terminating the process is left to the caller, which always aborts after
/// [`Self::make_crash_log`] returns, regardless of its outcome.
pub struct CrashLog {
    settings: Settings,
    hooks: Box<dyn CrashHooks>,
    stage: AtomicU8,
}

impl CrashLog {
    pub fn new(settings: Settings, hooks: Box<dyn CrashHooks>) -> Self {
        Self {
            settings,
            hooks,
            stage: AtomicU8::new(Stage::Armed as u8),
        }
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The current stage of crash handling
    #[inline]
    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn enter(&self, stage: Stage) {
        self.stage.store(stage as u8, Ordering::Release);
    }

    fn escape_reason(&self) -> Option<EscapeReason> {
        let hooks = &*self.hooks;
        let check = |f: &dyn Fn() -> bool| panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(false);

        if check(&|| hooks.is_emergency_state()) {
            Some(EscapeReason::EmergencyState)
        } else if check(&|| hooks.is_missing_components()) {
            Some(EscapeReason::MissingComponents)
        } else {
            None
        }
    }

    /// Handles a crash described by `platform`, up to but not including
    /// process termination.
    ///
    /// Nothing in here fails: each step degrades on its own and the next one
    /// runs regardless.
    pub fn make_crash_log(&self, platform: &mut dyn PlatformReport) -> Outcome {
        if let Some(reason) = self.escape_reason() {
            self.enter(Stage::Escaped);
            write_stderr(reason.message());
            return Outcome::Escaped(reason);
        }

        self.enter(Stage::Reporting);
        if self.settings.announce {
            write_stderr("Crash encountered, generating crash log...\n");
        }

        let when = chrono::Utc::now();
        let settings = &self.settings;

        let (paths, mut out) =
            match ArtifactPaths::create_log(&settings.output_dir, &settings.file_prefix, when) {
                Ok((paths, file)) => (Some(paths), ReportBuffer::with_sink(file)),
                Err(err) => {
                    write_stderr_fmt(format_args!(
                        "Unable to create crash log in {}: {err}\n",
                        settings.output_dir.display()
                    ));
                    (None, ReportBuffer::new())
                }
            };

        report::assemble(&*platform, settings, &*self.hooks, when, &mut out);
        out.flush();
        self.announce_report(paths.as_ref(), &out);

        self.enter(Stage::Dumping);
        let dump_path = paths.as_ref().map_or_else(
            || ArtifactPaths::new(&settings.output_dir, &settings.file_prefix, when, 0).dump,
            |paths| paths.dump.clone(),
        );

        let dump = panic::catch_unwind(AssertUnwindSafe(|| platform.write_crash_dump(&dump_path)))
            .unwrap_or(DumpStatus::Failed);

        if settings.announce {
            match dump {
                DumpStatus::Written => {
                    write_stderr_fmt(format_args!(
                        "Crash dump written to {}.\n",
                        dump_path.display()
                    ));
                }
                DumpStatus::Failed => write_stderr("Writing crash dump failed.\n"),
                DumpStatus::Unsupported => {}
            }
        }

        self.enter(Stage::CleaningUp);
        let hooks = &*self.hooks;
        let _ = panic::catch_unwind(AssertUnwindSafe(|| hooks.cleanup()));

        Outcome::Reported { paths, dump }
    }

    fn announce_report(&self, paths: Option<&ArtifactPaths>, out: &ReportBuffer) {
        let written = match (paths, out.sink_error()) {
            (Some(paths), None) => {
                if self.settings.announce {
                    write_stderr_fmt(format_args!(
                        "Crash log written to {}. Please add this file to any bug reports.\n",
                        paths.log.display()
                    ));
                }
                true
            }
            (Some(paths), Some(err)) => {
                write_stderr_fmt(format_args!(
                    "Writing crash log to {} failed: {err}\n",
                    paths.log.display()
                ));
                false
            }
            (None, _) => false,
        };

        // Nowhere else to put it
        if !written {
            write_stderr_bytes(out.as_str().as_bytes());
            write_stderr("Please attach the output above to any bug reports.\n");
        }
    }
}
