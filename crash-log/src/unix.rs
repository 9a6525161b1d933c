#[cfg(all(feature = "minidump", any(target_os = "linux", target_os = "android")))]
pub(crate) mod dump;
mod state;
mod writer;

pub use writer::UnixReport;

use crate::{CrashLog, Error};

/// The fatal signals that are handled
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    Segv = libc::SIGSEGV,
    Abort = libc::SIGABRT,
    Fpe = libc::SIGFPE,
    Bus = libc::SIGBUS,
    Illegal = libc::SIGILL,
}

/// Every signal handled by the [`CrashLogHandler`], in installation order
pub const SIGNALS: [Signal; 5] = [
    Signal::Segv,
    Signal::Abort,
    Signal::Fpe,
    Signal::Bus,
    Signal::Illegal,
];

impl Signal {
    /// Maps a raw signal number to one of the handled signals
    #[inline]
    pub fn from_raw(sig: i32) -> Option<Self> {
        SIGNALS.into_iter().find(|s| *s as i32 == sig)
    }

    /// The canonical description of the signal, as `strsignal` would
    /// provide, without the locale and thread safety issues of calling it
    #[inline]
    pub fn description(self) -> &'static str {
        match self {
            Self::Segv => "Segmentation fault",
            Self::Abort => "Aborted",
            Self::Fpe => "Floating point exception",
            Self::Bus => "Bus error",
            Self::Illegal => "Illegal instruction",
        }
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Segv => "SIGSEGV",
            Self::Abort => "SIGABRT",
            Self::Fpe => "SIGFPE",
            Self::Bus => "SIGBUS",
            Self::Illegal => "SIGILL",
        }
    }
}

/// The installed signal handlers.
///
/// Only one can be installed at a time. Detaching, explicitly or on drop,
/// restores whatever handlers were installed before, and must not race with
/// a crash in progress.
pub struct CrashLogHandler;

impl CrashLogHandler {
    /// Installs the handler for every signal in [`SIGNALS`], and sets up an
    /// alternate signal stack for the calling thread.
    ///
    /// When one of the signals is received, the handler first restores the
    /// default disposition of all of them, then runs
    /// [`CrashLog::make_crash_log`] and finally aborts.
    pub fn install(crash_log: CrashLog) -> Result<Self, Error> {
        state::attach(crash_log)?;
        Ok(Self)
    }

    /// Detaches the handler.
    ///
    /// This is done automatically when this [`CrashLogHandler`] is dropped.
    #[inline]
    pub fn detach(self) {
        state::detach();
    }
}

impl Drop for CrashLogHandler {
    fn drop(&mut self) {
        state::detach();
    }
}

/// Prepares the calling thread for crash handling by installing an
/// alternate signal stack, so that a stack overflow on it can still be
/// reported.
///
/// Threads spawned by [`std::thread`] already have one, in which case this
/// does nothing. Call [`teardown_thread`] before the thread exits to release
/// the stack.
#[inline]
pub fn init_thread() -> Result<(), Error> {
    // SAFETY: syscalls
    unsafe { state::install_sigaltstack() }
}

/// Releases the alternate signal stack installed by [`init_thread`]
#[inline]
pub fn teardown_thread() {
    // SAFETY: syscalls
    unsafe { state::restore_sigaltstack() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signal_set() {
        assert_eq!(
            SIGNALS.map(|s| s as i32),
            [
                libc::SIGSEGV,
                libc::SIGABRT,
                libc::SIGFPE,
                libc::SIGBUS,
                libc::SIGILL
            ]
        );

        for sig in SIGNALS {
            assert_eq!(Signal::from_raw(sig as i32), Some(sig));
        }

        assert_eq!(Signal::from_raw(libc::SIGINT), None);
        assert_eq!(Signal::from_raw(libc::SIGTERM), None);
        assert_eq!(Signal::from_raw(libc::SIGTRAP), None);
        assert_eq!(Signal::Segv.description(), "Segmentation fault");
    }
}
