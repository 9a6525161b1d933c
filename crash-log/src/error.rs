/// An error that can occur while setting up crash handling, or while running
/// the dump server. Nothing in the crash path itself returns one of these.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Unable to `mmap` memory for an alternate signal stack
    #[error("unable to allocate memory")]
    OutOfMemory,
    /// For simplicity sake, only one [`crate::CrashLogHandler`] can be
    /// installed at any one time.
    #[error("a crash handler is already installed")]
    HandlerAlreadyInstalled,
    /// An I/O or other syscall failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The dump server or client failed
    #[cfg(all(feature = "minidump", any(target_os = "linux", target_os = "android")))]
    #[error(transparent)]
    Dump(#[from] minidumper::Error),
}
