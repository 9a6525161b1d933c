//! Out-of-process minidumps.
//!
//! The crashing process tells the [`DumpServer`] where to write the dump,
//! asks it to dump the process, waits for the acknowledgement and finally
//! renames the finished dump to its deterministic path, so an interrupted
//! dump never shows up under the final name.

use crate::{DumpStatus, Error};
use std::{
    ffi::OsString,
    fs::File,
    io::{self, Write},
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
    ptr,
    sync::atomic::AtomicBool,
};

/// The message kind carrying the path the next dump should be written to
pub const DUMP_PATH_MESSAGE: u32 = 1;

/// The size of `CrashContext` can be too big w.r.t the size of the alternate
/// stack the signal handler runs on, so keep it as a .bss field.
static CRASH_CONTEXT: parking_lot::Mutex<crash_context::CrashContext> =
    parking_lot::const_mutex(unsafe { std::mem::zeroed() });

#[inline]
fn staging_path(path: &Path) -> PathBuf {
    path.with_extension("dmp.partial")
}

/// Requests a dump of the current process from the dump server, called from
/// within the signal handler.
pub(crate) fn request(
    server: &str,
    path: &Path,
    info: &libc::siginfo_t,
    context: &libc::ucontext_t,
) -> DumpStatus {
    match try_request(server, path, info, context) {
        Ok(()) => DumpStatus::Written,
        Err(_err) => {
            debug_print!("failed to write minidump");
            // Don't leave a half written dump lying around
            let _ = std::fs::remove_file(staging_path(path));
            DumpStatus::Failed
        }
    }
}

fn try_request(
    server: &str,
    path: &Path,
    info: &libc::siginfo_t,
    context: &libc::ucontext_t,
) -> Result<(), Error> {
    // Another thread crashing at the same time already owns the context, we
    // never wait on it
    let mut cc = CRASH_CONTEXT
        .try_lock()
        .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;

    // SAFETY: both pointers come straight from the kernel
    unsafe { fill_crash_context(&mut cc, info, context) };
    debug_print!("filled crash context");

    let client = minidumper::Client::with_name(server)?;

    let staging = staging_path(path);
    client.send_message(DUMP_PATH_MESSAGE, staging.as_os_str().as_bytes())?;

    {
        // Allow ourselves to be dumped while the server is writing
        let _set_dumpable = SetDumpable::new();
        client.request_dump(&cc)?;
    }
    debug_print!("minidump creation acked");

    std::fs::rename(&staging, path)?;
    Ok(())
}

unsafe fn fill_crash_context(
    cc: &mut crash_context::CrashContext,
    info: &libc::siginfo_t,
    uc: &libc::ucontext_t,
) {
    unsafe {
        ptr::write_bytes(cc, 0, 1);

        // The siginfo_t in libc is lowest common denominator, but this code is
        // specifically targeting linux/android, which contains the si_pid field
        // that we require
        let nix_info = &*(info as *const libc::siginfo_t).cast::<libc::signalfd_siginfo>();
        ptr::copy_nonoverlapping(nix_info, &mut cc.siginfo, 1);

        let uc_ptr = &*(uc as *const libc::ucontext_t).cast::<crash_context::ucontext_t>();
        ptr::copy_nonoverlapping(uc_ptr, &mut cc.context, 1);

        cfg_if::cfg_if! {
            if #[cfg(target_arch = "aarch64")] {
                let fp_ptr = uc_ptr.uc_mcontext.__reserved.as_ptr().cast::<crash_context::fpsimd_context>();

                if (*fp_ptr).head.magic == crash_context::FPSIMD_MAGIC {
                    ptr::copy_nonoverlapping(fp_ptr, &mut cc.float_state, 1);
                }
            } else if #[cfg(not(target_arch = "arm"))] {
                if !uc_ptr.uc_mcontext.fpregs.is_null() {
                    ptr::copy_nonoverlapping(uc_ptr.uc_mcontext.fpregs, ((&mut cc.float_state) as *mut crash_context::fpregset_t).cast(), 1);
                }
            }
        }

        cc.pid = std::process::id() as i32;
        cc.tid = libc::syscall(libc::SYS_gettid) as i32;
    }
}

/// We define these constants ourselves rather than use libc as they are missing
/// from eg. Android
const PR_GET_DUMPABLE: i32 = 3;
const PR_SET_DUMPABLE: i32 = 4;
const PR_SET_PTRACER: i32 = 0x59616d61;
const PR_SET_PTRACER_ANY: i32 = -1;

/// Helper that sets the process as dumpable, and ptraceable by the dump
/// server, and when dropped returns it back to the original state
struct SetDumpable {
    was_dumpable: bool,
}

impl SetDumpable {
    fn new() -> Self {
        // SAFETY: syscalls
        unsafe {
            let was_dumpable = libc::syscall(libc::SYS_prctl, PR_GET_DUMPABLE, 0, 0, 0, 0) > 0;

            if !was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 1, 0, 0, 0);
            }

            // We don't know the pid of the server, only its socket, so any
            // process is allowed to ptrace us. This is only needed if
            // `/proc/sys/kernel/yama/ptrace_scope` is 1, and harmless otherwise
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, PR_SET_PTRACER_ANY, 0, 0, 0);

            Self { was_dumpable }
        }
    }
}

impl Drop for SetDumpable {
    fn drop(&mut self) {
        // SAFETY: syscalls
        unsafe {
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, 0, 0, 0, 0);

            if !self.was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 0, 0, 0, 0);
            }
        }
    }
}

/// The server side of out-of-process dumps.
///
/// Runs in a different process (or at least not in one that is crashing),
/// and writes a minidump of each client that requests one to the path the
/// client sent just before.
pub struct DumpServer {
    server: minidumper::Server,
}

impl DumpServer {
    /// Creates a new server listening on the given socket name
    pub fn with_name(name: &str) -> Result<Self, Error> {
        Ok(Self {
            server: minidumper::Server::with_name(name)?,
        })
    }

    /// Runs the server loop until `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), Error> {
        self.server
            .run(Box::new(Handler::default()), shutdown, None)?;
        Ok(())
    }
}

#[derive(Default)]
struct Handler {
    /// Where the next dump goes. Clients crashing at the same time may race
    /// on this, which is accepted.
    staging: parking_lot::Mutex<Option<PathBuf>>,
}

impl minidumper::ServerHandler for Handler {
    fn create_minidump_file(&self) -> Result<(File, PathBuf), io::Error> {
        let path = self.staging.lock().take().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "client did not send the path for the dump",
            )
        })?;

        Ok((File::create(&path)?, path))
    }

    fn on_minidump_created(
        &self,
        result: Result<minidumper::MinidumpBinary, minidumper::Error>,
    ) -> minidumper::LoopAction {
        match result {
            Ok(mut md_bin) => {
                let _ = md_bin.file.flush();
                log::info!("wrote minidump to {}", md_bin.path.display());
            }
            Err(err) => {
                log::error!("failed to write minidump: {err:#}");
            }
        }

        minidumper::LoopAction::Continue
    }

    fn on_message(&self, kind: u32, buffer: Vec<u8>) {
        if kind == DUMP_PATH_MESSAGE {
            let path = PathBuf::from(OsString::from_vec(buffer));
            log::debug!("next minidump will be written to {}", path.display());
            *self.staging.lock() = Some(path);
        } else {
            log::warn!("ignoring message of unknown kind {kind}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use minidumper::ServerHandler;

    #[test]
    fn staging_name() {
        assert_eq!(
            staging_path(Path::new("/tmp/crash20240309170542.dmp")),
            Path::new("/tmp/crash20240309170542.dmp.partial")
        );
    }

    #[test]
    fn server_uses_sent_path() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Handler::default();

        assert_eq!(
            handler.create_minidump_file().unwrap_err().kind(),
            io::ErrorKind::NotFound
        );

        let expected = dir.path().join("crash.dmp.partial");
        handler.on_message(DUMP_PATH_MESSAGE, expected.as_os_str().as_bytes().to_vec());
        handler.on_message(DUMP_PATH_MESSAGE + 1, b"/nope".to_vec());

        let (_file, path) = handler.create_minidump_file().unwrap();
        assert_eq!(path, expected);
        assert!(expected.exists());

        // The path is only used once
        assert!(handler.create_minidump_file().is_err());
    }

    #[test]
    fn no_server_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.dmp");

        // SAFETY: zeroed is a valid, if meaningless, bit pattern for both
        let (info, context) = unsafe { (std::mem::zeroed(), std::mem::zeroed()) };

        assert_eq!(
            request("crash-log-no-such-server", &path, &info, &context),
            DumpStatus::Failed
        );
        assert!(!path.exists());
        assert!(!staging_path(&path).exists());
    }
}
