use super::Signal;
use crate::{
    DumpStatus, PlatformReport, ReportBuffer, Settings,
    report::write_stacktrace,
};
use std::{ffi::CStr, fmt::Write, io, path::Path};

/// The POSIX [`PlatformReport`], created by the signal handler for the
/// signal that was received.
pub struct UnixReport<'crash> {
    signal: Signal,
    settings: &'crash Settings,
    #[cfg_attr(
        not(all(feature = "minidump", any(target_os = "linux", target_os = "android"))),
        allow(dead_code)
    )]
    info: Option<&'crash libc::siginfo_t>,
    context: Option<&'crash libc::ucontext_t>,
}

impl<'crash> UnixReport<'crash> {
    /// Creates a report for `signal` without any machine context, so the
    /// registers section is omitted and no dump can be requested.
    #[inline]
    pub fn new(signal: Signal, settings: &'crash Settings) -> Self {
        Self::from_signal(signal, settings, None, None)
    }

    #[inline]
    pub(crate) fn from_signal(
        signal: Signal,
        settings: &'crash Settings,
        info: Option<&'crash libc::siginfo_t>,
        context: Option<&'crash libc::ucontext_t>,
    ) -> Self {
        Self {
            signal,
            settings,
            info,
            context,
        }
    }
}

/// The fields of `uname` we report
pub(crate) struct Uname {
    sysname: String,
    release: String,
    version: String,
    machine: String,
}

pub(crate) fn uname() -> io::Result<Uname> {
    // SAFETY: syscall, the strings are nul terminated on success
    unsafe {
        let mut name: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut name) < 0 {
            return Err(io::Error::last_os_error());
        }

        let field = |f: &[libc::c_char]| CStr::from_ptr(f.as_ptr()).to_string_lossy().into_owned();

        Ok(Uname {
            sysname: field(&name.sysname),
            release: field(&name.release),
            version: field(&name.version),
            machine: field(&name.machine),
        })
    }
}

pub(crate) fn write_os_version(out: &mut ReportBuffer, name: io::Result<Uname>) {
    match name {
        Ok(name) => {
            let _ = write!(
                out,
                "Operating system:\n \
                Name:     {}\n \
                Release:  {}\n \
                Version:  {}\n \
                Machine:  {}\n",
                name.sysname, name.release, name.version, name.machine,
            );
        }
        Err(err) => {
            let _ = writeln!(out, "Could not get OS version: {err}");
        }
    }
}

impl PlatformReport for UnixReport<'_> {
    fn log_os_version(&self, out: &mut ReportBuffer) {
        write_os_version(out, uname());
    }

    fn log_error(&self, out: &mut ReportBuffer, message: &str) {
        let _ = write!(
            out,
            "Crash reason:\n \
            Signal:  {} ({})\n \
            Message: {}\n\n",
            self.signal.description(),
            self.signal as i32,
            message,
        );
    }

    fn log_stacktrace(&self, out: &mut ReportBuffer) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "stacktrace")] {
                let mut frames = [std::ptr::null_mut(); crate::settings::MAX_FRAMES];
                let count = stack::capture(&mut frames, self.settings.frame_limit());
                write_stacktrace(out, Some(frames[..count].iter().map(|ip| stack::Frame(*ip))));
            } else {
                let _ = self.settings;
                write_stacktrace::<[&str; 0]>(out, None);
            }
        }
    }

    fn log_registers(&self, out: &mut ReportBuffer) {
        if let Some(context) = self.context {
            registers::write(out, context);
        }
    }

    fn write_crash_dump(&mut self, path: &Path) -> DumpStatus {
        cfg_if::cfg_if! {
            if #[cfg(all(feature = "minidump", any(target_os = "linux", target_os = "android")))] {
                match (&self.settings.dump_server, self.info, self.context) {
                    (Some(server), Some(info), Some(context)) => {
                        super::dump::request(server, path, info, context)
                    }
                    _ => DumpStatus::Unsupported,
                }
            } else {
                let _ = path;
                DumpStatus::Unsupported
            }
        }
    }
}

#[cfg(feature = "stacktrace")]
mod stack {
    use std::{ffi::c_void, fmt};

    /// Walks the stack of the current thread, storing at most `limit` return
    /// addresses. Returns the number of frames captured.
    #[inline(never)]
    pub(super) fn capture(frames: &mut [*mut c_void], limit: usize) -> usize {
        let limit = limit.min(frames.len());
        let mut count = 0;

        if limit == 0 {
            return 0;
        }

        // SAFETY: the synchronized variant takes a lock, which the crashing
        // thread might already hold
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                frames[count] = frame.ip();
                count += 1;
                count < limit
            });
        }

        count
    }

    /// A single captured frame, symbolized when displayed
    pub(super) struct Frame(pub(super) *mut c_void);

    impl fmt::Display for Frame {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let mut result = None;

            // SAFETY: see capture
            unsafe {
                backtrace::resolve_unsynchronized(self.0, |symbol| {
                    // Inlined functions resolve to multiple symbols, the
                    // first is the innermost
                    if result.is_some() {
                        return;
                    }

                    result = Some((|| -> fmt::Result {
                        write!(f, "{:p} ", self.0)?;
                        match symbol.name() {
                            Some(name) => write!(f, "{name:#}")?,
                            None => f.write_str("<unknown>")?,
                        }

                        if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                            write!(f, " ({}:{line})", file.display())?;
                        }

                        Ok(())
                    })());
                });
            }

            result.unwrap_or_else(|| write!(f, "{:p}", self.0))
        }
    }
}

mod registers {
    use crate::ReportBuffer;
    use std::fmt::Write;

    fn write_regs(out: &mut ReportBuffer, regs: &[(&str, u64)]) {
        out.push_str("Registers:\n");

        for line in regs.chunks(4) {
            for (name, value) in line {
                let _ = write!(out, " {name:>6}: 0x{value:016x}");
            }
            out.push('\n');
        }

        out.push('\n');
    }

    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
            pub(super) fn write(out: &mut ReportBuffer, context: &libc::ucontext_t) {
                let gregs = &context.uc_mcontext.gregs;
                let reg = |i: libc::c_int| gregs[i as usize] as u64;

                write_regs(
                    out,
                    &[
                        ("rax", reg(libc::REG_RAX)),
                        ("rbx", reg(libc::REG_RBX)),
                        ("rcx", reg(libc::REG_RCX)),
                        ("rdx", reg(libc::REG_RDX)),
                        ("rsi", reg(libc::REG_RSI)),
                        ("rdi", reg(libc::REG_RDI)),
                        ("rbp", reg(libc::REG_RBP)),
                        ("rsp", reg(libc::REG_RSP)),
                        ("r8", reg(libc::REG_R8)),
                        ("r9", reg(libc::REG_R9)),
                        ("r10", reg(libc::REG_R10)),
                        ("r11", reg(libc::REG_R11)),
                        ("r12", reg(libc::REG_R12)),
                        ("r13", reg(libc::REG_R13)),
                        ("r14", reg(libc::REG_R14)),
                        ("r15", reg(libc::REG_R15)),
                        ("rip", reg(libc::REG_RIP)),
                        ("eflags", reg(libc::REG_EFL)),
                    ],
                );
            }
        } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
            pub(super) fn write(out: &mut ReportBuffer, context: &libc::ucontext_t) {
                const NAMES: [&str; 31] = [
                    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10",
                    "x11", "x12", "x13", "x14", "x15", "x16", "x17", "x18", "x19", "x20",
                    "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28", "fp", "lr",
                ];

                let mc = &context.uc_mcontext;
                let mut regs = [("", 0u64); 34];
                for (slot, (name, value)) in regs.iter_mut().zip(NAMES.iter().zip(mc.regs.iter())) {
                    *slot = (*name, *value);
                }
                regs[31] = ("sp", mc.sp);
                regs[32] = ("pc", mc.pc);
                regs[33] = ("pstate", mc.pstate);

                write_regs(out, &regs);
            }
        } else {
            /// Registers are only rendered for targets whose machine context
            /// layout we know
            pub(super) fn write(_out: &mut ReportBuffer, _context: &libc::ucontext_t) {}
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn four_per_line() {
            let mut out = ReportBuffer::new();
            write_regs(
                &mut out,
                &[("rax", 1), ("rbx", 0xdead_beef), ("rcx", 3), ("rdx", 4), ("rip", u64::MAX)],
            );

            assert_eq!(
                out.as_str(),
                "Registers:\n    \
                rax: 0x0000000000000001    rbx: 0x00000000deadbeef    rcx: 0x0000000000000003    rdx: 0x0000000000000004\n    \
                rip: 0xffffffffffffffff\n\n"
            );
        }
    }
}
