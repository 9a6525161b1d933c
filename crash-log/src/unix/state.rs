use super::{SIGNALS, Signal, UnixReport};
use crate::{CrashLog, Error, Stage, coordinator};
use std::{
    cell::RefCell,
    mem, ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

// std::cmp::max is not const :(
const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > 1024 * 1024 {
        libc::SIGSTKSZ
    } else {
        1024 * 1024
    }
}

/// The size of the alternate stack that is mapped for a thread.
///
/// The handler formats the report and symbolizes the stack trace while
/// running on this stack, which needs far more than `SIGSTKSZ`. The memory is
/// only committed as the handler touches it, so the 1MiB minimum costs
/// nothing until a crash actually occurs
const SIG_STACK_SIZE: usize = get_stack_size();

struct StackSave {
    old: Option<libc::stack_t>,
    new: libc::stack_t,
    mapping: (*mut libc::c_void, usize),
}

thread_local! {
    static STACK_SAVE: RefCell<Option<StackSave>> = const { RefCell::new(None) };
}

/// Create an alternative stack to run the signal handler on. This is done since
/// the signal might have been caused by a stack overflow.
pub(super) unsafe fn install_sigaltstack() -> Result<(), Error> {
    unsafe {
        // Check to see if the existing sigaltstack, and if it exists, is it big
        // enough. If so we don't need to allocate our own.
        let mut old_stack = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old_stack) == -1 {
            return Err(std::io::Error::last_os_error().into());
        }

        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
            return Ok(());
        }

        // ... but failing that we need to allocate our own, with a guard page
        // below it
        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let alloc_size = guard_size + SIG_STACK_SIZE;

        let map = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if map == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }

        let stack_ptr = map.cast::<u8>().add(guard_size).cast::<libc::c_void>();
        if libc::mprotect(
            stack_ptr,
            SIG_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
        ) == -1
        {
            let err = std::io::Error::last_os_error();
            libc::munmap(map, alloc_size);
            return Err(err.into());
        }

        let new_stack = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: SIG_STACK_SIZE,
        };
        if libc::sigaltstack(&new_stack, ptr::null_mut()) == -1 {
            let err = std::io::Error::last_os_error();
            libc::munmap(map, alloc_size);
            return Err(err.into());
        }

        log::debug!("installed {SIG_STACK_SIZE} byte alternate signal stack");

        STACK_SAVE.with_borrow_mut(|ss| {
            *ss = Some(StackSave {
                old: (old_stack.ss_flags & libc::SS_DISABLE == 0).then_some(old_stack),
                new: new_stack,
                mapping: (map, alloc_size),
            });
        });

        Ok(())
    }
}

pub(super) unsafe fn restore_sigaltstack() {
    let Some(ss) = STACK_SAVE.with_borrow_mut(Option::take) else {
        return;
    };

    unsafe {
        // Only restore the old stack if the current alternative stack is the
        // one installed by the call to install_sigaltstack. If we can't tell,
        // assume it is.
        let mut current_stack: libc::stack_t = mem::zeroed();
        let is_ours = libc::sigaltstack(ptr::null(), &mut current_stack) == -1
            || current_stack.ss_sp == ss.new.ss_sp;

        if is_ours && !replace_sigaltstack(ss.old) {
            // The kernel still points at the mapping, unmapping it would leave
            // the thread with a dangling alternate stack
            log::warn!(
                "failed to uninstall alternate signal stack: {}",
                std::io::Error::last_os_error()
            );
            return;
        }

        let r = libc::munmap(ss.mapping.0, ss.mapping.1);
        debug_assert_eq!(r, 0, "munmap of alternate signal stack failed");
    }
}

/// Replaces the current alternate stack with `old`, or disables it if there
/// was none or `old` can't be restored. Returns false if the current stack is
/// still installed.
unsafe fn replace_sigaltstack(old: Option<libc::stack_t>) -> bool {
    unsafe {
        if let Some(old) = old {
            if libc::sigaltstack(&old, ptr::null_mut()) == 0 {
                return true;
            }
        }

        let mut disable: libc::stack_t = mem::zeroed();
        disable.ss_flags = libc::SS_DISABLE;
        libc::sigaltstack(&disable, ptr::null_mut()) == 0
    }
}

/// Restores the signal handler for the specified signal back to its default
/// handler, which _should_ perform the default signal action as seen in
/// <https://man7.org/linux/man-pages/man7/signal.7.html>
#[inline]
unsafe fn install_default_handler(sig: Signal) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones. There is a bug in these functions where a request to set the handler
    // to SIG_DFL is ignored. In that case, an infinite loop is entered as the
    // signal is repeatedly sent to our signal handler.
    // To work around this, directly call the system's sigaction.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                let mut sa: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut sa.sa_mask);
                sa.sa_sigaction = libc::SIG_DFL;
                sa.sa_flags = libc::SA_RESTART;
                libc::syscall(
                    libc::SYS_rt_sigaction,
                    sig as i32,
                    &sa,
                    ptr::null::<libc::sigaction>(),
                    mem::size_of::<libc::sigset_t>(),
                );
            } else {
                libc::signal(sig as i32, libc::SIG_DFL);
            }
        }
    }
}

/// Disables our handling of every signal. This is the very first thing the
/// signal handler does, so that a fault while handling the crash terminates
/// the process rather than recursing.
#[inline]
unsafe fn disable_handlers() {
    for sig in SIGNALS {
        unsafe { install_default_handler(sig) };
    }
}

/// The handlers that were installed before ours, restored on detach
static OLD_HANDLERS: parking_lot::Mutex<Option<[libc::sigaction; SIGNALS.len()]>> =
    parking_lot::const_mutex(None);

/// The crash log invoked by the signal handler.
///
/// This is intentionally not behind a lock, the signal handler may be running
/// on a thread that interrupted the holder of any lock we could take.
static CRASH_LOG: AtomicPtr<CrashLog> = AtomicPtr::new(ptr::null_mut());

/// Restores all of the signal handlers back to their previous values, or the
/// default if the previous value cannot be restored
unsafe fn restore_handlers(old: &[libc::sigaction; SIGNALS.len()]) {
    unsafe {
        for (sig, action) in SIGNALS.into_iter().zip(old.iter()) {
            if libc::sigaction(sig as i32, action, ptr::null_mut()) == -1 {
                install_default_handler(sig);
            }
        }
    }
}

unsafe fn install_handlers() -> Result<[libc::sigaction; SIGNALS.len()], Error> {
    unsafe {
        // Store all of the current handlers so we can restore them later
        let mut old_handlers: [libc::sigaction; SIGNALS.len()] = mem::zeroed();

        for (sig, old) in SIGNALS.into_iter().zip(old_handlers.iter_mut()) {
            if libc::sigaction(sig as i32, ptr::null(), old) == -1 {
                return Err(std::io::Error::last_os_error().into());
            }
        }

        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Mask all of the crash signals while we're handling one of them.
        for sig in SIGNALS {
            libc::sigaddset(&mut sa.sa_mask, sig as i32);
        }

        sa.sa_sigaction = signal_handler as *const () as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

        for sig in SIGNALS {
            // At this point it is impractical to back out changes, and so failure to
            // install a signal is intentionally ignored.
            if libc::sigaction(sig as i32, &sa, ptr::null_mut()) == -1 {
                log::warn!(
                    "failed to install handler for {}: {}",
                    sig.as_str(),
                    std::io::Error::last_os_error()
                );
            }
        }

        Ok(old_handlers)
    }
}

pub(super) fn attach(crash_log: CrashLog) -> Result<(), Error> {
    let mut ohl = OLD_HANDLERS.lock();

    if ohl.is_some() {
        return Err(Error::HandlerAlreadyInstalled);
    }

    // SAFETY: syscalls
    unsafe {
        install_sigaltstack()?;
    }

    coordinator::filter_panic_output();

    let previous = CRASH_LOG.swap(Box::into_raw(Box::new(crash_log)), Ordering::AcqRel);
    debug_assert!(previous.is_null());

    // SAFETY: syscalls
    match unsafe { install_handlers() } {
        Ok(old) => {
            *ohl = Some(old);
            log::info!("crash log handler installed");
            Ok(())
        }
        Err(err) => {
            drop_crash_log();
            // SAFETY: syscalls
            unsafe { restore_sigaltstack() };
            Err(err)
        }
    }
}

/// Detaches our signal handler, restoring the previously installed or default
/// handlers
pub(super) fn detach() {
    let mut ohl = OLD_HANDLERS.lock();

    if let Some(old) = ohl.take() {
        // SAFETY: syscalls
        unsafe {
            restore_handlers(&old);
            restore_sigaltstack();
        }

        drop_crash_log();
        log::info!("crash log handler detached");
    }
}

fn drop_crash_log() {
    let crash_log = CRASH_LOG.swap(ptr::null_mut(), Ordering::AcqRel);
    if !crash_log.is_null() {
        // SAFETY: the pointer came from Box::into_raw in attach, and the swap
        // guarantees we are its only owner now
        drop(unsafe { Box::from_raw(crash_log) });
    }
}

/// This is the actual function installed for each signal we support, invoked
/// by the kernel.
///
/// Never returns, the process is aborted once the crash has been handled.
unsafe extern "C" fn signal_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        disable_handlers();
        debug_print!("disabled signal handlers");

        coordinator::quiet_panics();

        let crash_log = CRASH_LOG.load(Ordering::Acquire).as_ref();

        if let (Some(signal), Some(crash_log)) = (Signal::from_raw(sig), crash_log) {
            crash_log.enter(Stage::Triggered);

            let mut report = UnixReport::from_signal(
                signal,
                crash_log.settings(),
                info.as_ref(),
                uc.cast::<libc::ucontext_t>().as_ref(),
            );

            let _outcome = crash_log.make_crash_log(&mut report);
            debug_print!("crash log finished");

            crash_log.enter(Stage::Terminated);
        }

        libc::abort();
    }
}

#[cfg(test)]
pub(super) mod test {
    use super::*;

    /// Serializes tests that map and unmap alternate stacks, so that one
    /// doesn't observe the mapping of another
    pub(in crate::unix) static ALT_STACK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    #[test]
    fn alternate_stack() {
        let _serial = ALT_STACK.lock();

        std::thread::spawn(|| unsafe {
            let mut before: libc::stack_t = mem::zeroed();
            assert_eq!(libc::sigaltstack(ptr::null(), &mut before), 0);

            // Disable whatever std installed so we are forced to map our own
            let mut disable: libc::stack_t = mem::zeroed();
            disable.ss_flags = libc::SS_DISABLE;
            assert_eq!(libc::sigaltstack(&disable, ptr::null_mut()), 0);

            install_sigaltstack().unwrap();

            let mut current: libc::stack_t = mem::zeroed();
            assert_eq!(libc::sigaltstack(ptr::null(), &mut current), 0);
            assert_eq!(current.ss_flags & libc::SS_DISABLE, 0);
            assert_eq!(current.ss_size, SIG_STACK_SIZE);

            // A second install is a no-op as the stack is already big enough
            install_sigaltstack().unwrap();
            let mapping = STACK_SAVE.with_borrow(|ss| ss.as_ref().unwrap().mapping);
            assert!(is_mapped(mapping));

            restore_sigaltstack();
            assert!(!is_mapped(mapping));

            assert_eq!(libc::sigaltstack(ptr::null(), &mut current), 0);
            assert_ne!(current.ss_flags & libc::SS_DISABLE, 0);
            assert!(STACK_SAVE.with_borrow(Option::is_none));

            // Put std's stack back so thread exit cleans it up as usual
            if before.ss_flags & libc::SS_DISABLE == 0 {
                assert_eq!(libc::sigaltstack(&before, ptr::null_mut()), 0);
            }
        })
        .join()
        .unwrap();
    }

    /// Our stack is released even if something else replaced it in the
    /// meantime, in which case the replacement is left alone
    #[test]
    fn replaced_stack_is_unmapped() {
        let _serial = ALT_STACK.lock();

        std::thread::spawn(|| unsafe {
            let mut before: libc::stack_t = mem::zeroed();
            assert_eq!(libc::sigaltstack(ptr::null(), &mut before), 0);

            let mut disable: libc::stack_t = mem::zeroed();
            disable.ss_flags = libc::SS_DISABLE;
            assert_eq!(libc::sigaltstack(&disable, ptr::null_mut()), 0);

            install_sigaltstack().unwrap();
            let mapping = STACK_SAVE.with_borrow(|ss| ss.as_ref().unwrap().mapping);

            let mut other = vec![0u8; 64 * 1024];
            let replacement = libc::stack_t {
                ss_sp: other.as_mut_ptr().cast(),
                ss_flags: 0,
                ss_size: other.len(),
            };
            assert_eq!(libc::sigaltstack(&replacement, ptr::null_mut()), 0);

            restore_sigaltstack();
            assert!(!is_mapped(mapping));
            assert!(STACK_SAVE.with_borrow(Option::is_none));

            let mut current: libc::stack_t = mem::zeroed();
            assert_eq!(libc::sigaltstack(ptr::null(), &mut current), 0);
            assert_eq!(current.ss_sp, replacement.ss_sp);

            assert_eq!(libc::sigaltstack(&disable, ptr::null_mut()), 0);
            drop(other);

            if before.ss_flags & libc::SS_DISABLE == 0 {
                assert_eq!(libc::sigaltstack(&before, ptr::null_mut()), 0);
            }
        })
        .join()
        .unwrap();
    }

    /// `mincore` fails with `ENOMEM` for ranges that are not mapped
    fn is_mapped((addr, len): (*mut libc::c_void, usize)) -> bool {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mut residency = vec![0u8; len.div_ceil(page_size)];

        // SAFETY: syscall, the residency vector has an entry per page
        unsafe { libc::mincore(addr, len, residency.as_mut_ptr().cast()) == 0 }
    }
}
