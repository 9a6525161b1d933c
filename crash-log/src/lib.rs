//! `crash-log` writes a best effort, human readable crash report when the
//! process receives a fatal signal, optionally requests a minidump from an
//! out-of-process dump server, runs a user supplied cleanup hook and then
//! aborts the process.
//!
//! # Signals
//!
//! The following signals are handled, all of which indicate that the state of
//! the process may be corrupted. Benign signals are never touched.
//!
//! ## `SIGSEGV`
//!
//! Signal sent to a process when it makes an invalid virtual memory reference,
//! a [segmentation fault](https://en.wikipedia.org/wiki/Segmentation_fault).
//!
//! ## `SIGABRT`
//!
//! Signal sent to a process to tell it to abort. Usually raised by the process
//! itself via `std::process::abort` or `libc::abort`.
//!
//! ## `SIGFPE`
//!
//! Signal sent to a process when it executes an erroneous arithmetic operation,
//! integer division by zero included.
//!
//! ## `SIGBUS`
//!
//! Signal sent to a process when it causes a [bus error](https://en.wikipedia.org/wiki/Bus_error).
//!
//! ## `SIGILL`
//!
//! Signal sent to a process when it attempts to execute an illegal, malformed,
//! unknown, or privileged, instruction.
//!
//! # Crash handling
//!
//! The very first thing the signal handler does is restore the default
//! disposition of every handled signal, so that a second fault while the
//! report is being written terminates the process through the default action
//! instead of recursing into the handler.
//!
//! The report is produced *inside* the signal handler. Formatting, heap
//! allocation, file I/O and symbolization are not
//! [async signal safe](https://man7.org/linux/man-pages/man7/signal-safety.7.html),
//! so producing the report is a best effort that may itself fault, in which
//! case the default action takes over and whatever sections were already
//! flushed to disk remain there. The process always ends with `abort`.

// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:
#![allow(unsafe_code)]

mod coordinator;
mod error;
mod paths;
mod report;
mod settings;

pub use coordinator::{CrashHooks, CrashLog, EscapeReason, NoHooks, Outcome, Stage};
pub use error::Error;
pub use paths::ArtifactPaths;
pub use report::{
    DumpStatus, PlatformReport, ReportBuffer, StateSection, clear_error_message,
    set_error_message,
};
pub use settings::Settings;

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    write_stderr_bytes(s.as_bytes());
}

/// Formats and writes directly to stderr, without taking the lock that
/// [`std::io::stderr`] guards it with, as the crashed thread may have
/// interrupted, or be racing, its holder
pub(crate) fn write_stderr_fmt(args: std::fmt::Arguments<'_>) {
    match args.as_str() {
        Some(s) => write_stderr_bytes(s.as_bytes()),
        None => write_stderr_bytes(args.to_string().as_bytes()),
    }
}

pub(crate) fn write_stderr_bytes(mut buf: &[u8]) {
    while !buf.is_empty() {
        // SAFETY: syscall, the buffer is valid for its length
        let written = unsafe { libc::write(2, buf.as_ptr().cast(), buf.len() as _) };

        if written > 0 {
            buf = &buf[written as usize..];
        } else if written == 0
            || std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted
        {
            break;
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;

        pub use unix::{CrashLogHandler, Signal, SIGNALS, UnixReport, init_thread, teardown_thread};

        #[cfg(all(feature = "minidump", any(target_os = "linux", target_os = "android")))]
        pub use unix::dump::{DUMP_PATH_MESSAGE, DumpServer};
    }
}
