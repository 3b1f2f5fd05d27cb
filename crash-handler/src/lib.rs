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

//! [`CrashHandler`] freezes a crashing process and hands it over to an
//! external backtracer, which does all of the actual work of unwinding,
//! symbolicating and printing the crash from outside of the process.
//!
//! # Signals
//!
//! The following signals are handled, but only if nothing else in the process
//! already installed a handler for them.
//!
//! ## `SIGABRT`
//!
//! Signal sent to a process to tell it to abort, i.e. to terminate. The signal
//! is usually initiated by the process itself when it calls `std::process::abort`
//! or `libc::abort`, but it can be sent to the process from outside like any
//! other signal.
//!
//! ## `SIGBUS`
//!
//! Signal sent to a process when it causes a [bus error](https://en.wikipedia.org/wiki/Bus_error).
//!
//! ## `SIGFPE`
//!
//! Signal sent to a process when it executes an erroneous arithmetic operation.
//!
//! ## `SIGILL`
//!
//! Signal sent to a process when it attempts to execute an **illegal**, malformed,
//! unknown, or privileged, instruction.
//!
//! ## `SIGQUIT`
//!
//! Signal sent to a process when the user asks it to quit and dump core,
//! usually with `Ctrl+\`. Handling it gives a backtrace of a hung process.
//!
//! ## `SIGSEGV`
//!
//! Signal sent to a process when it makes an invalid virtual memory reference,
//! a [segmentation fault](https://en.wikipedia.org/wiki/Segmentation_fault).
//!
//! ## `SIGTRAP`
//!
//! Signal sent to a process when a trap is raised, eg. a breakpoint or debug
//! assertion.
//!
//! # The crash sequence
//!
//! When one of the signals is raised, the handler, running on an alternate
//! signal stack:
//!
//! 1. takes the global thread lock and pauses every other thread with
//!    `SIGPROF`, each paused thread links a [`ThreadRecord`] into the
//!    [`ThreadList`] and waits until the crash has been handled
//! 1. resets the fatal signals to their default dispositions, so that a crash
//!    while handling a crash kills the process outright
//! 1. fills in the process wide [`CrashInfo`]
//! 1. starts a [`memserver`] so the backtracer can read our memory without
//!    needing any privileges
//! 1. runs the backtracer and waits for it to exit
//! 1. lets the paused threads go, releases the lock once they have left
//!    the pause handler, and lets the signal kill the process as it normally
//!    would
//!
//! None of the above allocates or takes locks other than the thread lock, so
//! everything the sequence needs, [`Settings`] included, is prepared by
//! [`CrashHandler::attach`].


mod error;
pub mod format;
mod settings;

pub use crash_info::{CrashInfo, ThreadList, ThreadRecord};
pub use error::Error;
pub use settings::{
    ENV_VAR, Images, OutputTo, Preset, Registers, Sanitize, Settings, Threads, Toggle, Unwind,
};

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!("crash-handler: ", $s, "\n");
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
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::{
            backtracer::{BacktracerArgs, ExecSpawner, SpawnBacktracer, MEMSERVER_FD},
            crash_state, install_signal_handlers, suspend_threads, suspend_threads_with,
            threads::{gettid, ProcTaskDir, ThreadSource},
            CrashHandler, CrashState, Signal, Suspension, SUSPEND_TIMEOUT,
        };
    } else {
        compile_error!("crash-handler only supports Linux and Android");
    }
}
