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

//! Records shared between a crashing process and the out-of-process
//! backtracer that reports on it.
//!
//! Every record here is `#[repr(C)]` and made up of 64-bit words so that the
//! backtracer, which only has access to the crashing process through a memory
//! server, can fetch a record with a single read and decode it with
//! [`CrashInfo::from_bytes`] or [`ThreadRecord::from_bytes`].


mod registry;

pub use registry::{Iter, ThreadList};

/// A single paused thread.
///
/// Records live on the stack of the signal handler invocation that paused the
/// thread, the [`ThreadList`] only links them together.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThreadRecord {
    /// Address of the next record in the list, or 0 for the last one
    pub next: u64,
    /// The kernel thread id
    pub tid: i64,
    /// Address of the `ucontext_t` the kernel handed to the signal handler
    pub context: u64,
}

impl ThreadRecord {
    /// The size of the record as read by a backtracer
    pub const SIZE: usize = std::mem::size_of::<Self>();

    #[inline]
    pub const fn new(tid: i64, context: u64) -> Self {
        Self {
            next: 0,
            tid,
            context,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            let ptr = (self as *const Self).cast();
            std::slice::from_raw_parts(ptr, Self::SIZE)
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }

        unsafe { Some(bytes.as_ptr().cast::<Self>().read_unaligned()) }
    }
}

/// The process wide description of a crash.
///
/// There is exactly one of these per process. It is only written by the
/// thread that won the crash race, and is read by the backtracer, which is
/// handed its address on the command line.
#[repr(C)]
#[derive(Debug)]
pub struct CrashInfo {
    /// The thread id of the crashing thread
    pub crashing_thread: u64,
    /// The signal that was raised
    pub signal: u64,
    /// `si_addr` of the signal, ie. the faulting address for memory faults
    pub fault_address: u64,
    /// Head of the list of paused threads, the crashing thread is always
    /// the last entry
    pub thread_list: ThreadList,
}

impl CrashInfo {
    /// The size of the record as read by a backtracer
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub const fn new() -> Self {
        Self {
            crashing_thread: 0,
            signal: 0,
            fault_address: 0,
            thread_list: ThreadList::new(),
        }
    }

    /// Decodes a record that was copied out of another process
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }

        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            u64::from_ne_bytes(w)
        };

        Some(Self {
            crashing_thread: word(0),
            signal: word(1),
            fault_address: word(2),
            thread_list: ThreadList::with_head(word(3)),
        })
    }
}

impl Default for CrashInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(ThreadRecord::SIZE, 24);
        assert_eq!(CrashInfo::SIZE, 32);
        assert_eq!(std::mem::align_of::<CrashInfo>(), 8);
    }

    #[test]
    fn thread_record_bytes() {
        let expected = ThreadRecord {
            next: 0x7fff_0000_1000,
            tid: 4242,
            context: 0x7fff_0000_2000,
        };

        let actual = ThreadRecord::from_bytes(expected.as_bytes()).unwrap();
        assert_eq!(expected, actual);
        assert!(ThreadRecord::from_bytes(&expected.as_bytes()[1..]).is_none());
    }

    #[test]
    fn crash_info_from_remote_bytes() {
        let mut bytes = Vec::new();
        for word in [1234u64, 11, 0xdead_beef, 0x7fff_1000] {
            bytes.extend_from_slice(&word.to_ne_bytes());
        }

        let ci = CrashInfo::from_bytes(&bytes).unwrap();
        assert_eq!(ci.crashing_thread, 1234);
        assert_eq!(ci.signal, 11);
        assert_eq!(ci.fault_address, 0xdead_beef);
        assert_eq!(ci.thread_list.head(), 0x7fff_1000);
    }
}
