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

//! A memory server for crash reporting.
//!
//! When a process crashes, an external backtracer needs to read its memory,
//! but the usual ways of doing that (`ptrace`, `process_vm_readv` on another
//! process) require `CAP_SYS_PTRACE`, which containers rarely grant. Instead,
//! the crashing process starts a [`Server`] which answers [`Request`]s over a
//! socket, reading its own memory on the backtracer's behalf, and the
//! backtracer uses a [`Client`] on the other end.

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod client;
        mod errors;
        pub mod jmp;
        mod reader;
        mod server;

        pub use client::Client;
        pub use errors::Error;
        pub use reader::{FaultTrapReader, ProcessVmReader, ReadMemory, has_ptrace_capability};
        pub use server::{Handle, Mode, Server, serve, start};
    } else {
        compile_error!("the memory server is only implemented for Linux and Android");
    }
}

/// The maximum number of bytes served in a single chunk
pub const BUFFER_SIZE: usize = 4096;

/// A request to read `len` bytes starting at `addr`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Request {
    pub addr: u64,
    pub len: u64,
}

/// The header of a single chunk of a response.
///
/// A non-negative `len` is followed by exactly that many bytes of memory
/// starting at `addr`, a negative one is a negated errno with no payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Response {
    pub addr: u64,
    pub len: i64,
}

macro_rules! wire_record {
    ($rec:ty) => {
        impl $rec {
            pub const SIZE: usize = std::mem::size_of::<Self>();

            pub fn as_bytes(&self) -> &[u8] {
                unsafe {
                    let ptr = (self as *const Self).cast();
                    std::slice::from_raw_parts(ptr, Self::SIZE)
                }
            }

            pub fn from_bytes(buf: &[u8]) -> Option<Self> {
                if buf.len() != Self::SIZE {
                    return None;
                }

                unsafe { Some(buf.as_ptr().cast::<Self>().read_unaligned()) }
            }

            pub fn from_array(buf: [u8; Self::SIZE]) -> Self {
                unsafe { buf.as_ptr().cast::<Self>().read_unaligned() }
            }
        }
    };
}

wire_record!(Request);
wire_record!(Response);

#[cfg(feature = "debug-print")]
#[inline]
pub(crate) fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len() as _);
    }
}

#[cfg(feature = "debug-print")]
macro_rules! debug_print {
    ($s:literal) => {
        $crate::write_stderr(concat!("memserver: ", $s, "\n"));
    };
}

#[cfg(not(feature = "debug-print"))]
macro_rules! debug_print {
    ($s:literal) => {};
}

pub(crate) use debug_print;

#[cfg(test)]
mod test {
    use super::{Request, Response};

    #[test]
    fn record_sizes() {
        assert_eq!(Request::SIZE, 16);
        assert_eq!(Response::SIZE, 16);
    }

    #[test]
    fn error_response_bytes() {
        let expected = Response {
            addr: 0x1000,
            len: -(libc::EFAULT as i64),
        };

        let actual = Response::from_bytes(expected.as_bytes()).unwrap();
        assert_eq!(expected, actual);
        assert!(Response::from_bytes(&[0u8; 15]).is_none());
    }
}
