//! Bindings for the non-local goto used to recover from faults while copying
//! memory.
//!
//! ```
//! use memserver::jmp;
//!
//! unsafe {
//!     let mut jmp_buf = std::mem::MaybeUninit::uninit();
//!
//!     let val = jmp::sigsetjmp(jmp_buf.as_mut_ptr(), 1);
//!
//!     if val == 0 {
//!         jmp::siglongjmp(jmp_buf.as_mut_ptr(), 7);
//!     } else {
//!         assert_eq!(val, 7);
//!     }
//! }
//! ```

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        type Registers = [u64; 8];
    } else if #[cfg(target_arch = "x86")] {
        type Registers = [u32; 6];
    } else if #[cfg(target_arch = "arm")] {
        type Registers = [u64; 32];
    } else if #[cfg(target_arch = "aarch64")] {
        type Registers = [u64; 22];
    } else if #[cfg(target_arch = "riscv64")] {
        type Registers = [u64; 27];
    } else {
        compile_error!("unsupported target architecture for sigsetjmp");
    }
}

/// Storage for a [`sigsetjmp`] call site.
///
/// Holds the callee saved registers and, optionally, the signal mask at the
/// time `sigsetjmp` was called.
#[repr(C)]
pub struct JmpBuf {
    registers: Registers,
    mask_saved: u32,
    mask: [u32; 32],
}

unsafe extern "C" {
    /// Saves the current execution point, and the signal mask if `save_mask`
    /// is non-zero.
    ///
    /// Returns 0 when called directly, and the value passed to [`siglongjmp`]
    /// when control returns here through it.
    #[cfg_attr(target_env = "gnu", link_name = "__sigsetjmp")]
    pub fn sigsetjmp(jb: *mut JmpBuf, save_mask: i32) -> i32;
    /// Returns control to the matching [`sigsetjmp`], restoring the signal
    /// mask if it was saved. A `val` of 0 is returned as 1.
    pub fn siglongjmp(jb: *mut JmpBuf, val: i32) -> !;
}
