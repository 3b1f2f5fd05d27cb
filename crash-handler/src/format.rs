//! Integer formatting that is safe to use in a signal handler.
//!
//! `core::fmt` doesn't allocate, but it goes through trait objects and
//! padding logic we have no use for, these write straight into a fixed buffer
//! and leave a nul terminator behind so the result can go into an `argv`.

use std::ffi::CStr;

/// Enough for `u64::MAX` in decimal and the terminator
pub const UNSIGNED_LEN: usize = 22;
/// Enough for a 64-bit address in hex and the terminator
pub const ADDRESS_LEN: usize = 18;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Writes `value` in decimal, left justified, into `buf`
pub fn format_unsigned(value: u64, buf: &mut [u8; UNSIGNED_LEN]) -> &CStr {
    write_digits(value, 10, buf)
}

/// Writes `addr` as the minimal number of lower case hex digits, without a
/// `0x` prefix, into `buf`
pub fn format_address(addr: u64, buf: &mut [u8; ADDRESS_LEN]) -> &CStr {
    write_digits(addr, 16, buf)
}

fn write_digits(mut value: u64, radix: u64, buf: &mut [u8]) -> &CStr {
    let mut digits = [0u8; 20];
    let mut len = 0;

    loop {
        digits[len] = HEX[(value % radix) as usize];
        len += 1;
        value /= radix;
        if value == 0 {
            break;
        }
    }

    for (dst, src) in buf.iter_mut().zip(digits[..len].iter().rev()) {
        *dst = *src;
    }
    buf[len] = 0;

    // SAFETY: digits are never nul, and we just wrote the terminator
    unsafe { CStr::from_bytes_with_nul_unchecked(&buf[..=len]) }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unsigned() {
        let mut buf = [0xffu8; UNSIGNED_LEN];

        assert_eq!(format_unsigned(0, &mut buf).to_bytes(), b"0");
        assert_eq!(&buf[..2], b"0\0");

        assert_eq!(format_unsigned(1, &mut buf).to_bytes(), b"1");
        assert_eq!(
            format_unsigned(4294967295, &mut buf).to_bytes(),
            b"4294967295"
        );
        assert_eq!(&buf[..11], b"4294967295\0");

        assert_eq!(
            format_unsigned(u64::MAX, &mut buf).to_str().unwrap(),
            u64::MAX.to_string()
        );
    }

    #[test]
    fn address() {
        let mut buf = [0xffu8; ADDRESS_LEN];

        assert_eq!(format_address(0xdeadbeef, &mut buf).to_bytes(), b"deadbeef");
        assert_eq!(&buf[..9], b"deadbeef\0");

        assert_eq!(format_address(0, &mut buf).to_bytes(), b"0");
        assert_eq!(format_address(0x1000, &mut buf).to_bytes(), b"1000");
        assert_eq!(
            format_address(u64::MAX, &mut buf).to_bytes(),
            b"ffffffffffffffff"
        );
    }
}
