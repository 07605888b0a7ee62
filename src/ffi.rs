//! C ABI matching `libkrw.h`.
//!
//! Every function returns `0` on success or an errno-style status code.
//! Output parameters are left unchanged on failure.

use core::ffi::{c_int, c_void};

use crate::error::Error;
use crate::global;

#[inline]
fn status<T>(result: crate::KrwResult<T>, out: impl FnOnce(T)) -> c_int {
    match result {
        Ok(value) => {
            out(value);
            0
        }
        Err(e) => e.code(),
    }
}

/// # Safety
/// `addr` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kbase(addr: *mut u64) -> c_int {
    if addr.is_null() {
        return Error::InvalidArgument.code();
    }
    status(global().kbase(), |base| unsafe { addr.write(base) })
}

/// # Safety
/// `to` must be valid for writes of `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kread(from: u64, to: *mut c_void, len: usize) -> c_int {
    Error::to_status(unsafe { global().kread_raw(from, to, len) })
}

/// # Safety
/// `from` must be valid for reads of `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kwrite(from: *mut c_void, to: u64, len: usize) -> c_int {
    Error::to_status(unsafe { global().kwrite_raw(from, to, len) })
}

/// # Safety
/// `addr` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kmalloc(addr: *mut u64, size: usize) -> c_int {
    if addr.is_null() {
        return Error::InvalidArgument.code();
    }
    status(global().kmalloc(size), |va| unsafe { addr.write(va) })
}

#[unsafe(no_mangle)]
pub extern "C" fn kdealloc(addr: u64, size: usize) -> c_int {
    Error::to_status(global().kdealloc(addr, size))
}

/// # Safety
/// `argv` must be valid for reads of `argc` values; `ret` must be null or
/// valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kcall(func: u64, argc: usize, argv: *const u64, ret: *mut u64) -> c_int {
    if ret.is_null() || (argv.is_null() && argc != 0) {
        return Error::InvalidArgument.code();
    }
    status(unsafe { global().kcall_raw(func, argc, argv) }, |value| unsafe {
        ret.write(value)
    })
}

/// # Safety
/// `to` must be valid for writes of `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn physread(from: u64, to: *mut c_void, len: usize, granule: u8) -> c_int {
    Error::to_status(unsafe { global().physread_raw(from, to, len, granule) })
}

/// # Safety
/// `from` must be valid for reads of `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn physwrite(from: *mut c_void, to: u64, len: usize, granule: u8) -> c_int {
    Error::to_status(unsafe { global().physwrite_raw(from, to, len, granule) })
}
