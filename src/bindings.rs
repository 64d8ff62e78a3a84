//! C bindings for shmpipe
//!
//! Provides a raw C API over [`Session`] for peers written in other
//! languages. Handles are opaque boxed sessions; data calls return the
//! transferred byte count or a negative error code.

use crate::error::ShmPipeError;
use crate::session::{Session, UnlinkPolicy};
use rustix::fd::AsRawFd;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;
use std::slice;

/// Opaque session handle
pub struct ShmPipeHandle(Session);

/// Error codes returned by the `shmpipe_*` data calls.
pub const SHMPIPE_ERR_WOULD_BLOCK: isize = -1;
pub const SHMPIPE_ERR_CLOSED: isize = -2;
pub const SHMPIPE_ERR_BROKEN_PIPE: isize = -3;
pub const SHMPIPE_ERR_INTERRUPTED: isize = -4;
pub const SHMPIPE_ERR_NOT_FOUND: isize = -5;
pub const SHMPIPE_ERR_ALREADY_EXISTS: isize = -6;
pub const SHMPIPE_ERR_MALFORMED: isize = -7;
pub const SHMPIPE_ERR_INVALID_ARGUMENT: isize = -8;
pub const SHMPIPE_ERR_PERMISSION_DENIED: isize = -9;
pub const SHMPIPE_ERR_RESOURCE_EXHAUSTED: isize = -10;
pub const SHMPIPE_ERR_OS: isize = -100;

fn error_code(err: &ShmPipeError) -> isize {
    match err {
        ShmPipeError::WouldBlock => SHMPIPE_ERR_WOULD_BLOCK,
        ShmPipeError::Closed => SHMPIPE_ERR_CLOSED,
        ShmPipeError::BrokenPipe => SHMPIPE_ERR_BROKEN_PIPE,
        ShmPipeError::Interrupted => SHMPIPE_ERR_INTERRUPTED,
        ShmPipeError::NotFound { .. } => SHMPIPE_ERR_NOT_FOUND,
        ShmPipeError::AlreadyExists { .. } => SHMPIPE_ERR_ALREADY_EXISTS,
        ShmPipeError::BadMagic { .. }
        | ShmPipeError::BadVersion { .. }
        | ShmPipeError::Malformed { .. } => SHMPIPE_ERR_MALFORMED,
        ShmPipeError::InvalidName { .. } | ShmPipeError::InvalidCapacity { .. } => {
            SHMPIPE_ERR_INVALID_ARGUMENT
        }
        ShmPipeError::PermissionDenied { .. } => SHMPIPE_ERR_PERMISSION_DENIED,
        ShmPipeError::ResourceExhausted { .. } => SHMPIPE_ERR_RESOURCE_EXHAUSTED,
        ShmPipeError::Io { .. } => SHMPIPE_ERR_OS,
    }
}

unsafe fn name_from_c<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    CStr::from_ptr(name).to_str().ok()
}

/// Create a new session as the creator end.
///
/// Returns null on failure.
///
/// # Safety
/// `name` must be a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn shmpipe_create(
    name: *const c_char,
    capacity: u32,
) -> *mut ShmPipeHandle {
    let Some(name) = name_from_c(name) else {
        return ptr::null_mut();
    };

    match Session::create(name, capacity) {
        Ok(session) => Box::into_raw(Box::new(ShmPipeHandle(session))),
        Err(_) => ptr::null_mut(),
    }
}

/// Attach to an existing session as the client end.
///
/// Returns null on failure.
///
/// # Safety
/// `name` must be a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn shmpipe_attach(name: *const c_char) -> *mut ShmPipeHandle {
    let Some(name) = name_from_c(name) else {
        return ptr::null_mut();
    };

    match Session::attach(name) {
        Ok(session) => Box::into_raw(Box::new(ShmPipeHandle(session))),
        Err(_) => ptr::null_mut(),
    }
}

/// Send up to `len` bytes; returns the count sent or a negative error code.
///
/// # Safety
/// `handle` must come from `shmpipe_create`/`shmpipe_attach` and `buf` must
/// point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn shmpipe_write(
    handle: *mut ShmPipeHandle,
    buf: *const u8,
    len: usize,
) -> isize {
    if handle.is_null() || (buf.is_null() && len > 0) {
        return SHMPIPE_ERR_INVALID_ARGUMENT;
    }

    let session = &mut (*handle).0;
    let data = slice::from_raw_parts(buf, len);
    match session.write(data) {
        Ok(n) => n as isize,
        Err(e) => error_code(&e),
    }
}

/// Receive up to `len` bytes; returns the count received or a negative
/// error code.
///
/// # Safety
/// `handle` must come from `shmpipe_create`/`shmpipe_attach` and `buf` must
/// point to `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn shmpipe_read(
    handle: *mut ShmPipeHandle,
    buf: *mut u8,
    len: usize,
) -> isize {
    if handle.is_null() || (buf.is_null() && len > 0) {
        return SHMPIPE_ERR_INVALID_ARGUMENT;
    }

    let session = &mut (*handle).0;
    let data = slice::from_raw_parts_mut(buf, len);
    match session.read(data) {
        Ok(n) => n as isize,
        Err(e) => error_code(&e),
    }
}

/// Switch blocking/non-blocking mode.
///
/// # Safety
/// `handle` must come from `shmpipe_create`/`shmpipe_attach`.
#[no_mangle]
pub unsafe extern "C" fn shmpipe_set_nonblocking(handle: *mut ShmPipeHandle, nonblocking: bool) {
    if !handle.is_null() {
        (*handle).0.set_nonblocking(nonblocking);
    }
}

/// Bytes readable right now (0 if the handle is null or closed).
///
/// # Safety
/// `handle` must come from `shmpipe_create`/`shmpipe_attach`, or be null.
#[no_mangle]
pub unsafe extern "C" fn shmpipe_readable_bytes(handle: *const ShmPipeHandle) -> usize {
    if handle.is_null() {
        return 0;
    }
    (*handle).0.readable_bytes()
}

/// Bytes writable right now (0 if the handle is null or closed).
///
/// # Safety
/// `handle` must come from `shmpipe_create`/`shmpipe_attach`, or be null.
#[no_mangle]
pub unsafe extern "C" fn shmpipe_writable_bytes(handle: *const ShmPipeHandle) -> usize {
    if handle.is_null() {
        return 0;
    }
    (*handle).0.writable_bytes()
}

/// The fd to register with poll/epoll/kqueue for this end, or a negative
/// error code.
///
/// # Safety
/// `handle` must come from `shmpipe_create`/`shmpipe_attach`. The fd is
/// owned by the session; do not close it.
#[no_mangle]
pub unsafe extern "C" fn shmpipe_event_fd(handle: *const ShmPipeHandle) -> i32 {
    if handle.is_null() {
        return SHMPIPE_ERR_INVALID_ARGUMENT as i32;
    }
    match (*handle).0.event_fd() {
        Ok(fd) => fd.as_raw_fd(),
        Err(e) => error_code(&e) as i32,
    }
}

/// Close and free a session handle.
///
/// A creator unlinks the session names unless `retain` is set. Passing
/// null is a no-op; passing the same handle twice is undefined.
///
/// # Safety
/// `handle` must come from `shmpipe_create`/`shmpipe_attach` and must not
/// be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn shmpipe_close(handle: *mut ShmPipeHandle, retain: bool) {
    if handle.is_null() {
        return;
    }
    let mut boxed = Box::from_raw(handle);
    let policy = if retain {
        UnlinkPolicy::Retain
    } else {
        UnlinkPolicy::Unlink
    };
    let _ = boxed.0.close(policy);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_c_api_roundtrip() {
        let name = CString::new(format!("ffi_round_{}", std::process::id())).unwrap();

        let creator = unsafe { shmpipe_create(name.as_ptr(), 4096) };
        assert!(!creator.is_null());
        let attacher = unsafe { shmpipe_attach(name.as_ptr()) };
        assert!(!attacher.is_null());

        let msg = b"over the wall";
        let sent = unsafe { shmpipe_write(creator, msg.as_ptr(), msg.len()) };
        assert_eq!(sent, msg.len() as isize);

        assert_eq!(unsafe { shmpipe_readable_bytes(attacher) }, msg.len());

        let mut buf = [0u8; 32];
        let got = unsafe { shmpipe_read(attacher, buf.as_mut_ptr(), buf.len()) };
        assert_eq!(got, msg.len() as isize);
        assert_eq!(&buf[..msg.len()], msg);

        assert!(unsafe { shmpipe_event_fd(attacher) } >= 0);

        unsafe {
            shmpipe_close(attacher, false);
            shmpipe_close(creator, false);
        }
    }

    #[test]
    fn test_c_api_nonblocking_and_errors() {
        let name = CString::new(format!("ffi_nb_{}", std::process::id())).unwrap();

        let missing = unsafe { shmpipe_attach(name.as_ptr()) };
        assert!(missing.is_null());

        let creator = unsafe { shmpipe_create(name.as_ptr(), 8) };
        assert!(!creator.is_null());
        unsafe { shmpipe_set_nonblocking(creator, true) };

        let data = [7u8; 8];
        assert_eq!(unsafe { shmpipe_write(creator, data.as_ptr(), 8) }, 8);
        assert_eq!(
            unsafe { shmpipe_write(creator, data.as_ptr(), 1) },
            SHMPIPE_ERR_WOULD_BLOCK
        );

        unsafe { shmpipe_close(creator, false) };
    }

    #[test]
    fn test_c_api_null_safety() {
        let mut buf = [0u8; 4];
        unsafe {
            assert!(shmpipe_create(ptr::null(), 64).is_null());
            assert!(shmpipe_attach(ptr::null()).is_null());
            assert_eq!(
                shmpipe_write(ptr::null_mut(), buf.as_ptr(), 4),
                SHMPIPE_ERR_INVALID_ARGUMENT
            );
            assert_eq!(
                shmpipe_read(ptr::null_mut(), buf.as_mut_ptr(), 4),
                SHMPIPE_ERR_INVALID_ARGUMENT
            );
            assert_eq!(shmpipe_readable_bytes(ptr::null()), 0);
            shmpipe_set_nonblocking(ptr::null_mut(), true);
            shmpipe_close(ptr::null_mut(), false);
        }
    }
}
