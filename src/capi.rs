//! C ABI surface for operator tooling (spec section 6): an opaque
//! `policy_c` handle plus `#[no_mangle] extern "C"` entry points to
//! create/destroy a policy, set each field, publish it to its backing
//! descriptor, and enforce static mode. Every entry point wraps its body
//! in `catch_unwind` and maps `Result<_, Error>` to the stable integer
//! codes from [`crate::error::ErrorCode`] — the Rust equivalent of the
//! original's `try { ... } catch (...) { err = exception_handler(...); }`
//! pattern (spec section 9, "exceptions crossing a stable ABI boundary").

use std::ffi::CStr;
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use crate::error::ErrorCode;
use crate::global_policy::{GlobalPolicy, PolicyDescriptor};
use crate::policy::{Affinity, Goal, Mode};

/// Opaque handle returned by [`geopm_policy_create`]. Owned by the
/// caller; released exactly once via [`geopm_policy_destroy`].
pub struct policy_c {
    inner: GlobalPolicy,
}

fn catch<F: FnOnce() -> Result<(), crate::error::Error>>(body: F) -> i32 {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => e.code(),
        Err(_) => ErrorCode::Logic as i32,
    }
}

unsafe fn parse_descriptor(raw: *const c_char) -> Option<PolicyDescriptor> {
    if raw.is_null() {
        return None;
    }
    let s = CStr::from_ptr(raw).to_str().ok()?;
    Some(PolicyDescriptor::parse(s))
}

/// Allocates a new policy handle bound to `input`/`output` descriptor
/// strings (either may be null to omit that direction). Returns null on
/// failure to parse a non-null descriptor's UTF-8.
///
/// # Safety
/// `input`/`output`, if non-null, must point at a NUL-terminated UTF-8
/// string valid for the duration of this call.
#[no_mangle]
pub unsafe extern "C" fn geopm_policy_create(
    input: *const c_char,
    output: *const c_char,
) -> *mut policy_c {
    let result = panic::catch_unwind(|| {
        let input = parse_descriptor(input);
        let output = parse_descriptor(output);
        Box::into_raw(Box::new(policy_c { inner: GlobalPolicy::new(input, output) }))
    });
    result.unwrap_or(ptr::null_mut())
}

/// Releases a handle created by [`geopm_policy_create`]. A null
/// `handle` is a no-op.
///
/// # Safety
/// `handle` must be either null or a pointer previously returned by
/// [`geopm_policy_create`] and not yet destroyed.
#[no_mangle]
pub unsafe extern "C" fn geopm_policy_destroy(handle: *mut policy_c) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// # Safety
/// `handle` must be a live pointer from [`geopm_policy_create`].
#[no_mangle]
pub unsafe extern "C" fn geopm_policy_set_mode(handle: *mut policy_c, mode: i32) -> i32 {
    catch(|| {
        let handle = handle
            .as_mut()
            .ok_or_else(|| crate::pwrctl_err!(ErrorCode::PolicyNull, "policy handle is null"))?;
        let mode = mode_from_i32(mode)
            .ok_or_else(|| crate::pwrctl_err!(ErrorCode::Invalid, "unknown mode value {mode}"))?;
        handle.inner.set_mode(mode);
        Ok(())
    })
}

/// # Safety
/// `handle` must be a live pointer from [`geopm_policy_create`].
#[no_mangle]
pub unsafe extern "C" fn geopm_policy_set_budget_watts(handle: *mut policy_c, watts: f64) -> i32 {
    catch(|| {
        let handle = handle
            .as_mut()
            .ok_or_else(|| crate::pwrctl_err!(ErrorCode::PolicyNull, "policy handle is null"))?;
        if watts < 0.0 {
            return Err(crate::pwrctl_err!(ErrorCode::Invalid, "budget_watts must be >= 0"));
        }
        handle.inner.set_budget_watts(watts);
        Ok(())
    })
}

/// # Safety
/// `handle` must be a live pointer from [`geopm_policy_create`].
#[no_mangle]
pub unsafe extern "C" fn geopm_policy_set_frequency_mhz(handle: *mut policy_c, mhz: u32) -> i32 {
    catch(|| {
        let handle = handle
            .as_mut()
            .ok_or_else(|| crate::pwrctl_err!(ErrorCode::PolicyNull, "policy handle is null"))?;
        handle.inner.set_frequency_mhz(mhz);
        Ok(())
    })
}

/// # Safety
/// `handle` must be a live pointer from [`geopm_policy_create`].
#[no_mangle]
pub unsafe extern "C" fn geopm_policy_set_tdp_percent(handle: *mut policy_c, percent: u32) -> i32 {
    catch(|| {
        let handle = handle
            .as_mut()
            .ok_or_else(|| crate::pwrctl_err!(ErrorCode::PolicyNull, "policy handle is null"))?;
        if percent > 100 {
            return Err(crate::pwrctl_err!(ErrorCode::Invalid, "tdp_percent must be <= 100"));
        }
        handle.inner.set_tdp_percent(percent);
        Ok(())
    })
}

/// `affinity`: 0 = compact, 1 = scatter.
///
/// # Safety
/// `handle` must be a live pointer from [`geopm_policy_create`].
#[no_mangle]
pub unsafe extern "C" fn geopm_policy_set_affinity(handle: *mut policy_c, affinity: i32) -> i32 {
    catch(|| {
        let handle = handle
            .as_mut()
            .ok_or_else(|| crate::pwrctl_err!(ErrorCode::PolicyNull, "policy handle is null"))?;
        let affinity = match affinity {
            0 => Affinity::Compact,
            1 => Affinity::Scatter,
            _ => return Err(crate::pwrctl_err!(ErrorCode::Invalid, "unknown affinity value {affinity}")),
        };
        handle.inner.set_affinity(affinity);
        Ok(())
    })
}

/// `goal`: 0 = performance, 1 = efficiency, 2 = balanced.
///
/// # Safety
/// `handle` must be a live pointer from [`geopm_policy_create`].
#[no_mangle]
pub unsafe extern "C" fn geopm_policy_set_goal(handle: *mut policy_c, goal: i32) -> i32 {
    catch(|| {
        let handle = handle
            .as_mut()
            .ok_or_else(|| crate::pwrctl_err!(ErrorCode::PolicyNull, "policy handle is null"))?;
        let goal = match goal {
            0 => Goal::Performance,
            1 => Goal::Efficiency,
            2 => Goal::Balanced,
            _ => return Err(crate::pwrctl_err!(ErrorCode::Invalid, "unknown goal value {goal}")),
        };
        handle.inner.set_goal(goal);
        Ok(())
    })
}

/// # Safety
/// `handle` must be a live pointer from [`geopm_policy_create`].
#[no_mangle]
pub unsafe extern "C" fn geopm_policy_set_num_max_perf(handle: *mut policy_c, count: u32) -> i32 {
    catch(|| {
        let handle = handle
            .as_mut()
            .ok_or_else(|| crate::pwrctl_err!(ErrorCode::PolicyNull, "policy handle is null"))?;
        handle.inner.set_num_max_perf(count);
        Ok(())
    })
}

/// Publishes the handle's current fields to its output descriptor.
///
/// # Safety
/// `handle` must be a live pointer from [`geopm_policy_create`].
#[no_mangle]
pub unsafe extern "C" fn geopm_policy_write(handle: *mut policy_c) -> i32 {
    catch(|| {
        let handle = handle
            .as_mut()
            .ok_or_else(|| crate::pwrctl_err!(ErrorCode::PolicyNull, "policy handle is null"))?;
        handle.inner.write()
    })
}

/// Reads the input descriptor and, for static modes only, dispatches
/// directly to the matching `Platform` actuation via the many-core
/// implementation discovered from the process's own `/dev/cpu` tree.
/// Dynamic modes return `ErrorCode::Invalid` (spec open question: this
/// entry point does not silently no-op them).
///
/// # Safety
/// `handle` must be a live pointer from [`geopm_policy_create`].
#[no_mangle]
pub unsafe extern "C" fn geopm_policy_enforce_static(handle: *mut policy_c) -> i32 {
    catch(|| {
        let handle = handle
            .as_mut()
            .ok_or_else(|| crate::pwrctl_err!(ErrorCode::PolicyNull, "policy handle is null"))?;
        let mut platform = crate::platform::default_platform()?;
        handle.inner.enforce_static_mode(&mut platform)
    })
}

/// Human-readable catalog message for `code`, matching
/// `geopm_error_message`'s switch table. Returns a pointer to a
/// process-static string; never free the result.
#[no_mangle]
pub extern "C" fn geopm_error_message(code: i32) -> *const c_char {
    static RUNTIME: &str = "<pwrctl> Runtime error\0";
    static LOGIC: &str = "<pwrctl> Logic error\0";
    static INVALID: &str = "<pwrctl> Invalid argument\0";
    static POLICY_NULL: &str = "<pwrctl> The policy handle is NULL, use policy_create\0";
    static FILE_PARSE: &str = "<pwrctl> Unable to parse input file\0";
    static LEVEL_RANGE: &str = "<pwrctl> Control hierarchy level is out of range\0";
    static UNKNOWN: &str = "<pwrctl> Unknown error code\0";

    let s: &str = match code {
        c if c == ErrorCode::Runtime as i32 => RUNTIME,
        c if c == ErrorCode::Logic as i32 => LOGIC,
        c if c == ErrorCode::Invalid as i32 => INVALID,
        c if c == ErrorCode::PolicyNull as i32 => POLICY_NULL,
        c if c == ErrorCode::FileParse as i32 => FILE_PARSE,
        c if c == ErrorCode::LevelRange as i32 => LEVEL_RANGE,
        _ => UNKNOWN,
    };
    s.as_ptr() as *const c_char
}

fn mode_from_i32(raw: i32) -> Option<Mode> {
    Some(match raw {
        0 => Mode::Shutdown,
        1 => Mode::TdpBalanceStatic,
        2 => Mode::FreqUniformStatic,
        3 => Mode::FreqHybridStatic,
        4 => Mode::PerfBalanceDynamic,
        5 => Mode::FreqUniformDynamic,
        6 => Mode::FreqHybridDynamic,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn create_destroy_round_trips_without_leaking() {
        let path = CString::new("/tmp/pwrctl-capi-test.json").unwrap();
        unsafe {
            let handle = geopm_policy_create(ptr::null(), path.as_ptr());
            assert!(!handle.is_null());
            assert_eq!(geopm_policy_set_mode(handle, Mode::FreqUniformStatic as i32), 0);
            assert_eq!(geopm_policy_set_frequency_mhz(handle, 2100), 0);
            assert_eq!(geopm_policy_write(handle), 0);
            geopm_policy_destroy(handle);
        }
        let _ = std::fs::remove_file("/tmp/pwrctl-capi-test.json");
    }

    #[test]
    fn null_handle_reports_policy_null() {
        unsafe {
            assert_eq!(geopm_policy_set_mode(ptr::null_mut(), 1), ErrorCode::PolicyNull as i32);
        }
    }

    #[test]
    fn invalid_mode_value_reports_invalid() {
        let path = CString::new("/tmp/pwrctl-capi-test2.json").unwrap();
        unsafe {
            let handle = geopm_policy_create(ptr::null(), path.as_ptr());
            assert_eq!(geopm_policy_set_mode(handle, 99), ErrorCode::Invalid as i32);
            geopm_policy_destroy(handle);
        }
    }

    #[test]
    fn error_message_catalog_matches_taxonomy() {
        let msg = geopm_error_message(ErrorCode::LevelRange as i32);
        let s = unsafe { CStr::from_ptr(msg) }.to_str().unwrap();
        assert!(s.contains("Control hierarchy level is out of range"));
    }
}
