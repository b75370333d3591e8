//! Error taxonomy shared by every layer of the control plane.
//!
//! Mirrors the original implementation's `Exception` hierarchy: every
//! error carries a stable numeric code plus the file/line it was raised
//! from, so the C ABI boundary (`capi.rs`) can recover an integer error
//! code without losing the diagnostic that produced it.

use std::fmt;

/// Stable numeric error codes, part of the C ABI wire contract.
///
/// These values must never be renumbered once published: external
/// operator tooling matches on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Runtime = -1,
    Logic = -2,
    Invalid = -3,
    PolicyNull = -4,
    FileParse = -5,
    LevelRange = -6,
}

impl ErrorCode {
    /// Human-readable prefix matching `geopm_error_message`'s switch table.
    pub fn catalog_message(self) -> &'static str {
        match self {
            ErrorCode::Runtime => "<pwrctl> Runtime error",
            ErrorCode::Logic => "<pwrctl> Logic error",
            ErrorCode::Invalid => "<pwrctl> Invalid argument",
            ErrorCode::PolicyNull => "<pwrctl> The policy handle is NULL, use policy_create",
            ErrorCode::FileParse => "<pwrctl> Unable to parse input file",
            ErrorCode::LevelRange => "<pwrctl> Control hierarchy level is out of range",
        }
    }
}

/// The crate-wide error type. Every variant is one taxonomy entry from
/// spec section 7: invalid-argument, file-parse, policy-null,
/// level-range, logic, runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{}: {message} (at {file}:{line})", .code.catalog_message())]
    Typed {
        code: ErrorCode,
        message: String,
        file: &'static str,
        line: u32,
    },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, file: &'static str, line: u32) -> Self {
        Error::Typed {
            code,
            message: message.into(),
            file,
            line,
        }
    }

    /// Stable integer code for the C ABI boundary. OS errors delegate to
    /// their raw errno, matching the original's `strerror` fallback.
    pub fn code(&self) -> i32 {
        match self {
            Error::Typed { code, .. } => *code as i32,
            Error::Io(e) => e.raw_os_error().unwrap_or(ErrorCode::Runtime as i32),
            Error::Json(_) => ErrorCode::FileParse as i32,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.catalog_message())
    }
}

/// Raises a typed [`Error`] with the call site's file and line captured,
/// matching the original's `Exception(msg, err, __FILE__, __LINE__)`
/// construction idiom.
#[macro_export]
macro_rules! pwrctl_err {
    ($code:expr, $($arg:tt)*) => {
        $crate::error::Error::new($code, format!($($arg)*), file!(), line!())
    };
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_error_reports_stable_code() {
        let err = pwrctl_err!(ErrorCode::LevelRange, "level {} out of range", 9);
        assert_eq!(err.code(), ErrorCode::LevelRange as i32);
        assert!(err.to_string().contains("level 9 out of range"));
    }

    #[test]
    fn io_error_reports_errno_when_available() {
        let io = std::io::Error::from_raw_os_error(2);
        let err: Error = io.into();
        assert_eq!(err.code(), 2);
    }
}
