//! Exit codes for the `psv` CLI. These are stable.

use psv_common::{Error, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Ok = 0,

    /// Configuration could not be loaded or is invalid
    ConfigError = 10,

    /// A plugin lifecycle operation failed
    PluginFailed = 11,

    /// A plugin was refused by trust policy
    VerificationFailed = 12,

    /// I/O error
    IoError = 13,

    /// Internal/unknown error
    InternalError = 99,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Ok
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<&Error> for ExitCode {
    fn from(error: &Error) -> Self {
        match error.kind() {
            ErrorKind::Config => ExitCode::ConfigError,
            ErrorKind::VerificationFailed => ExitCode::VerificationFailed,
            ErrorKind::Io => ExitCode::IoError,
            ErrorKind::Json => ExitCode::InternalError,
            _ => ExitCode::PluginFailed,
        }
    }
}
