//! Error types for the task core
//!
//! Two families live here:
//!
//! - [`ErrorCode`] is the *outcome* of the operation a task represents. It is
//!   stored in the task when the outcome becomes known (transport callback,
//!   disk completion) and handed to the user callback on execution. It never
//!   crosses a thread boundary as a panic or `Err`.
//! - [`TaskError`] reports misuse of the task API that the caller can recover
//!   from (unknown codes, undersized buffers, ...).

use std::fmt;

/// Outcome code carried in a task's error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, thiserror::Error)]
pub enum ErrorCode {
    /// No error, or no outcome yet.
    #[default]
    #[error("ERR_OK")]
    Ok,
    /// The remote side did not answer within the client timeout.
    #[error("ERR_TIMEOUT")]
    Timeout,
    /// The transport failed to deliver the request or the reply.
    #[error("ERR_NETWORK_FAILURE")]
    NetworkFailure,
    /// The target was not in a state that allows the operation.
    #[error("ERR_INVALID_STATE")]
    InvalidState,
    /// A disk operation failed.
    #[error("ERR_FILE_OPERATION_FAILED")]
    FileOperationFailed,
    /// A read hit the end of the file.
    #[error("ERR_HANDLE_EOF")]
    HandleEof,
    /// The operation was accepted and will complete later.
    #[error("ERR_IO_PENDING")]
    IoPending,
    /// The target is overloaded.
    #[error("ERR_BUSY")]
    Busy,
    /// Any code this crate does not name.
    #[error("ERR_UNKNOWN({0})")]
    Unknown(u32),
}

impl ErrorCode {
    /// Whether the code means success.
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, ErrorCode::Ok)
    }

    /// Numeric representation, stable across processes.
    pub fn as_u32(&self) -> u32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::Timeout => 1,
            ErrorCode::NetworkFailure => 2,
            ErrorCode::InvalidState => 3,
            ErrorCode::FileOperationFailed => 4,
            ErrorCode::HandleEof => 5,
            ErrorCode::IoPending => 6,
            ErrorCode::Busy => 7,
            ErrorCode::Unknown(v) => *v,
        }
    }

    /// Inverse of [`ErrorCode::as_u32`].
    pub fn from_u32(val: u32) -> Self {
        match val {
            0 => ErrorCode::Ok,
            1 => ErrorCode::Timeout,
            2 => ErrorCode::NetworkFailure,
            3 => ErrorCode::InvalidState,
            4 => ErrorCode::FileOperationFailed,
            5 => ErrorCode::HandleEof,
            6 => ErrorCode::IoPending,
            7 => ErrorCode::Busy,
            other => ErrorCode::Unknown(other),
        }
    }
}

/// Recoverable errors raised by the task API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The destination slice of a gather copy is shorter than the data.
    #[error("destination buffer too small: need {needed} bytes, got {available}")]
    BufferTooSmall { needed: usize, available: usize },
    /// No task spec is registered under this code.
    #[error("unknown task code: {0}")]
    UnknownTaskCode(u32),
    /// The engine has no pool for this code.
    #[error("unknown thread pool: {0}")]
    UnknownPool(String),
    /// A code or pool name was registered twice with a different shape.
    #[error("code `{0}` already registered with a different definition")]
    DuplicateCode(String),
}

/// Result alias for the task API.
pub type TaskResult<T> = Result<T, TaskError>;

/// Log helper rendering an outcome with its byte count.
pub(crate) struct DisplayOutcome(pub ErrorCode, pub usize);

impl fmt::Display for DisplayOutcome {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.0, self.1)
    }
}
