//! Status taxonomy shared by every client operation.
//!
//! Library calls return [`ClientError`], a cloneable `(kind, message)` pair.
//! Cloneability matters because a single transport failure is recorded
//! against every operation of the affected batch.

use std::fmt;

use crate::operation::MutationOp;

/// Result alias used throughout the client.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Coarse failure category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Table, tablet, row or scanner is absent.
    NotFound,
    /// Connection refused or reset.
    NetworkError,
    /// A deadline elapsed, either while resolving locations or waiting on an RPC.
    TimedOut,
    /// Insert collided with an existing key.
    AlreadyPresent,
    /// Request references columns or values the schema does not allow.
    InvalidArgument,
    /// Caller used an object in the wrong state (e.g. key columns unset).
    IllegalState,
    /// Aggregate failure of a flush; details live in the error queue.
    IoError,
    /// Server reported a failure that does not map onto another kind.
    RemoteError,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "Not found",
            Self::NetworkError => "Network error",
            Self::TimedOut => "Timed out",
            Self::AlreadyPresent => "Already present",
            Self::InvalidArgument => "Invalid argument",
            Self::IllegalState => "Illegal state",
            Self::IoError => "IO error",
            Self::RemoteError => "Remote error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure status carried by every fallible client call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClientError {
    kind: ErrorKind,
    message: String,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimedOut, message)
    }

    pub fn already_present(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyPresent, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalState, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemoteError, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_network_error(&self) -> bool {
        self.kind == ErrorKind::NetworkError
    }

    pub fn is_timed_out(&self) -> bool {
        self.kind == ErrorKind::TimedOut
    }

    pub fn is_already_present(&self) -> bool {
        self.kind == ErrorKind::AlreadyPresent
    }

    pub fn is_invalid_argument(&self) -> bool {
        self.kind == ErrorKind::InvalidArgument
    }

    pub fn is_illegal_state(&self) -> bool {
        self.kind == ErrorKind::IllegalState
    }

    pub fn is_io_error(&self) -> bool {
        self.kind == ErrorKind::IoError
    }

    /// Prefix the message with call-site context, keeping the kind.
    pub fn with_context(self, context: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{context}: {}", self.message),
        }
    }
}

/// One failed write, as drained from a session's error queue.
#[derive(Debug)]
pub struct OpError {
    status: ClientError,
    failed_op: MutationOp,
}

impl OpError {
    pub(crate) fn new(status: ClientError, failed_op: MutationOp) -> Self {
        Self { status, failed_op }
    }

    pub fn status(&self) -> &ClientError {
        &self.status
    }

    pub fn failed_op(&self) -> &MutationOp {
        &self.failed_op
    }

    /// Recover the operation, e.g. to re-apply it after fixing the cause.
    pub fn into_failed_op(self) -> MutationOp {
        self.failed_op
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (op: {})", self.status, self.failed_op)
    }
}

/// Rejected `apply`: the status plus the untouched operation handed back.
#[derive(Debug, thiserror::Error)]
#[error("{status}")]
pub struct ApplyError {
    status: ClientError,
    op: Box<MutationOp>,
}

impl ApplyError {
    pub(crate) fn new(status: ClientError, op: MutationOp) -> Self {
        Self {
            status,
            op: Box::new(op),
        }
    }

    pub fn status(&self) -> &ClientError {
        &self.status
    }

    /// The operation is still valid and may be fixed and re-applied.
    pub fn into_op(self) -> MutationOp {
        *self.op
    }
}
