//! Error taxonomy shared by every control-plane operation.
//!
//! Every staging call, commit and abort reports failures through
//! [`NftError`]. The fieldless [`ErrorKind`] is what callers branch on;
//! the message is for humans and logs.

use thiserror::Error;

/// Classification of an [`NftError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Lookup missed
    NotFound,
    /// Duplicate create or exclusive-flag violation
    AlreadyExists,
    /// Entity in use, or a conflicting element with a different payload
    Busy,
    /// Malformed flags, lengths or references
    InvalidArgument,
    /// Allocation failure or a configured limit was reached
    ResourceExhausted,
    /// No backend or chain type supports the request
    Unsupported,
    /// A module load was requested; retry the whole batch afterwards
    TryAgainLater,
    /// Jump/goto validation failed
    CycleDetected,
    /// Bookkeeping invariant broken; not recoverable in-process
    Fatal,
}

impl ErrorKind {
    /// Returns true if the whole batch should be replayed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TryAgainLater)
    }

    /// Returns true if the error indicates broken internal state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Fatal)
    }

    /// Returns the closest errno-style name, used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "ENOENT",
            ErrorKind::AlreadyExists => "EEXIST",
            ErrorKind::Busy => "EBUSY",
            ErrorKind::InvalidArgument => "EINVAL",
            ErrorKind::ResourceExhausted => "ENFILE",
            ErrorKind::Unsupported => "EOPNOTSUPP",
            ErrorKind::TryAgainLater => "EAGAIN",
            ErrorKind::CycleDetected => "ELOOP",
            ErrorKind::Fatal => "EFAULT",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NftError {
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("{what} already exists: {name}")]
    AlreadyExists { what: &'static str, name: String },

    #[error("busy: {message}")]
    Busy { message: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("unsupported: {message}")]
    Unsupported { message: String },

    #[error("try again later: module {module} requested")]
    TryAgainLater { module: String },

    #[error("loop detected: {message}")]
    CycleDetected { message: String },

    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl NftError {
    /// Creates a lookup miss error.
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        NftError::NotFound {
            what,
            name: name.into(),
        }
    }

    /// Creates a duplicate error.
    pub fn exists(what: &'static str, name: impl Into<String>) -> Self {
        NftError::AlreadyExists {
            what,
            name: name.into(),
        }
    }

    /// Creates a busy error.
    pub fn busy(message: impl Into<String>) -> Self {
        NftError::Busy {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        NftError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a resource exhaustion error.
    pub fn exhausted(message: impl Into<String>) -> Self {
        NftError::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Creates an unsupported error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        NftError::Unsupported {
            message: message.into(),
        }
    }

    /// Creates a retry error for a pending module request.
    pub fn try_again(module: impl Into<String>) -> Self {
        NftError::TryAgainLater {
            module: module.into(),
        }
    }

    /// Creates a validation loop error.
    pub fn cycle(message: impl Into<String>) -> Self {
        NftError::CycleDetected {
            message: message.into(),
        }
    }

    /// Creates a fatal invariant error.
    pub fn fatal(message: impl Into<String>) -> Self {
        NftError::Fatal {
            message: message.into(),
        }
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NftError::NotFound { .. } => ErrorKind::NotFound,
            NftError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            NftError::Busy { .. } => ErrorKind::Busy,
            NftError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            NftError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            NftError::Unsupported { .. } => ErrorKind::Unsupported,
            NftError::TryAgainLater { .. } => ErrorKind::TryAgainLater,
            NftError::CycleDetected { .. } => ErrorKind::CycleDetected,
            NftError::Fatal { .. } => ErrorKind::Fatal,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, NftError>;
