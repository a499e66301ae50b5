use std::fmt;

/// Classifies failures by how the reconcile loop reacts to them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unexpected local failure, e.g. encoding or TLS setup.
    Internal,

    /// Malformed input. Retrying with the same input cannot succeed.
    WrongInput,

    /// A remote service failed, timed out, or could not be reached.
    Upstream,

    /// An optimistic-concurrency precondition failed.
    Conflict,
}

// === impl ErrorKind ===

impl ErrorKind {
    /// Returns true if a later attempt may succeed without operator action.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::WrongInput)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Internal => "Internal",
            Self::WrongInput => "WrongInput",
            Self::Upstream => "Upstream",
            Self::Conflict => "Conflict",
        })
    }
}
