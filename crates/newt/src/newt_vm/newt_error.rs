use std::fmt;

/// Lightweight error code propagated through the dispatch loop with `?`.
///
/// The error *value* (a full `NewtValue`, which scripts may throw and
/// catch) is not carried here; it lives in the shared state and is set by
/// `raise`. Keeping this enum fieldless keeps `NewtResult` one byte wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewtError {
    /// A runtime error with its value stored in the shared state.
    RuntimeError,
    /// Call depth or value stack limit exceeded.
    StackOverflow,
    /// Not a failure: a native closure or thread requested suspension.
    Suspend,
}

pub type NewtResult<T> = Result<T, NewtError>;

impl NewtError {
    #[inline]
    pub fn is_suspend(self) -> bool {
        matches!(self, NewtError::Suspend)
    }
}

impl fmt::Display for NewtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NewtError::RuntimeError => write!(f, "runtime error"),
            NewtError::StackOverflow => write!(f, "stack overflow"),
            NewtError::Suspend => write!(f, "suspended"),
        }
    }
}

impl std::error::Error for NewtError {}
