use core::any::Any;
use core::fmt;
use std::io;

/// The execution context (or its queue) has been stopped and no longer accepts work.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl core::error::Error for Closed {}

#[derive(Debug)]
pub enum StartError {
    /// `start` was already called on this context.
    AlreadyStarted,
    /// The OS refused to spawn the worker thread.
    Spawn(io::Error),
}

impl From<io::Error> for StartError {
    fn from(err: io::Error) -> Self {
        Self::Spawn(err)
    }
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::AlreadyStarted => f.write_str("execution context was already started"),
            StartError::Spawn(err) => write!(f, "failed to spawn worker thread: {err}"),
        }
    }
}

impl core::error::Error for StartError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            StartError::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

/// Why a [`Completion`][crate::Completion] did not produce a value.
#[non_exhaustive]
pub enum CompletionError {
    /// The producing code returned an error.
    Failed(anyhow::Error),
    /// The producing code panicked, the payload is preserved so it can be resumed.
    Panic(Box<dyn Any + Send + 'static>),
    /// The source was explicitly cancelled.
    Cancelled,
}

// === impl CompletionError ===

impl CompletionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panic(_))
    }

    /// Consumes the error, returning the panic payload if it was a panic.
    ///
    /// # Errors
    ///
    /// Returns `self` back if the error is not a panic.
    pub fn try_into_panic(self) -> Result<Box<dyn Any + Send + 'static>, Self> {
        match self {
            Self::Panic(payload) => Ok(payload),
            other => Err(other),
        }
    }

    /// Re-raises the original failure on the calling thread.
    ///
    /// # Panics
    ///
    /// Always. Panics are resumed with their original payload, everything else panics with
    /// the error message.
    pub fn resume_unwind(self) -> ! {
        match self {
            Self::Panic(payload) => std::panic::resume_unwind(payload),
            other => panic!("{other}"),
        }
    }
}

impl fmt::Debug for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
            Self::Panic(payload) => f
                .debug_tuple("Panic")
                .field(&panic_message(payload.as_ref()))
                .finish(),
            Self::Cancelled => f.write_str("Cancelled"),
        }
    }
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(err) => write!(f, "operation failed: {err:#}"),
            Self::Panic(payload) => write!(
                f,
                "operation panicked: {}",
                panic_message(payload.as_ref()).unwrap_or("<non-string payload>")
            ),
            Self::Cancelled => f.write_str("operation was cancelled"),
        }
    }
}

impl core::error::Error for CompletionError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Failed(err) => Some(&**err),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for CompletionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}
