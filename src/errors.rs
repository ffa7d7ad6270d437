//! Error handling for kernel entry points.
//!
//! This layer has almost no recoverable-error surface: operations either
//! succeed, block until their precondition holds, or are fatal programmer
//! errors (unlocking a mutex you don't own panics). The variants
//! below cover the few conditions worth reporting to the caller.

use core::fmt;

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors reported by kernel entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KernelError {
    /// The kernel has not been initialized yet.
    NotInitialized,
    /// The kernel was already initialized.
    AlreadyInitialized,
    /// The thread id does not name a prepared thread.
    InvalidThread,
    /// The thread is not in a state that permits the operation
    /// (e.g. starting a thread twice).
    InvalidState,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NotInitialized => write!(f, "kernel not initialized"),
            KernelError::AlreadyInitialized => write!(f, "kernel already initialized"),
            KernelError::InvalidThread => write!(f, "invalid thread id"),
            KernelError::InvalidState => write!(f, "operation not valid in this thread state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::string::ToString;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(
            KernelError::NotInitialized.to_string(),
            "kernel not initialized"
        );
        assert_eq!(KernelError::InvalidThread.to_string(), "invalid thread id");
    }
}
