//! Error taxonomy for guest address space operations.

use core::fmt;

/// Errors reported by translation, linking, protection and shadow operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A concurrent structural change or a not-yet-resident host page
    /// invalidated the precondition. Always safe to retry from the top.
    Again,
    /// No translation exists for the requested guest address.
    NotMapped,
    /// The address is already mapped to a different target.
    Conflict,
    /// Table allocation failed; the operation was fully unwound.
    OutOfMemory,
    /// The host address is invalid or the requested access was denied.
    /// Terminal for the current attempt.
    Fault,
    /// Misaligned address/length, or an address beyond the configured limit.
    InvalidArgument,
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Again => "transient condition, retry",
            Error::NotMapped => "no translation exists",
            Error::Conflict => "address already mapped",
            Error::OutOfMemory => "out of table memory",
            Error::Fault => "host address invalid or access denied",
            Error::InvalidArgument => "misaligned or out-of-range argument",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(format!("{}", Error::Again), "transient condition, retry");
        assert_eq!(format!("{}", Error::NotMapped), "no translation exists");
    }

    #[test]
    fn errors_are_comparable() {
        assert_eq!(Error::Conflict, Error::Conflict);
        assert_ne!(Error::Fault, Error::Again);
    }
}
