//! Optimistic concurrency errors.
//!
//! Every save checks that the stream has not moved since the instance was
//! loaded: the first pending event must directly follow the durable version.
//! When it does not, the save fails with [`ConcurrencyConflict`] and nothing
//! is written.

use std::fmt;

use thiserror::Error;

/// Another writer appended to the stream after this instance was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub struct ConcurrencyConflict {
    /// The durable version the instance was built on. `0` means a new stream.
    pub expected: u64,
    /// The version actually found in the store.
    pub actual: u64,
}

impl ConcurrencyConflict {
    /// Compare the version an instance was built on with the durable one.
    ///
    /// # Errors
    ///
    /// Returns the conflict when the versions differ.
    pub const fn check(expected: u64, actual: u64) -> Result<(), Self> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self { expected, actual })
        }
    }
}

// The message carries an actionable hint for the caller.
impl fmt::Display for ConcurrencyConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { expected, actual } = self;
        if *expected == 0 {
            write!(
                f,
                "concurrency conflict: expected new stream, found version {actual} (hint: \
                 another process created this aggregate; reload and retry)"
            )
        } else {
            write!(
                f,
                "concurrency conflict: expected version {expected}, found {actual} (hint: stream \
                 was modified; reload and retry)"
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_versions_pass() {
        assert_eq!(ConcurrencyConflict::check(3, 3), Ok(()));
        assert_eq!(ConcurrencyConflict::check(0, 0), Ok(()));
    }

    #[test]
    fn expected_new_stream_mentions_hint() {
        let conflict = ConcurrencyConflict::check(0, 42).unwrap_err();
        let msg = conflict.to_string();
        assert!(msg.contains("expected new stream"));
        assert!(msg.contains("reload and retry"));
    }

    #[test]
    fn expected_version_includes_versions() {
        let conflict = ConcurrencyConflict {
            expected: 5,
            actual: 10,
        };
        let msg = conflict.to_string();
        assert!(msg.contains("expected version 5"));
        assert!(msg.contains("found 10"));
    }
}
