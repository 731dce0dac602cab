//! The transforms `then` falls back to when a callback is left out.

use crate::resolution::{Outcome, Resolution};

/// Passes a fulfilled value through unchanged.
pub fn identity<T, E>(value: T) -> Outcome<T, E> {
    Ok(Resolution::Value(value))
}

/// Re-raises a rejection reason unchanged.
pub fn rethrow<U, E>(reason: E) -> Outcome<U, E> {
    Err(reason)
}
