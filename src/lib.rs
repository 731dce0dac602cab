//! Promises/A+ deferred values.
//!
//! A [`Promise`] settles exactly once, either fulfilled with a value or
//! rejected with a reason. [`Promise::then`] chains a transform whose result
//! is itself a promise, and the result of every transform goes through the
//! Promises/A+ resolution procedure: nested thenables are unwrapped, a chain
//! resolving to itself is rejected with [`Error::CircularReference`], and a
//! misbehaving [`Thenable`] can settle the chain at most once.
//!
//! # Examples
//!
//! ```
//! use promise_aplus::{Error, Promise, Resolution, State};
//! let p = Promise::<i32, Error>::new(|resolve, _reject| resolve.resolve(1))
//!     .and_then(|v| Ok(Resolution::Value(v + 1)))
//!     .and_then(|v| Ok(Resolution::Value(v * 10)));
//! assert_eq!(p.state(), State::Fulfilled);
//! assert_eq!(p.value(), Some(20));
//! ```
//!
//! Reactions run through a [`Scheduler`]. The default, [`Inline`], runs them
//! synchronously; hosts with a task queue can pass their own to
//! [`Promise::with_scheduler`].
pub mod handler;
pub mod promise;
pub mod resolution;
pub mod scheduler;

pub use handler::{identity, rethrow};
pub use promise::{Promise, Rejecter, Resolver};
pub use resolution::{Outcome, Resolution, ThenReject, ThenResolve, Thenable};
pub use scheduler::{Inline, Job, Scheduler};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("circular reference: a promise cannot be resolved with itself")]
    CircularReference,
    #[error("{0}")]
    Reason(String),
}

impl Error {
    pub fn reason(message: impl Into<String>) -> Self {
        Error::Reason(message.into())
    }
}

/// Where a promise is in its lifecycle. Only ever moves away from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}
