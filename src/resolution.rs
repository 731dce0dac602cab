//! The Promises/A+ resolution procedure.
//!
//! Whatever a `then` callback returns is a [`Resolution`]: a plain value, a
//! promise, or some foreign [`Thenable`]. Promises and thenables are
//! followed until they produce a plain value, and the chain they drive
//! settles at most once however the thenable behaves.
use crate::promise::Promise;
use crate::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a callback hands back to the chain: `Ok` resolves the downstream
/// promise, `Err` rejects it.
pub type Outcome<T, E> = Result<Resolution<T, E>, E>;

pub enum Resolution<T, E> {
    /// Settles the downstream promise with this value as-is.
    Value(T),
    /// Makes the downstream promise follow this one.
    Promise(Promise<T, E>),
    /// Makes the downstream promise follow a foreign thenable.
    Thenable(Box<dyn Thenable<T, E>>),
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Promise(promise)
    }
}

impl<T: fmt::Debug, E> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Promise(promise) => f.debug_tuple("Promise").field(promise).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

/// Anything with a `then` the resolution procedure can follow.
///
/// An implementation should eventually call `resolve` or `reject`. Calling
/// them more than once, calling both, or returning `Err` after calling one
/// is tolerated: only the first signal reaches the chain.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Error, Promise, Resolution, ThenReject, ThenResolve, Thenable};
/// struct Ready(i32);
///
/// impl Thenable<i32, Error> for Ready {
///     fn then(&self, resolve: ThenResolve<i32, Error>, _: ThenReject<i32, Error>) -> Result<(), Error> {
///         resolve.resolve(Resolution::Value(self.0));
///         Ok(())
///     }
/// }
///
/// let p = Promise::<i32, Error>::new(|resolve, _| resolve.resolve(0))
///     .and_then(|_| Ok(Resolution::Thenable(Box::new(Ready(42)))));
/// assert_eq!(p.value(), Some(42));
/// ```
pub trait Thenable<T, E>: Send {
    fn then(&self, resolve: ThenResolve<T, E>, reject: ThenReject<T, E>) -> Result<(), E>;

    /// The promise behind this thenable, if it is one. Used to catch a
    /// chain resolving to itself.
    fn as_promise(&self) -> Option<&Promise<T, E>> {
        None
    }
}

/// One resolution attempt against a downstream promise.
struct Attempt<T, E> {
    called: AtomicBool,
    downstream: Promise<T, E>,
}

impl<T, E> Attempt<T, E> {
    /// True for the first caller only.
    fn claim(&self) -> bool {
        !self.called.swap(true, Ordering::AcqRel)
    }
}

/// Success callback handed to a [`Thenable`].
pub struct ThenResolve<T, E> {
    attempt: Arc<Attempt<T, E>>,
}

/// Failure callback handed to a [`Thenable`].
pub struct ThenReject<T, E> {
    attempt: Arc<Attempt<T, E>>,
}

impl<T, E> Clone for ThenResolve<T, E> {
    fn clone(&self) -> Self {
        Self {
            attempt: self.attempt.clone(),
        }
    }
}

impl<T, E> Clone for ThenReject<T, E> {
    fn clone(&self) -> Self {
        Self {
            attempt: self.attempt.clone(),
        }
    }
}

impl<T, E> ThenResolve<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    /// Continues resolution with `y`, which may itself be a thenable.
    pub fn resolve(&self, y: Resolution<T, E>) {
        if self.attempt.claim() {
            resolve_promise(&self.attempt.downstream, y)
        } else {
            log::trace!("thenable signalled after settling its chain, ignored");
        }
    }
}

impl<T, E> ThenReject<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Rejects the chain with `reason`. Reasons are never unwrapped.
    pub fn reject(&self, reason: E) {
        if self.attempt.claim() {
            self.attempt.downstream.settle_failure(reason)
        } else {
            log::trace!("thenable signalled after settling its chain, ignored");
        }
    }
}

/// Settles `downstream` from `x`.
pub(crate) fn resolve_promise<T, E>(downstream: &Promise<T, E>, x: Resolution<T, E>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    match x {
        Resolution::Promise(promise) => follow(downstream, Box::new(promise)),
        Resolution::Thenable(thenable) => follow(downstream, thenable),
        Resolution::Value(value) => downstream.settle_success(value),
    }
}

/// Makes `downstream` follow `thenable`. Its `then` runs as a job of its
/// own, so nested thenables do not grow the stack.
fn follow<T, E>(downstream: &Promise<T, E>, thenable: Box<dyn Thenable<T, E>>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    if thenable
        .as_promise()
        .is_some_and(|promise| promise.ptr_eq(downstream))
    {
        log::debug!("promise resolved with itself, rejecting");
        downstream.settle_failure(Error::CircularReference.into());
        return;
    }
    let target = downstream.clone();
    downstream.schedule(Box::new(move || call_then(&target, thenable.as_ref())));
}

fn call_then<T, E>(downstream: &Promise<T, E>, thenable: &dyn Thenable<T, E>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    let attempt = Arc::new(Attempt {
        called: AtomicBool::new(false),
        downstream: downstream.clone(),
    });
    let resolve = ThenResolve {
        attempt: attempt.clone(),
    };
    let reject = ThenReject {
        attempt: attempt.clone(),
    };
    if let Err(reason) = thenable.then(resolve, reject) {
        if attempt.claim() {
            downstream.settle_failure(reason)
        } else {
            log::debug!("thenable failed after settling its chain, error ignored");
        }
    }
}

impl<T, E> Thenable<T, E> for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    fn then(&self, resolve: ThenResolve<T, E>, reject: ThenReject<T, E>) -> Result<(), E> {
        self.on_settle(
            move |value| resolve.resolve(Resolution::Value(value)),
            move |reason| reject.reject(reason),
        );
        Ok(())
    }

    fn as_promise(&self) -> Option<&Promise<T, E>> {
        Some(self)
    }
}
