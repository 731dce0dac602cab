use crate::resolution::{self, Outcome};
use crate::scheduler::{Inline, Job, Scheduler};
use crate::{handler, Error, State};
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

/// A deferred value that settles once, to a value `T` or a reason `E`.
///
/// `Promise` is a handle: clones share the same state, and the state lives
/// as long as any handle, including the ones held by pending reactions.
pub struct Promise<T, E> {
    inner: Arc<Mutex<Inner<T, E>>>,
    scheduler: Arc<dyn Scheduler>,
}

enum Settlement<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

struct Inner<T, E> {
    settlement: Settlement<T, E>,
    on_fulfilled: Vec<Job>,
    on_rejected: Vec<Job>,
    waker: Vec<Waker>,
}

/// The settle-success capability handed to an initializer.
#[derive(Debug)]
pub struct Resolver<T, E> {
    promise: Promise<T, E>,
}

/// The settle-failure capability handed to an initializer.
#[derive(Debug)]
pub struct Rejecter<T, E> {
    promise: Promise<T, E>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T, E> Clone for Rejecter<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T, E> Promise<T, E> {
    // Nothing panics while the lock is held, so a poisoned lock still
    // guards consistent state.
    fn lock(&self) -> MutexGuard<'_, Inner<T, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> State {
        match self.lock().settlement {
            Settlement::Pending => State::Pending,
            Settlement::Fulfilled(_) => State::Fulfilled,
            Settlement::Rejected(_) => State::Rejected,
        }
    }

    /// Whether both handles point at the same promise.
    pub fn ptr_eq(&self, other: &Promise<T, E>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn schedule(&self, job: Job) {
        self.scheduler.schedule(job)
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a pending promise and runs `initializer` right away with the
    /// two handles that settle it. Reactions run inline.
    pub fn new<F>(initializer: F) -> Self
    where
        F: FnOnce(Resolver<T, E>, Rejecter<T, E>),
    {
        Self::with_scheduler(Arc::new(Inline), initializer)
    }

    /// Like [`Promise::new`], but reactions of this promise and of every
    /// promise chained from it are handed to `scheduler`.
    pub fn with_scheduler<F>(scheduler: Arc<dyn Scheduler>, initializer: F) -> Self
    where
        F: FnOnce(Resolver<T, E>, Rejecter<T, E>),
    {
        let promise = Self::pending(scheduler);
        initializer(
            Resolver {
                promise: promise.clone(),
            },
            Rejecter {
                promise: promise.clone(),
            },
        );
        promise
    }

    pub(crate) fn pending(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                settlement: Settlement::Pending,
                on_fulfilled: vec![],
                on_rejected: vec![],
                waker: vec![],
            })),
            scheduler,
        }
    }

    /// The fulfilled value, or `None` unless the promise is fulfilled.
    pub fn value(&self) -> Option<T> {
        match self.lock().settlement {
            Settlement::Fulfilled(ref value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The rejection reason, or `None` unless the promise is rejected.
    pub fn reason(&self) -> Option<E> {
        match self.lock().settlement {
            Settlement::Rejected(ref reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Fulfills the promise with `value` as-is. Does nothing once settled.
    ///
    /// # Panics
    ///
    /// With the [`Inline`] scheduler reactions run before this returns. A
    /// reaction that panics unwinds through here, and the reactions queued
    /// after it are dropped without running.
    pub fn settle_success(&self, value: T) {
        self.settle(Settlement::Fulfilled(value))
    }

    /// Rejects the promise with `reason`. Does nothing once settled.
    ///
    /// Panics in reactions unwind the same way as for
    /// [`settle_success`](Promise::settle_success).
    pub fn settle_failure(&self, reason: E) {
        self.settle(Settlement::Rejected(reason))
    }

    fn settle(&self, settlement: Settlement<T, E>) {
        let fulfilled = matches!(settlement, Settlement::Fulfilled(_));
        let (reactions, unfired, wakers) = {
            let mut promise = self.lock();
            if !matches!(promise.settlement, Settlement::Pending) {
                log::trace!("ignoring settle of an already settled promise");
                return;
            }
            promise.settlement = settlement;
            let on_fulfilled = mem::take(&mut promise.on_fulfilled);
            let on_rejected = mem::take(&mut promise.on_rejected);
            let wakers = mem::take(&mut promise.waker);
            if fulfilled {
                (on_fulfilled, on_rejected, wakers)
            } else {
                (on_rejected, on_fulfilled, wakers)
            }
        };
        drop(unfired);
        log::trace!(
            "promise {}, firing {} reaction(s)",
            if fulfilled { "fulfilled" } else { "rejected" },
            reactions.len()
        );
        for waker in wakers {
            waker.wake()
        }
        for reaction in reactions {
            self.scheduler.schedule(reaction);
        }
    }

    fn outcome(&self) -> Option<Result<T, E>> {
        match self.lock().settlement {
            Settlement::Pending => None,
            Settlement::Fulfilled(ref value) => Some(Ok(value.clone())),
            Settlement::Rejected(ref reason) => Some(Err(reason.clone())),
        }
    }

    /// Registers a raw pair of reactions. While pending they are queued and
    /// read this promise's payload when they fire; once settled the matching
    /// one is scheduled immediately.
    pub(crate) fn on_settle<F, R>(&self, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) + Send + 'static,
        R: FnOnce(E) + Send + 'static,
    {
        let mut guard = self.lock();
        let promise = &mut *guard;
        let job: Job = match promise.settlement {
            Settlement::Pending => {
                let source = self.clone();
                promise.on_fulfilled.push(Box::new(move || {
                    if let Some(Ok(value)) = source.outcome() {
                        on_fulfilled(value)
                    }
                }));
                let source = self.clone();
                promise.on_rejected.push(Box::new(move || {
                    if let Some(Err(reason)) = source.outcome() {
                        on_rejected(reason)
                    }
                }));
                return;
            }
            Settlement::Fulfilled(ref value) => {
                let value = value.clone();
                Box::new(move || on_fulfilled(value))
            }
            Settlement::Rejected(ref reason) => {
                let reason = reason.clone();
                Box::new(move || on_rejected(reason))
            }
        };
        drop(guard);
        self.scheduler.schedule(job);
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    /// Chains `on_fulfilled` and `on_rejected` onto this promise.
    ///
    /// The returned promise settles from whichever callback runs: `Ok(x)`
    /// goes through the resolution procedure, so `x` may be a plain value,
    /// a promise or any [`Thenable`](crate::Thenable); `Err(e)` rejects it
    /// with `e`.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{Error, Promise, Resolution};
    /// let p = Promise::<i32, Error>::new(|resolve, _| resolve.resolve(4));
    /// let q = p.then(
    ///     |v| Ok(Resolution::Value(v.to_string())),
    ///     |e| Ok(Resolution::Value(format!("failed: {}", e))),
    /// );
    /// assert_eq!(q.value(), Some("4".to_string()));
    /// ```
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Outcome<U, E> + Send + 'static,
        R: FnOnce(E) -> Outcome<U, E> + Send + 'static,
    {
        let downstream = Promise::pending(self.scheduler.clone());
        let fulfilled_downstream = downstream.clone();
        let rejected_downstream = downstream.clone();
        self.on_settle(
            move |value| fulfilled_downstream.settle_with(on_fulfilled(value)),
            move |reason| rejected_downstream.settle_with(on_rejected(reason)),
        );
        downstream
    }

    /// `then` without a rejection callback: reasons pass through unchanged.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Outcome<U, E> + Send + 'static,
    {
        self.then(on_fulfilled, handler::rethrow)
    }

    /// `then` without a fulfillment callback: values pass through unchanged.
    pub fn catch_error<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Outcome<T, E> + Send + 'static,
    {
        self.then(handler::identity, on_rejected)
    }

    fn settle_with(&self, outcome: Outcome<T, E>) {
        match outcome {
            Ok(x) => resolution::resolve_promise(self, x),
            Err(reason) => self.settle_failure(reason),
        }
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn resolve(&self, value: T) {
        self.promise.settle_success(value)
    }
}

impl<T, E> Rejecter<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn reject(&self, reason: E) {
        self.promise.settle_failure(reason)
    }
}

/// Awaiting a promise yields its outcome once it settles. Any number of
/// tasks may await clones of the same promise.
impl<T: Clone, E: Clone> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.lock();
        let promise = &mut *guard;
        match promise.settlement {
            Settlement::Fulfilled(ref value) => Poll::Ready(Ok(value.clone())),
            Settlement::Rejected(ref reason) => Poll::Ready(Err(reason.clone())),
            Settlement::Pending => {
                if !promise.waker.iter().any(|w| w.will_wake(cx.waker())) {
                    promise.waker.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Promise;
    use crate::{Error, Resolution, State};
    use futures::executor::block_on;
    use std::panic;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn value<T, E>(v: T) -> crate::Outcome<T, E> {
        Ok(Resolution::Value(v))
    }

    #[test]
    fn test_initializer_runs_synchronously() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let p = Promise::<i32, Error>::new(move |_, _| *flag.lock().unwrap() = true);
        assert!(*ran.lock().unwrap());
        assert_eq!(p.state(), State::Pending);
        assert_eq!(p.value(), None);
        assert_eq!(p.reason(), None);
    }

    #[test]
    fn test_first_settle_wins() {
        let p = Promise::<i32, Error>::new(|resolve, reject| {
            resolve.resolve(1);
            reject.reject(Error::reason("late"));
            resolve.resolve(2);
        });
        assert_eq!(p.state(), State::Fulfilled);
        assert_eq!(p.value(), Some(1));
        assert_eq!(p.reason(), None);

        p.settle_failure(Error::reason("later"));
        p.settle_success(3);
        assert_eq!(p.value(), Some(1));
    }

    #[test]
    fn test_reject_then_resolve_stays_rejected() {
        let p = Promise::<i32, Error>::new(|resolve, reject| {
            reject.reject(Error::reason("first"));
            resolve.resolve(1);
        });
        assert_eq!(p.state(), State::Rejected);
        assert_eq!(p.reason(), Some(Error::reason("first")));
        assert_eq!(p.value(), None);
    }

    #[test]
    fn test_reactions_fire_in_order() {
        let p = Promise::<i32, Error>::new(|_, _| {});
        let seen = Arc::new(Mutex::new(vec![]));
        for n in 1..=3 {
            let seen = seen.clone();
            p.and_then(move |v| {
                seen.lock().unwrap().push((n, v));
                value(())
            });
        }
        assert!(seen.lock().unwrap().is_empty());
        p.settle_success(9);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 9), (2, 9), (3, 9)]);
    }

    #[test]
    fn test_failing_reaction_does_not_stop_the_rest() {
        let p = Promise::<i32, Error>::new(|_, _| {});
        let first = p.and_then(|_| -> crate::Outcome<i32, Error> { Err(Error::reason("oops")) });
        let second = p.and_then(|v| value(v + 1));
        p.settle_success(1);
        assert_eq!(first.reason(), Some(Error::reason("oops")));
        assert_eq!(second.value(), Some(2));
    }

    #[test]
    fn test_panicking_reaction_unwinds_through_settle() {
        let p = Promise::<i32, Error>::new(|_, _| {});
        p.and_then(|_| -> crate::Outcome<i32, Error> { panic!("reaction failed") });
        let second = p.and_then(|v| value(v));
        let settled = panic::catch_unwind(panic::AssertUnwindSafe(|| p.settle_success(1)));
        assert!(settled.is_err());
        assert_eq!(p.state(), State::Fulfilled);
        assert_eq!(second.state(), State::Pending);

        // Later reactions on this thread still fire.
        let later = p.and_then(|v| value(v + 1));
        assert_eq!(later.value(), Some(2));
    }

    #[test]
    fn test_settlement_releases_both_queues() {
        let p = Promise::<i32, Error>::new(|_, _| {});
        let d = p.and_then(|v| value(v));
        assert_eq!(Arc::strong_count(&d.inner), 3);
        assert_eq!(Arc::strong_count(&p.inner), 3);
        p.settle_success(5);
        assert_eq!(Arc::strong_count(&d.inner), 1);
        assert_eq!(Arc::strong_count(&p.inner), 1);
        assert_eq!(d.value(), Some(5));
    }

    #[test]
    fn test_then_on_settled_runs_callback() {
        let p = Promise::<i32, Error>::new(|resolve, _| resolve.resolve(2));
        let q = p.and_then(|v| value(v * 3));
        assert_eq!(q.value(), Some(6));

        let r = Promise::<i32, Error>::new(|_, reject| reject.reject(Error::reason("no")));
        let s = r.then(|v| value(v), |e| value(e.to_string().len() as i32));
        assert_eq!(s.value(), Some(2));
    }

    #[test]
    fn test_then_from_inside_a_reaction() {
        let p = Promise::<i32, Error>::new(|_, _| {});
        let inner = Arc::new(Mutex::new(None));
        let source = p.clone();
        let slot = inner.clone();
        p.and_then(move |v| {
            *slot.lock().unwrap() = Some(source.and_then(|w| value(w + 100)));
            value(v)
        });
        p.settle_success(1);
        let chained = inner.lock().unwrap().take().unwrap();
        assert_eq!(chained.value(), Some(101));
    }

    #[test]
    fn test_catch_error_passes_values_through() {
        let p = Promise::<i32, Error>::new(|resolve, _| resolve.resolve(8));
        let q = p.catch_error(|_| value(0));
        assert_eq!(q.value(), Some(8));
    }

    #[test]
    fn test_ptr_eq() {
        let p = Promise::<i32, Error>::new(|_, _| {});
        let q = Promise::<i32, Error>::new(|_, _| {});
        assert!(p.ptr_eq(&p.clone()));
        assert!(!p.ptr_eq(&q));
    }

    #[test]
    fn test_await_resolved_on_other_thread() {
        let (p, resolver) = {
            let mut out = None;
            let p = Promise::<String, Error>::new(|resolve, _| out = Some(resolve));
            (p, out.unwrap())
        };
        let waiter = p.clone();
        let task1 = thread::spawn(move || block_on(waiter));
        let task2 = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve(String::from("🍓"));
        });
        task2.join().expect("The task2 thread has panicked");
        let got = task1.join().expect("The task1 thread has panicked");
        assert_eq!(got, Ok(String::from("🍓")));
    }

    #[test]
    fn test_await_from_two_tasks() {
        let mut out = None;
        let p = Promise::<i32, Error>::new(|_, reject| out = Some(reject));
        let rejecter = out.unwrap();
        let a = p.clone();
        let b = p.clone();
        let task1 = thread::spawn(move || block_on(a));
        let task2 = thread::spawn(move || block_on(b));
        thread::sleep(Duration::from_millis(20));
        rejecter.reject(Error::reason("reject!!"));
        assert_eq!(task1.join().unwrap(), Err(Error::reason("reject!!")));
        assert_eq!(task2.join().unwrap(), Err(Error::reason("reject!!")));
    }

    #[test]
    fn test_await_already_settled() {
        let p = Promise::<i32, Error>::new(|resolve, _| resolve.resolve(3));
        assert_eq!(block_on(p.and_then(|v| value(v + 1))), Ok(4));
    }
}
