//! Where reaction bodies run.
//!
//! A promise never runs a reaction by itself; it hands each one to its
//! [`Scheduler`]. The default [`Inline`] scheduler runs jobs before the
//! outermost settle or `then` call returns, which fires reactions
//! synchronously. A host with a task queue can supply its own scheduler so
//! that `then` always returns before any reaction runs.
use std::cell::RefCell;
use std::collections::VecDeque;

/// A reaction body, ready to run.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    fn schedule(&self, job: Job);
}

/// Runs jobs on the calling thread before the outermost `schedule` call
/// returns.
///
/// A job scheduled while another is running waits in a per-thread queue
/// until that one finishes, so long chains and deeply nested thenables run
/// in a loop instead of on the stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

thread_local! {
    // `Some` while the outermost `Inline::schedule` on this thread is draining.
    static INLINE_JOBS: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

/// Ends a drain, dropping jobs left behind by a panicking one.
struct Drain;

impl Drop for Drain {
    fn drop(&mut self) {
        let leftover = INLINE_JOBS.try_with(|jobs| jobs.borrow_mut().take());
        drop(leftover);
    }
}

impl Scheduler for Inline {
    fn schedule(&self, job: Job) {
        let first = INLINE_JOBS.with(|jobs| {
            let mut jobs = jobs.borrow_mut();
            if let Some(queue) = jobs.as_mut() {
                queue.push_back(job);
                return None;
            }
            *jobs = Some(VecDeque::new());
            Some(job)
        });
        let Some(first) = first else { return };
        let _drain = Drain;
        first();
        while let Some(job) = INLINE_JOBS.with(|jobs| jobs.borrow_mut().as_mut()?.pop_front()) {
            job();
        }
    }
}

/// Any `Fn(Job)` is a scheduler, e.g. a closure pushing onto a host queue.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Job, Promise, Error, Resolution};
/// use std::sync::{Arc, Mutex};
/// let queue: Arc<Mutex<Vec<Job>>> = Arc::default();
/// let q = queue.clone();
/// let p = Promise::<i32, Error>::with_scheduler(
///     Arc::new(move |job: Job| q.lock().unwrap().push(job)),
///     |resolve, _| resolve.resolve(1),
/// );
/// let next = p.and_then(|v| Ok(Resolution::Value(v + 1)));
/// assert_eq!(next.value(), None);
/// let jobs: Vec<Job> = queue.lock().unwrap().drain(..).collect();
/// jobs.into_iter().for_each(|job| job());
/// assert_eq!(next.value(), Some(2));
/// ```
impl<F> Scheduler for F
where
    F: Fn(Job) + Send + Sync,
{
    fn schedule(&self, job: Job) {
        self(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_inline_runs_now() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        Inline.schedule(Box::new(move || *flag.lock().unwrap() = true));
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn test_inline_runs_nested_jobs_after_the_current_one() {
        let order = Arc::new(Mutex::new(vec![]));
        let log = order.clone();
        Inline.schedule(Box::new(move || {
            let inner = log.clone();
            Inline.schedule(Box::new(move || inner.lock().unwrap().push("nested")));
            log.lock().unwrap().push("outer");
        }));
        assert_eq!(*order.lock().unwrap(), vec!["outer", "nested"]);
    }

    #[test]
    fn test_inline_recovers_after_a_panicking_job() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let result = std::panic::catch_unwind(move || {
            Inline.schedule(Box::new(move || {
                Inline.schedule(Box::new(move || *flag.lock().unwrap() = true));
                panic!("job failed");
            }))
        });
        assert!(result.is_err());
        assert!(!*ran.lock().unwrap());

        let again = Arc::new(Mutex::new(false));
        let flag = again.clone();
        Inline.schedule(Box::new(move || *flag.lock().unwrap() = true));
        assert!(*again.lock().unwrap());
    }

    #[test]
    fn test_closure_scheduler_defers() {
        let queue: Arc<Mutex<Vec<Job>>> = Arc::default();
        let q = queue.clone();
        let scheduler = move |job: Job| q.lock().unwrap().push(job);
        let ran = Arc::new(Mutex::new(0));
        for _ in 0..2 {
            let ran = ran.clone();
            scheduler.schedule(Box::new(move || *ran.lock().unwrap() += 1));
        }
        assert_eq!(*ran.lock().unwrap(), 0);
        let jobs: Vec<Job> = queue.lock().unwrap().drain(..).collect();
        jobs.into_iter().for_each(|job| job());
        assert_eq!(*ran.lock().unwrap(), 2);
    }
}
