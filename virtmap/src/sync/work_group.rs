//! A structured group of cooperating tasks with shared failure propagation.
//!
//! Every task receives a [`Canceller`]; the first task to fail or panic flips it, and
//! the remaining tasks are expected to observe it at their next blocking boundary and
//! return. The group never reports partial success: the caller sees the first error,
//! and panics are resumed on the calling thread.

use anyhow::Result;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cooperative-cancellation flag for one work group.
#[derive(Clone)]
pub struct Canceller(Arc<AtomicBool>);

impl Canceller {
    fn new() -> Self {
        Canceller(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One task of a work group.
pub type Task<'env> = Box<dyn FnOnce(&Canceller) -> Result<()> + Send + 'env>;

/// Run the tasks to completion on scoped threads.
///
/// Cancelled tasks that return `Ok(())` after observing the canceller do not mask the
/// originating failure; the first error reported wins.
pub fn run(tasks: Vec<Task<'_>>) -> Result<()> {
    let canceller = Canceller::new();
    let mut outcomes = Vec::with_capacity(tasks.len());
    std::thread::scope(|scope| {
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let canceller = canceller.clone();
                scope.spawn(move || {
                    let outcome = catch_unwind(AssertUnwindSafe(|| task(&canceller)));
                    if !matches!(outcome, Ok(Ok(()))) {
                        canceller.cancel();
                    }
                    outcome
                })
            })
            .collect();
        for handle in handles {
            // UNWRAP: the spawned closure catches its own panics.
            outcomes.push(handle.join().unwrap());
        }
    });
    let mut first_failure = None;
    for outcome in outcomes {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                if first_failure.is_none() {
                    first_failure = Some(error);
                }
            }
            Err(panic) => resume_unwind(panic),
        }
    }
    match first_failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::time::Duration;

    #[test]
    fn all_tasks_succeed() {
        let done = AtomicBool::new(false);
        run(vec![
            Box::new(|_| Ok(())),
            Box::new(|_| {
                done.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ])
        .unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn first_failure_cancels_siblings() {
        let sibling_saw_cancel = AtomicBool::new(false);
        let result = run(vec![
            Box::new(|_| bail!("task one broke")),
            Box::new(|canceller: &Canceller| {
                while !canceller.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                sibling_saw_cancel.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ]);
        assert_eq!(result.unwrap_err().to_string(), "task one broke");
        assert!(sibling_saw_cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn panics_resume_on_the_caller() {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            run(vec![Box::new(|_| panic!("boom"))])
        }));
        assert!(outcome.is_err());
    }
}
