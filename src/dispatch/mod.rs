//! Dispatch substrates and the state they share.
//!
//! Every substrate pulls `(item, index)` pairs from one [`JobFactory`] and
//! records outcomes into a [`Shared`] slab:
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │    JobFactory    │  (item, index) stream
//!                  └────────┬─────────┘
//!            ┌──────────────┼──────────────┐
//!      ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!      │ driver 0  │  │ driver 1  │  │ driver N  │   one thread per worker
//!      └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!       pipe │ pair    pipe │ pair    TCP  │ socket
//!      ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!      │  child 0  │  │  child 1  │  │  remote N │   worker-side serve loop
//!      └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! The thread substrate skips the channel layer and runs the task inline in
//! each driver. Results land at `results[index]`, so the final vector is in
//! source order no matter which worker finished first. The fault slot makes
//! the whole pool stop handing out work as soon as anything goes wrong;
//! exactly one fault survives to the caller.

pub(crate) mod direct;
pub(crate) mod endpoint;
pub(crate) mod ipc;
pub(crate) mod procs;
pub(crate) mod protocol;
pub(crate) mod remote;
pub(crate) mod serve;
pub(crate) mod threads;

use std::sync::Mutex;

use crate::error::{DispatchError, Result, TaskError};
use crate::options::{FinishHook, StartHook};

/// Why a run ended early.
pub(crate) enum Fault {
    Break,
    Kill,
    Error(DispatchError),
}

impl Fault {
    pub fn from_task_error(error: TaskError) -> Self {
        match error {
            TaskError::Break => Fault::Break,
            TaskError::Kill => Fault::Kill,
            TaskError::Fail { kind, message } => Fault::Error(DispatchError::Task { kind, message }),
        }
    }
}

/// Instrumentation hooks, run on the driver around each dispatch.
pub(crate) struct Hooks<I, O> {
    pub start: Option<StartHook<I>>,
    pub finish: Option<FinishHook<I, O>>,
}

/// State shared by all drivers of one run.
pub(crate) struct Shared<I, O> {
    results: Mutex<Vec<Option<O>>>,
    fault: Mutex<Option<Fault>>,
    hook_gate: Mutex<()>,
    hooks: Hooks<I, O>,
    preserve_results: bool,
}

impl<I, O> Shared<I, O> {
    pub fn new(size_hint: Option<usize>, hooks: Hooks<I, O>, preserve_results: bool) -> Self {
        let mut results = Vec::new();
        if preserve_results {
            if let Some(len) = size_hint {
                results.resize_with(len, || None);
            }
        }
        Self {
            results: Mutex::new(results),
            fault: Mutex::new(None),
            hook_gate: Mutex::new(()),
            hooks,
            preserve_results,
        }
    }

    pub fn fault_set(&self) -> bool {
        self.fault.lock().expect("fault slot poisoned").is_some()
    }

    /// Record a fault. A `Kill` is never superseded, and a `DeadWorker`
    /// never overwrites an existing fault: the death is a consequence, the
    /// stored fault is the cause. Everything else is last-writer-wins.
    pub fn record(&self, fault: Fault) {
        let mut slot = self.fault.lock().expect("fault slot poisoned");
        match (&*slot, &fault) {
            (Some(Fault::Kill), _) => {}
            (Some(_), Fault::Error(DispatchError::DeadWorker)) => {}
            _ => *slot = Some(fault),
        }
    }

    /// Store one result at its dense index.
    pub fn store(&self, index: usize, value: O) {
        if !self.preserve_results {
            return;
        }
        let mut results = self.results.lock().expect("result vector poisoned");
        if index >= results.len() {
            results.resize_with(index + 1, || None);
        }
        results[index] = Some(value);
    }

    pub fn on_start(&self, item: &I, index: usize) {
        if let Some(hook) = &self.hooks.start {
            let _gate = self.hook_gate.lock().expect("hook gate poisoned");
            hook(item, index);
        }
    }

    pub fn on_finish(&self, item: &I, index: usize, result: Option<&O>) {
        if let Some(hook) = &self.hooks.finish {
            let _gate = self.hook_gate.lock().expect("hook gate poisoned");
            hook(item, index, result);
        }
    }

    /// Resolve the run: the ordered results, no result at all (break/kill),
    /// or the single surviving error.
    pub fn into_outcome(self) -> Result<Option<Vec<O>>> {
        let fault = self.fault.into_inner().expect("fault slot poisoned");
        match fault {
            Some(Fault::Break) | Some(Fault::Kill) => Ok(None),
            Some(Fault::Error(err)) => Err(err),
            None => {
                let results = self.results.into_inner().expect("result vector poisoned");
                Ok(Some(results.into_iter().flatten().collect()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_shared() -> Shared<u32, u32> {
        Shared::new(
            Some(4),
            Hooks {
                start: None,
                finish: None,
            },
            true,
        )
    }

    #[test]
    fn test_results_come_back_in_index_order() {
        let shared = bare_shared();
        shared.store(2, 30);
        shared.store(0, 10);
        shared.store(1, 20);
        shared.store(3, 40);
        assert_eq!(shared.into_outcome().unwrap(), Some(vec![10, 20, 30, 40]));
    }

    #[test]
    fn test_kill_is_sticky() {
        let shared = bare_shared();
        shared.record(Fault::Kill);
        shared.record(Fault::Error(DispatchError::DeadWorker));
        shared.record(Fault::Break);
        assert!(shared.into_outcome().unwrap().is_none());
    }

    #[test]
    fn test_dead_worker_does_not_mask_the_cause() {
        let shared = bare_shared();
        shared.record(Fault::Error(DispatchError::Task {
            kind: "task failure".into(),
            message: "boom".into(),
        }));
        shared.record(Fault::Error(DispatchError::DeadWorker));
        match shared.into_outcome() {
            Err(DispatchError::Task { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("expected the task failure, got {other:?}"),
        }
    }

    #[test]
    fn test_dead_worker_alone_is_surfaced() {
        let shared = bare_shared();
        shared.record(Fault::Error(DispatchError::DeadWorker));
        assert!(matches!(
            shared.into_outcome(),
            Err(DispatchError::DeadWorker)
        ));
    }

    #[test]
    fn test_discarded_results_leave_an_empty_vector() {
        let shared: Shared<u32, u32> = Shared::new(
            Some(4),
            Hooks {
                start: None,
                finish: None,
            },
            false,
        );
        shared.store(0, 1);
        assert_eq!(shared.into_outcome().unwrap(), Some(vec![]));
    }
}
