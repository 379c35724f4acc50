//! fanout — a parallel work dispatcher.
//!
//! Applies a user-supplied task to every item of a bounded or unbounded
//! source, spreading the work across a pool of workers and returning the
//! results in source order. Three substrates are available:
//!
//! - **threads** — N in-process worker threads sharing one job stream;
//! - **processes** — N forked children, each driven over its own pipe pair
//!   (the default where fork is available);
//! - **distributed** — the same program started on remote hosts through a
//!   shell transport, connecting back to the caller over TCP.
//!
//! Failure semantics are strict: a run yields either every result in order,
//! no result at all (a task asked to [`TaskError::Break`] or
//! [`TaskError::Kill`] the run), or exactly one error.
//!
//! ```
//! use fanout::{map, Options};
//!
//! let squares = map(
//!     vec![1u64, 2, 3, 4],
//!     Options::new().in_threads().workers(2),
//!     |n| Ok(n * n),
//! )?;
//! assert_eq!(squares, Some(vec![1, 4, 9, 16]));
//! # Ok::<(), fanout::DispatchError>(())
//! ```
//!
//! Forked workers inherit the source and the task, so no registration step
//! is needed and array-mode jobs cross the pipe as bare indices:
//!
//! ```no_run
//! use fanout::{map, Options, TaskError};
//!
//! let result = map(
//!     (0..100u32).collect::<Vec<_>>(),
//!     Options::new().in_processes().workers(4),
//!     |n| {
//!         if *n == 13 {
//!             return Err(TaskError::failure("unlucky"));
//!         }
//!         Ok(n + 1)
//!     },
//! );
//! // The worker-side failure is re-raised here, exactly once.
//! assert!(result.is_err());
//! ```
//!
//! When the `MASTER` environment variable is set (the distributed master
//! sets it when relaunching the program on a remote host), `map` does not
//! dispatch at all: it connects back to the master, serves jobs until the
//! socket closes, and exits the process.

mod dispatch;
mod error;
mod factory;
mod interrupt;
pub mod logging;
mod options;
mod progress;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use dispatch::remote::{MASTER_ENV, NODE_ENV};
pub use error::{DispatchError, Result, TaskError, TaskResult};
pub use factory::{Job, JobFactory, JobSource, Produced};
pub use options::{DistributeConfig, FinishHook, Options, StartHook, Substrate};

/// Signal type accepted by [`Options::interrupt_signal`], re-exported from
/// `nix`.
pub use nix::sys::signal::Signal;

/// Number of CPUs available to this process.
pub fn processor_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Apply `task` to every item of `source` and collect the results in
/// source order.
///
/// Returns `Ok(None)` when a task ended the run with [`TaskError::Break`]
/// or [`TaskError::Kill`]; otherwise all results, or the single error that
/// stopped the run.
pub fn map<S, I, O, F>(source: S, options: Options<I, O>, task: F) -> Result<Option<Vec<O>>>
where
    S: Into<JobSource<I>>,
    I: Serialize + DeserializeOwned + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(&I) -> TaskResult<O> + Sync,
{
    run(source.into(), options, move |item: &I, _index| task(item))
}

/// Like [`map`], but the task also receives the item's dense index.
pub fn map_with_index<S, I, O, F>(
    source: S,
    options: Options<I, O>,
    task: F,
) -> Result<Option<Vec<O>>>
where
    S: Into<JobSource<I>>,
    I: Serialize + DeserializeOwned + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(&I, usize) -> TaskResult<O> + Sync,
{
    run(source.into(), options, task)
}

/// Run `task` for its side effects only: return values are discarded before
/// transport and the result vector is never built.
pub fn each<S, I, O, F>(source: S, options: Options<I, O>, task: F) -> Result<Option<()>>
where
    S: Into<JobSource<I>>,
    I: Serialize + DeserializeOwned + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(&I) -> TaskResult<O> + Sync,
{
    Ok(map(source, options.preserve_results(false), task)?.map(|_| ()))
}

/// Like [`each`], but the task also receives the item's dense index.
pub fn each_with_index<S, I, O, F>(source: S, options: Options<I, O>, task: F) -> Result<Option<()>>
where
    S: Into<JobSource<I>>,
    I: Serialize + DeserializeOwned + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(&I, usize) -> TaskResult<O> + Sync,
{
    Ok(map_with_index(source, options.preserve_results(false), task)?.map(|_| ()))
}

/// Launch `count` threads, hand each its thread index, and collect the
/// return values by index.
///
/// Unlike [`map`] this never serializes anything, so it carries no serde
/// bounds.
pub fn in_threads<O, F>(count: usize, task: F) -> Result<Option<Vec<O>>>
where
    O: Send,
    F: Fn(usize) -> TaskResult<O> + Sync,
{
    use std::sync::Mutex;

    let results: Mutex<Vec<Option<O>>> = Mutex::new((0..count).map(|_| None).collect());
    let fault: Mutex<Option<TaskError>> = Mutex::new(None);

    std::thread::scope(|scope| {
        let results = &results;
        let fault = &fault;
        let task = &task;
        for n in 0..count {
            std::thread::Builder::new()
                .name(format!("fanout-task-{n}"))
                .spawn_scoped(scope, move || match task(n) {
                    Ok(value) => {
                        results.lock().expect("result vector poisoned")[n] = Some(value);
                    }
                    Err(error) => {
                        *fault.lock().expect("fault slot poisoned") = Some(error);
                    }
                })
                .expect("failed to spawn task thread");
        }
    });

    match fault.into_inner().expect("fault slot poisoned") {
        Some(TaskError::Break) | Some(TaskError::Kill) => Ok(None),
        Some(TaskError::Fail { kind, message }) => Err(DispatchError::Task { kind, message }),
        None => Ok(Some(
            results
                .into_inner()
                .expect("result vector poisoned")
                .into_iter()
                .flatten()
                .collect(),
        )),
    }
}

/// Fork `count` workers, hand each worker indices `0..count`, and collect
/// the return values. Shorthand for a [`map`] over `0..count` on the
/// process substrate.
pub fn in_processes<O, F>(count: usize, task: F) -> Result<Option<Vec<O>>>
where
    O: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(usize) -> TaskResult<O> + Sync,
{
    map(
        0..count,
        Options::new().in_processes().workers(count),
        move |i: &usize| task(*i),
    )
}

/// Resolved pool shape for one run.
enum Pool {
    Direct,
    Threads(usize),
    Processes(usize),
}

/// Resolve substrate and pool size: explicit threads keep their count,
/// everything else becomes process workers (or serial execution where fork
/// is unavailable), and finite sources cap the pool at the job count.
fn resolve_pool<I, O>(options: &Options<I, O>, source_size: Option<usize>) -> Pool {
    let requested = options.workers.unwrap_or_else(processor_count);
    let capped = match source_size {
        Some(size) => requested.min(size),
        None => requested,
    };
    match options.substrate {
        Substrate::Threads if capped == 0 => Pool::Direct,
        Substrate::Threads => Pool::Threads(capped),
        Substrate::Processes | Substrate::Auto => {
            if !cfg!(unix) {
                tracing::warn!(
                    "process workers are unavailable on this platform; running serially"
                );
                Pool::Direct
            } else if capped == 0 {
                Pool::Direct
            } else {
                Pool::Processes(capped)
            }
        }
    }
}

fn run<I, O, F>(
    source: JobSource<I>,
    mut options: Options<I, O>,
    task: F,
) -> Result<Option<Vec<O>>>
where
    I: Serialize + DeserializeOwned + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(&I, usize) -> TaskResult<O> + Sync,
{
    let factory = JobFactory::new(source, options.max_rate);

    // A relaunch on a remote host serves jobs instead of dispatching; this
    // call never returns.
    if dispatch::remote::is_slave() {
        let workers = options.workers.unwrap_or_else(processor_count);
        dispatch::remote::run_slave(&factory, &task, workers, options.preserve_results);
    }

    if options.interrupt_signal.is_some() && options.substrate == Substrate::Threads {
        return Err(DispatchError::InvalidOptions(
            "interrupt_signal requires process workers".to_string(),
        ));
    }

    if let Some(title) = options.progress.take() {
        let Some(total) = factory.size() else {
            return Err(DispatchError::InvalidOptions(
                "progress reporting requires a finite source".to_string(),
            ));
        };
        options.finish = Some(progress::finish_hook(title, total, options.finish.take()));
    }

    let shared = dispatch::Shared::new(
        factory.size(),
        dispatch::Hooks {
            start: options.start.take(),
            finish: options.finish.take(),
        },
        options.preserve_results,
    );
    let interrupt_signal = options.interrupt_signal.unwrap_or(Signal::SIGINT);

    if let Some(dist) = &options.distribute {
        if options.substrate == Substrate::Threads {
            return Err(DispatchError::InvalidOptions(
                "distribute requires process workers".to_string(),
            ));
        }
        let per_host = options.workers.unwrap_or_else(processor_count);
        dispatch::remote::run_master(
            dist,
            per_host,
            &factory,
            &shared,
            options.sleep_after,
            interrupt_signal,
        )?;
        return shared.into_outcome();
    }

    match resolve_pool(&options, factory.size()) {
        Pool::Direct => dispatch::direct::run(&factory, &task, &shared),
        Pool::Threads(workers) => dispatch::threads::run(&factory, &task, &shared, workers),
        Pool::Processes(workers) => dispatch::procs::run(
            &factory,
            &task,
            &shared,
            workers,
            options.preserve_results,
            options.sleep_after,
            interrupt_signal,
        )?,
    }

    shared.into_outcome()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_count_is_positive() {
        assert!(processor_count() >= 1);
    }

    #[test]
    fn test_pool_caps_at_source_size() {
        let options: Options<u32, u32> = Options::new().in_threads().workers(16);
        match resolve_pool(&options, Some(3)) {
            Pool::Threads(n) => assert_eq!(n, 3),
            _ => panic!("expected a thread pool"),
        }
    }

    #[test]
    fn test_empty_source_resolves_to_direct() {
        let options: Options<u32, u32> = Options::new().in_threads();
        assert!(matches!(resolve_pool(&options, Some(0)), Pool::Direct));
    }

    #[test]
    fn test_unbounded_source_keeps_requested_count() {
        let options: Options<u32, u32> = Options::new().in_threads().workers(5);
        match resolve_pool(&options, None) {
            Pool::Threads(n) => assert_eq!(n, 5),
            _ => panic!("expected a thread pool"),
        }
    }

    #[test]
    fn test_default_substrate_is_processes() {
        let options: Options<u32, u32> = Options::new().workers(2);
        assert!(matches!(
            resolve_pool(&options, Some(10)),
            Pool::Processes(2)
        ));
    }
}
