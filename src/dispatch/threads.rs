//! Thread-pool executor: N worker threads sharing the job factory.
//!
//! Each thread runs the same pull-and-run loop as the serial executor; the
//! shared fault slot stops the whole pool as soon as one task fails.

use std::thread;

use super::{direct, Shared};
use crate::error::TaskResult;
use crate::factory::JobFactory;

pub(crate) fn run<I, O, F>(
    factory: &JobFactory<I>,
    task: &F,
    shared: &Shared<I, O>,
    workers: usize,
) where
    I: Send + Sync,
    O: Send,
    F: Fn(&I, usize) -> TaskResult<O> + Sync,
{
    thread::scope(|scope| {
        for n in 0..workers {
            thread::Builder::new()
                .name(format!("fanout-worker-{n}"))
                .spawn_scoped(scope, || direct::pull_jobs(factory, task, shared))
                .expect("failed to spawn worker thread");
        }
    });
}
