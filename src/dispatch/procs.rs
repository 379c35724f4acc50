//! Process-pool executor: forked children over pipe pairs.
//!
//! Children are forked after the source is materialized, so they inherit
//! the factory, the source, and the task itself; array-mode job frames can
//! carry nothing but the index. Each child gets a dedicated pipe pair and a
//! dedicated driver thread in the parent: the driver will not fetch a new
//! job until the previous reply arrives, so the factory is pulled at
//! exactly the aggregate worker throughput.

use std::os::fd::OwnedFd;
use std::thread;

use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{fork, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::endpoint::{kill_survivors, Worker};
use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::ReplyFrame;
use super::serve::serve;
use super::{Fault, Shared};
use crate::error::{Result, TaskError, TaskResult};
use crate::factory::JobFactory;
use crate::interrupt;

pub(crate) fn run<I, O, F>(
    factory: &JobFactory<I>,
    task: &F,
    shared: &Shared<I, O>,
    workers: usize,
    preserve_results: bool,
    sleep_after: bool,
    interrupt_signal: Signal,
) -> Result<()>
where
    I: Serialize + DeserializeOwned + Send + Sync,
    O: Serialize + DeserializeOwned + Send,
    F: Fn(&I, usize) -> TaskResult<O> + Sync,
{
    let pool = fork_children(factory, task, workers, preserve_results)?;
    let pids: Vec<_> = pool.iter().filter_map(Worker::pid).collect();
    tracing::debug!(workers = pool.len(), "forked worker pool");

    interrupt::scoped_kill_on_interrupt(&pids, interrupt_signal, || {
        drive(pool, &pids, factory, shared, sleep_after);
    })
}

/// Fork `n` children. Each child closes the endpoints that belong to its
/// siblings and to the parent side of its own pipes, runs the worker loop,
/// and exits without returning.
fn fork_children<I, O, F>(
    factory: &JobFactory<I>,
    task: &F,
    n: usize,
    preserve_results: bool,
) -> Result<Vec<Worker>>
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(&I, usize) -> TaskResult<O>,
{
    let mut pool: Vec<Worker> = Vec::with_capacity(n);
    for _ in 0..n {
        let pipes = nix::unistd::pipe().and_then(|job| Ok((job, nix::unistd::pipe()?)));
        let ((job_rx, job_tx), (reply_rx, reply_tx)) = match pipes {
            Ok(pipes) => pipes,
            Err(err) => {
                teardown(pool);
                return Err(err.into());
            }
        };
        let forked = match unsafe { fork() } {
            Ok(forked) => forked,
            Err(err) => {
                teardown(pool);
                return Err(err.into());
            }
        };
        match forked {
            ForkResult::Child => {
                drop(job_tx);
                drop(reply_rx);
                // Earlier siblings' parent-side endpoints were inherited
                // across the fork; dropping them here is what lets each
                // sibling see EOF when the parent closes its own copy.
                pool.clear();
                run_child(factory, task, job_rx, reply_tx, preserve_results);
            }
            ForkResult::Parent { child } => {
                drop(job_rx);
                drop(reply_tx);
                pool.push(Worker::from_pipes(
                    child,
                    PipeFd::new(reply_rx),
                    PipeFd::new(job_tx),
                ));
            }
        }
    }
    Ok(pool)
}

/// Close and reap workers that were already forked when pool setup failed.
fn teardown(pool: Vec<Worker>) {
    for mut worker in pool {
        worker.close();
        worker.wait();
    }
}

fn run_child<I, O, F>(
    factory: &JobFactory<I>,
    task: &F,
    job_rx: OwnedFd,
    reply_tx: OwnedFd,
    preserve_results: bool,
) -> !
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(&I, usize) -> TaskResult<O>,
{
    // Pipe failures must come back as io errors, not terminate the child.
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
    let mut reader = LineReader::new(PipeFd::new(job_rx));
    let mut writer = LineWriter::new(PipeFd::new(reply_tx));
    match serve(factory, task, &mut reader, &mut writer, preserve_results) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            eprintln!("fanout worker: {err}");
            std::process::exit(1);
        }
    }
}

/// Drive a pool of workers to completion: one driver thread per worker,
/// all pulling from the shared factory. Also used by the distributed
/// executor, where `kill_pids` holds the local shell children instead of
/// the workers themselves.
pub(crate) fn drive<I, O>(
    pool: Vec<Worker>,
    kill_pids: &[Pid],
    factory: &JobFactory<I>,
    shared: &Shared<I, O>,
    sleep_after: bool,
) where
    I: Serialize + Send + Sync,
    O: DeserializeOwned + Send,
{
    thread::scope(|scope| {
        for (n, worker) in pool.into_iter().enumerate() {
            thread::Builder::new()
                .name(format!("fanout-driver-{n}"))
                .spawn_scoped(scope, move || {
                    drive_one(worker, kill_pids, factory, shared, sleep_after)
                })
                .expect("failed to spawn driver thread");
        }
    });
}

fn drive_one<I, O>(
    mut worker: Worker,
    kill_pids: &[Pid],
    factory: &JobFactory<I>,
    shared: &Shared<I, O>,
    sleep_after: bool,
) where
    I: Serialize,
    O: DeserializeOwned,
{
    loop {
        if shared.fault_set() {
            break;
        }
        let Some(job) = factory.next() else { break };
        shared.on_start(job.item(), job.index);
        let frame = factory.pack(&job);
        match worker.work::<I, O>(frame) {
            Ok(ReplyFrame::Value { value }) => {
                shared.on_finish(job.item(), job.index, value.as_ref());
                if let Some(value) = value {
                    shared.store(job.index, value);
                }
            }
            Ok(ReplyFrame::Fault { error }) => {
                shared.on_finish(job.item(), job.index, None);
                let is_kill = matches!(error, TaskError::Kill);
                shared.record(Fault::from_task_error(error));
                if is_kill {
                    // Surviving workers go down immediately; their drivers
                    // observe the death and stop.
                    kill_survivors(kill_pids, worker.pid());
                }
                break;
            }
            Err(err) => {
                shared.record(Fault::Error(err));
                break;
            }
        }
    }

    if !sleep_after {
        worker.close();
        worker.wait();
    }
}
