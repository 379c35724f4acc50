//! Serial executor: runs every job in the caller's thread.
//!
//! Used when the resolved pool size is zero, or when the caller asked for
//! process workers on a platform without fork.

use super::{Fault, Shared};
use crate::error::TaskResult;
use crate::factory::JobFactory;

pub(crate) fn run<I, O, F>(factory: &JobFactory<I>, task: &F, shared: &Shared<I, O>)
where
    F: Fn(&I, usize) -> TaskResult<O>,
{
    pull_jobs(factory, task, shared);
}

/// Pull-and-run loop shared by the serial executor and each pool thread.
pub(super) fn pull_jobs<I, O, F>(factory: &JobFactory<I>, task: &F, shared: &Shared<I, O>)
where
    F: Fn(&I, usize) -> TaskResult<O>,
{
    loop {
        if shared.fault_set() {
            return;
        }
        let Some(job) = factory.next() else { return };
        shared.on_start(job.item(), job.index);
        match task(job.item(), job.index) {
            Ok(value) => {
                shared.on_finish(job.item(), job.index, Some(&value));
                shared.store(job.index, value);
            }
            Err(error) => {
                shared.on_finish(job.item(), job.index, None);
                shared.record(Fault::from_task_error(error));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Hooks;
    use crate::error::TaskError;
    use crate::factory::JobSource;

    fn shared_for(len: usize) -> Shared<u32, u32> {
        Shared::new(
            Some(len),
            Hooks {
                start: None,
                finish: None,
            },
            true,
        )
    }

    #[test]
    fn test_serial_run_keeps_order() {
        let factory = JobFactory::new(JobSource::from(vec![1u32, 2, 3]), None);
        let shared = shared_for(3);
        run(&factory, &|item, _| Ok(item * item), &shared);
        assert_eq!(shared.into_outcome().unwrap(), Some(vec![1, 4, 9]));
    }

    #[test]
    fn test_serial_run_stops_on_failure() {
        let factory = JobFactory::new(JobSource::from(vec![1u32, 2, 3]), None);
        let shared = shared_for(3);
        run(
            &factory,
            &|item, _| {
                if *item == 2 {
                    Err(TaskError::failure("no twos"))
                } else {
                    Ok(*item)
                }
            },
            &shared,
        );
        assert!(shared.into_outcome().is_err());
        // The third job was never pulled.
        assert!(factory.next().is_some());
    }
}
