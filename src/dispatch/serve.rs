//! Worker-side request loop.
//!
//! Runs in a forked child (over its pipe pair) or in a connect-back remote
//! worker (over its socket). The loop ends cleanly on EOF — the dispatcher
//! closed the channel — or on an explicit `null` terminator frame. Any
//! framing failure is terminal for this worker.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::ipc::{LineReader, LineWriter};
use super::protocol::{read_frame, write_frame, JobFrame, ReplyFrame};
use crate::error::{TaskError, TaskResult};
use crate::factory::JobFactory;

pub(crate) fn serve<I, O, F, R, W>(
    factory: &JobFactory<I>,
    task: &F,
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
    preserve_results: bool,
) -> io::Result<()>
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(&I, usize) -> TaskResult<O>,
    R: Read,
    W: Write,
{
    loop {
        let frame = match read_frame::<_, Option<JobFrame<I>>>(reader)? {
            None => return Ok(()),       // dispatcher closed the channel
            Some(None) => return Ok(()), // explicit shutdown
            Some(Some(frame)) => frame,
        };

        let job = match factory.unpack(frame) {
            Ok(job) => job,
            Err(err) => {
                let reply = ReplyFrame::<O>::Fault {
                    error: TaskError::failure_with_kind("protocol violation", err),
                };
                write_frame(writer, &reply)?;
                continue;
            }
        };

        let reply = match task(job.item(), job.index) {
            Ok(value) => ReplyFrame::Value {
                value: preserve_results.then_some(value),
            },
            Err(error) => ReplyFrame::Fault { error },
        };
        write_reply(writer, &reply)?;
    }
}

/// Frame a reply; a value that cannot cross the wire is substituted with a
/// fault that carries the serializer's report.
fn write_reply<O: Serialize, W: Write>(
    writer: &mut LineWriter<W>,
    reply: &ReplyFrame<O>,
) -> io::Result<()> {
    let line = match serde_json::to_string(reply) {
        Ok(line) => line,
        Err(err) => {
            let fallback = ReplyFrame::<O>::Fault {
                error: TaskError::failure_with_kind("undumpable result", err),
            };
            serde_json::to_string(&fallback)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        }
    };
    writer.write_line(&line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ipc::PipeFd;
    use crate::factory::JobSource;
    use std::thread;

    fn pipe_pair() -> (PipeFd, PipeFd) {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        (PipeFd::new(read_fd), PipeFd::new(write_fd))
    }

    #[test]
    fn test_serve_resolves_array_indices_locally() {
        let (job_rx, job_tx) = pipe_pair();
        let (reply_rx, reply_tx) = pipe_pair();

        let handle = thread::spawn(move || {
            let factory = JobFactory::new(JobSource::from(vec![10u32, 20, 30]), None);
            let mut reader = LineReader::new(job_rx);
            let mut writer = LineWriter::new(reply_tx);
            serve(
                &factory,
                &|item: &u32, index| Ok(item + index as u32),
                &mut reader,
                &mut writer,
                true,
            )
        });

        let mut job_writer = LineWriter::new(job_tx);
        let mut reply_reader = LineReader::new(reply_rx);

        // Array-mode: ship bare indices, the worker looks items up itself.
        for index in [2usize, 0] {
            write_frame(&mut job_writer, &Some(JobFrame::<&u32> { index, item: None })).unwrap();
        }
        write_frame(&mut job_writer, &None::<JobFrame<&u32>>).unwrap();

        let first: ReplyFrame<u32> = read_frame(&mut reply_reader).unwrap().unwrap();
        let second: ReplyFrame<u32> = read_frame(&mut reply_reader).unwrap().unwrap();
        assert!(matches!(first, ReplyFrame::Value { value: Some(32) }));
        assert!(matches!(second, ReplyFrame::Value { value: Some(10) }));

        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_serve_discards_values_when_not_preserving() {
        let (job_rx, job_tx) = pipe_pair();
        let (reply_rx, reply_tx) = pipe_pair();

        let handle = thread::spawn(move || {
            let factory: JobFactory<u32> =
                JobFactory::new(JobSource::from_producer(|| unreachable!()), None);
            let mut reader = LineReader::new(job_rx);
            let mut writer = LineWriter::new(reply_tx);
            serve(
                &factory,
                &|item: &u32, _| Ok(*item),
                &mut reader,
                &mut writer,
                false,
            )
        });

        let mut job_writer = LineWriter::new(job_tx);
        let mut reply_reader = LineReader::new(reply_rx);
        write_frame(
            &mut job_writer,
            &Some(JobFrame {
                index: 0,
                item: Some(&7u32),
            }),
        )
        .unwrap();
        drop(job_writer); // EOF ends the loop

        let reply: ReplyFrame<u32> = read_frame(&mut reply_reader).unwrap().unwrap();
        assert!(matches!(reply, ReplyFrame::Value { value: None }));

        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_serve_wraps_task_failures() {
        let (job_rx, job_tx) = pipe_pair();
        let (reply_rx, reply_tx) = pipe_pair();

        let handle = thread::spawn(move || {
            let factory = JobFactory::new(JobSource::from(vec![1u32]), None);
            let mut reader = LineReader::new(job_rx);
            let mut writer = LineWriter::new(reply_tx);
            serve(
                &factory,
                &|_: &u32, _| -> TaskResult<u32> { Err(TaskError::failure("boom")) },
                &mut reader,
                &mut writer,
                true,
            )
        });

        let mut job_writer = LineWriter::new(job_tx);
        let mut reply_reader = LineReader::new(reply_rx);
        write_frame(&mut job_writer, &Some(JobFrame::<&u32> { index: 0, item: None })).unwrap();
        drop(job_writer);

        let reply: ReplyFrame<u32> = read_frame(&mut reply_reader).unwrap().unwrap();
        match reply {
            ReplyFrame::Fault { error } => assert_eq!(error, TaskError::failure("boom")),
            ReplyFrame::Value { .. } => panic!("expected a fault"),
        }
        handle.join().unwrap().unwrap();
    }
}
