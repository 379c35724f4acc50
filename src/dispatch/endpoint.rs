//! Master-side handle for a single worker, local or remote.
//!
//! Local workers are forked children reached through a pipe pair and carry a
//! pid; remote workers share one duplex socket and have none. The request /
//! reply discipline over a single channel serializes jobs per worker, which
//! is what lets the driver use channel readiness as its free-slot signal.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{read_frame, write_frame, JobFrame, ReplyFrame};
use crate::error::{DispatchError, Result};

pub(crate) struct Worker {
    reader: LineReader<Box<dyn Read + Send>>,
    writer: Option<LineWriter<Box<dyn Write + Send>>>,
    pid: Option<Pid>,
    remote: bool,
}

impl Worker {
    /// Wrap a forked child: jobs go down `writer`, replies come up `reader`.
    pub fn from_pipes(pid: Pid, reader: PipeFd, writer: PipeFd) -> Self {
        Self {
            reader: LineReader::new(Box::new(reader)),
            writer: Some(LineWriter::new(Box::new(writer))),
            pid: Some(pid),
            remote: false,
        }
    }

    /// Wrap a connect-back socket from a remote worker.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let reader = stream.try_clone()?;
        Ok(Self {
            reader: LineReader::new(Box::new(reader)),
            writer: Some(LineWriter::new(Box::new(stream))),
            pid: None,
            remote: true,
        })
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Ship one job and block for the paired reply.
    ///
    /// A channel that closes under us — broken pipe on write, or EOF before
    /// a full reply — surfaces as [`DispatchError::DeadWorker`].
    pub fn work<I, O>(&mut self, frame: JobFrame<&I>) -> Result<ReplyFrame<O>>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let writer = self.writer.as_mut().ok_or(DispatchError::DeadWorker)?;
        match write_frame(writer, &Some(frame)) {
            Ok(()) => {}
            Err(err) if is_disconnect(&err) => return Err(DispatchError::DeadWorker),
            Err(err) => return Err(err.into()),
        }
        match read_frame::<_, ReplyFrame<O>>(&mut self.reader) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(DispatchError::DeadWorker),
            Err(err) if is_disconnect(&err) => Err(DispatchError::DeadWorker),
            Err(err) => Err(err.into()),
        }
    }

    /// Close this worker's write side. The child sees EOF on its job channel
    /// and exits its loop; a remote worker is first told to exit with the
    /// `null` terminator, since the socket stays open for the peer to reap.
    pub fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if self.remote {
                let _ = write_frame(&mut writer, &None::<JobFrame<&()>>);
            }
        }
    }

    /// Block until the child exits, swallowing interrupts. A no-op for
    /// remote workers: their lifetime belongs to the remote host.
    pub fn wait(&mut self) {
        if let Some(pid) = self.pid.take() {
            loop {
                match waitpid(pid, None) {
                    Err(Errno::EINTR) => continue,
                    _ => break,
                }
            }
        }
    }
}

/// Hard-kill a set of worker pids, skipping `except`. Workers that already
/// exited (ESRCH) are ignored.
pub(crate) fn kill_survivors(pids: &[Pid], except: Option<Pid>) {
    for &pid in pids {
        if Some(pid) == except {
            continue;
        }
        match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => tracing::warn!(pid = pid.as_raw(), error = %err, "failed to kill worker"),
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Build a Worker wired to an in-process echo loop over real pipes.
    fn echo_worker() -> (Worker, thread::JoinHandle<()>) {
        let (job_rx, job_tx) = nix::unistd::pipe().unwrap();
        let (reply_rx, reply_tx) = nix::unistd::pipe().unwrap();

        let handle = thread::spawn(move || {
            let mut reader = LineReader::new(PipeFd::new(job_rx));
            let mut writer = LineWriter::new(PipeFd::new(reply_tx));
            while let Ok(Some(frame)) =
                read_frame::<_, Option<JobFrame<u32>>>(&mut reader)
            {
                let Some(frame) = frame else { break };
                let reply = ReplyFrame::Value {
                    value: frame.item.map(|n| n * 2),
                };
                if write_frame(&mut writer, &reply).is_err() {
                    break;
                }
            }
        });

        let worker = Worker::from_pipes(
            Pid::from_raw(0),
            PipeFd::new(reply_rx),
            PipeFd::new(job_tx),
        );
        (worker, handle)
    }

    #[test]
    fn test_work_is_request_reply() {
        let (mut worker, handle) = echo_worker();
        // Take the pid back out so close/wait skip process handling.
        worker.pid = None;

        let reply: ReplyFrame<u32> = worker
            .work(JobFrame {
                index: 0,
                item: Some(&21),
            })
            .unwrap();
        match reply {
            ReplyFrame::Value { value } => assert_eq!(value, Some(42)),
            ReplyFrame::Fault { .. } => panic!("expected a value"),
        }

        worker.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_dead_worker_on_eof() {
        let (mut worker, handle) = echo_worker();
        worker.pid = None;

        // Closing our write side makes the echo loop exit; the next work
        // call cannot ship its job and must report a dead worker.
        worker.close();
        handle.join().unwrap();

        let err = worker
            .work::<u32, u32>(JobFrame {
                index: 0,
                item: Some(&1),
            })
            .unwrap_err();
        assert!(matches!(err, DispatchError::DeadWorker));
    }
}
