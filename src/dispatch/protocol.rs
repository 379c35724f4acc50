//! Wire protocol for dispatcher-to-worker traffic.
//!
//! Frames are JSON-serialized and newline-delimited, and each frame is
//! atomic. Only three frame kinds cross the wire: a job (`JobFrame`, sent as
//! `Option::Some`), a reply (`ReplyFrame`), and a bare `null` terminator
//! (`Option::None`) telling the worker to shut down cleanly. A
//! [`ReplyFrame::Fault`] is the transportable wrapper for a worker-side
//! failure.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ipc::{LineReader, LineWriter};
use crate::error::TaskError;

/// A job shipped to a worker.
///
/// `item` is absent for array-mode sources: the worker holds its own copy of
/// the source and resolves the index locally.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub(crate) struct JobFrame<T> {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<T>,
}

/// A worker's reply to a single job.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ReplyFrame<O> {
    /// Successful completion; `value` is absent when results are not
    /// preserved.
    Value { value: Option<O> },
    /// A worker-side failure, wrapped for transport.
    Fault { error: TaskError },
}

/// Serialize one frame onto the channel.
pub(crate) fn write_frame<W: Write, T: Serialize>(
    writer: &mut LineWriter<W>,
    frame: &T,
) -> io::Result<()> {
    let line = serde_json::to_string(frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_line(&line)
}

/// Read one frame off the channel. Returns `None` on EOF.
pub(crate) fn read_frame<R: Read, T: DeserializeOwned>(
    reader: &mut LineReader<R>,
) -> io::Result<Option<T>> {
    match reader.read_line()? {
        None => Ok(None),
        Some(line) => serde_json::from_str(line)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
    }
}
