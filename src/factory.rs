//! Job production: sources, the shared job factory, and rate limiting.
//!
//! The [`JobFactory`] turns a [`JobSource`] into a thread-safe stream of
//! `(item, index)` pairs with indices that are unique and dense from 0.
//! Every executor substrate pulls from one factory; worker processes hold a
//! copy of it (inherited across `fork`) so that array-mode wire frames can
//! carry nothing but the index.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::dispatch::protocol::JobFrame;
use crate::error::{DispatchError, Result};

/// Length of one throttle tick in milliseconds.
const TICK_MS: u64 = 100;

/// What a producer yields: the next item, or the end of the stream.
pub enum Produced<I> {
    Item(I),
    Stop,
}

/// Boxed producer callable, as stored by producer-mode sources.
pub type Producer<I> = Box<dyn FnMut() -> Produced<I> + Send>;

/// Where jobs come from.
///
/// Array-mode sources have a known finite length and are addressed by index;
/// producer-mode sources are drained one call at a time until they yield
/// [`Produced::Stop`].
pub enum JobSource<I> {
    /// Finite ordered items, addressed by index.
    Items(Vec<I>),
    /// A callable producing items until it signals the end of the stream.
    Producer(Producer<I>),
}

impl<I: 'static> JobSource<I> {
    /// Wrap a producer callable.
    pub fn from_producer(producer: impl FnMut() -> Produced<I> + Send + 'static) -> Self {
        Self::Producer(Box::new(producer))
    }

    /// Drain a channel; a disconnected sender ends the stream.
    pub fn from_channel(receiver: crossbeam_channel::Receiver<I>) -> Self
    where
        I: Send,
    {
        Self::from_producer(move || match receiver.recv() {
            Ok(item) => Produced::Item(item),
            Err(_) => Produced::Stop,
        })
    }
}

impl<I> From<Vec<I>> for JobSource<I> {
    fn from(items: Vec<I>) -> Self {
        Self::Items(items)
    }
}

impl<I: Send + 'static> From<crossbeam_channel::Receiver<I>> for JobSource<I> {
    fn from(receiver: crossbeam_channel::Receiver<I>) -> Self {
        Self::from_channel(receiver)
    }
}

impl<I> From<std::ops::Range<I>> for JobSource<I>
where
    std::ops::Range<I>: Iterator<Item = I>,
{
    fn from(range: std::ops::Range<I>) -> Self {
        Self::Items(range.collect())
    }
}

/// One job handed to a driver: the item and its dense index.
#[derive(Debug)]
pub struct Job<'a, I> {
    pub index: usize,
    item: ItemRef<'a, I>,
}

#[derive(Debug)]
enum ItemRef<'a, I> {
    Borrowed(&'a I),
    Owned(I),
}

impl<'a, I> Job<'a, I> {
    pub fn item(&self) -> &I {
        match &self.item {
            ItemRef::Borrowed(item) => item,
            ItemRef::Owned(item) => item,
        }
    }
}

struct FactoryState<I> {
    /// Last index handed out; the next pair uses `index + 1`.
    index: i64,
    /// Set once the producer yields `Stop`; never called again after that.
    stopped: bool,
    producer: Option<Producer<I>>,
}

/// Thread-safe stream of `(item, index)` pairs over a [`JobSource`].
///
/// Array items live outside the state mutex and are only ever read; the
/// mutex guards the index, the stopped flag, and the producer, so in
/// producer-mode the producer call and the index increment share one
/// critical section and no two consumers ever see the same index.
pub struct JobFactory<I> {
    items: Option<Vec<I>>,
    state: Mutex<FactoryState<I>>,
    throttle: Option<Mutex<Throttle>>,
}

impl<I> JobFactory<I> {
    pub fn new(source: JobSource<I>, max_rate: Option<f64>) -> Self {
        let (items, producer) = match source {
            JobSource::Items(items) => (Some(items), None),
            JobSource::Producer(producer) => (None, Some(producer)),
        };
        Self {
            items,
            state: Mutex::new(FactoryState {
                index: -1,
                stopped: false,
                producer,
            }),
            throttle: max_rate.map(|rate| Mutex::new(Throttle::new(rate))),
        }
    }

    /// Number of jobs this factory will produce, if known up front.
    /// Producer-mode sources report `None` (unbounded).
    pub fn size(&self) -> Option<usize> {
        self.items.as_ref().map(Vec::len)
    }

    fn exhausted(&self) -> bool {
        let state = self.state.lock().expect("factory state poisoned");
        match &self.items {
            Some(items) => state.index + 1 >= items.len() as i64,
            None => state.stopped,
        }
    }

    /// Fetch the next job, or `None` once the source is drained.
    ///
    /// When a rate limit is armed, admission happens before the critical
    /// section so a full bucket never holds the factory mutex; callers nap
    /// for random sub-tick intervals until a slot opens or the source ends.
    pub fn next(&self) -> Option<Job<'_, I>> {
        if let Some(throttle) = &self.throttle {
            loop {
                if self.exhausted() {
                    return None;
                }
                if throttle.lock().expect("throttle state poisoned").admit() {
                    break;
                }
                let nap = rand::thread_rng().gen_range(1..=TICK_MS / 4);
                thread::sleep(Duration::from_millis(nap));
            }
        }

        let mut state = self.state.lock().expect("factory state poisoned");
        match &self.items {
            Some(items) => {
                if state.index + 1 >= items.len() as i64 {
                    return None;
                }
                state.index += 1;
                let index = state.index as usize;
                drop(state);
                Some(Job {
                    index,
                    item: ItemRef::Borrowed(&items[index]),
                })
            }
            None => {
                if state.stopped {
                    return None;
                }
                let produced = match state.producer.as_mut() {
                    Some(producer) => producer(),
                    None => return None,
                };
                match produced {
                    Produced::Stop => {
                        state.stopped = true;
                        None
                    }
                    Produced::Item(item) => {
                        state.index += 1;
                        Some(Job {
                            index: state.index as usize,
                            item: ItemRef::Owned(item),
                        })
                    }
                }
            }
        }
    }

    /// Build the wire frame for a job. Array-mode frames carry only the
    /// index; the worker recovers the item from its own copy of the source.
    pub(crate) fn pack<'a>(&self, job: &'a Job<'a, I>) -> JobFrame<&'a I> {
        JobFrame {
            index: job.index,
            item: match self.items {
                Some(_) => None,
                None => Some(job.item()),
            },
        }
    }

    /// Resolve a wire frame back into a job on the worker side.
    pub(crate) fn unpack(&self, frame: JobFrame<I>) -> Result<Job<'_, I>> {
        match &self.items {
            Some(items) => match items.get(frame.index) {
                Some(item) => Ok(Job {
                    index: frame.index,
                    item: ItemRef::Borrowed(item),
                }),
                None => Err(DispatchError::Protocol(format!(
                    "job index {} out of range",
                    frame.index
                ))),
            },
            None => match frame.item {
                Some(item) => Ok(Job {
                    index: frame.index,
                    item: ItemRef::Owned(item),
                }),
                None => Err(DispatchError::Protocol(
                    "job frame carries no item for a producer-mode source".to_string(),
                )),
            },
        }
    }
}

/// Token bucket: at most `jobs_per_tick` admissions per wall-clock tick,
/// shared by every consumer of the factory.
struct Throttle {
    jobs_per_tick: u64,
    current_tick: u64,
    current_calls: u64,
}

impl Throttle {
    fn new(max_rate: f64) -> Self {
        let jobs_per_tick = (max_rate * TICK_MS as f64 / 1000.0).ceil().max(1.0) as u64;
        Self {
            jobs_per_tick,
            current_tick: 0,
            current_calls: 0,
        }
    }

    fn admit(&mut self) -> bool {
        let tick = wall_clock_tick();
        if tick != self.current_tick {
            self.current_tick = tick;
            self.current_calls = 0;
        }
        if self.current_calls < self.jobs_per_tick {
            self.current_calls += 1;
            true
        } else {
            false
        }
    }
}

fn wall_clock_tick() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64 / TICK_MS)
        .unwrap_or(0)
}
