//! Scoped "kill workers on interrupt" trap.
//!
//! Process pools register their children here for the duration of a run.
//! The first registration installs a handler for the trapped signal; when
//! it fires, every tracked worker is hard-killed — most recently registered
//! group first, so nested runs tear down inner pools before outer ones —
//! and the signal is re-raised under its default disposition, preserving
//! normal termination for the caller.
//!
//! The group stack lives behind a mutex. The handler itself must stay
//! async-signal-safe, so it never locks: pushes and pops rebuild a
//! lock-free mirror (a fixed array of atomics) that the handler reads.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Mutex;

use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::error::Result;

/// Upper bound on pids visible to the signal handler.
const MAX_TRACKED: usize = 512;

static TRACKED: [AtomicI32; MAX_TRACKED] = [const { AtomicI32::new(0) }; MAX_TRACKED];
static TRACKED_LEN: AtomicUsize = AtomicUsize::new(0);

static TRAP: Mutex<TrapState> = Mutex::new(TrapState {
    stack: Vec::new(),
    next_id: 0,
    previous: None,
    signal: None,
});

struct TrapState {
    /// Registered groups, oldest first, each tagged with the id its guard
    /// pops it by. Concurrent runs may finish out of push order.
    stack: Vec<(u64, Vec<Pid>)>,
    next_id: u64,
    previous: Option<SigAction>,
    signal: Option<Signal>,
}

extern "C" fn kill_workers_and_reraise(signo: libc::c_int) {
    // Only async-signal-safe calls from here on: write, kill, signal, raise.
    const MSG: &[u8] = b"fanout: interrupt received, terminating workers\n";
    unsafe {
        let _ = libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
    }

    let len = TRACKED_LEN.load(Ordering::SeqCst).min(MAX_TRACKED);
    for slot in TRACKED.iter().take(len) {
        let pid = slot.load(Ordering::SeqCst);
        if pid > 0 {
            // ESRCH just means the worker already exited.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }

    unsafe {
        libc::signal(signo, libc::SIG_DFL);
        libc::raise(signo);
    }
}

/// Rebuild the handler's mirror: most recent group first.
fn rebuild_mirror(stack: &[(u64, Vec<Pid>)]) {
    TRACKED_LEN.store(0, Ordering::SeqCst);
    let mut n = 0;
    for (_, group) in stack.iter().rev() {
        for pid in group {
            if n >= MAX_TRACKED {
                tracing::warn!(
                    limit = MAX_TRACKED,
                    "too many tracked workers; excess pids will survive an interrupt"
                );
                TRACKED_LEN.store(n, Ordering::SeqCst);
                return;
            }
            TRACKED[n].store(pid.as_raw(), Ordering::SeqCst);
            n += 1;
        }
    }
    TRACKED_LEN.store(n, Ordering::SeqCst);
}

fn push_group(pids: &[Pid], signal: Signal) -> Result<u64> {
    let mut trap = TRAP.lock().expect("interrupt stack poisoned");
    if trap.stack.is_empty() {
        let action = SigAction::new(
            SigHandler::Handler(kill_workers_and_reraise),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let previous = unsafe { sigaction(signal, &action) }?;
        trap.previous = Some(previous);
        trap.signal = Some(signal);
        tracing::debug!(signal = %signal, "installed interrupt trap");
    }
    let id = trap.next_id;
    trap.next_id += 1;
    trap.stack.push((id, pids.to_vec()));
    rebuild_mirror(&trap.stack);
    Ok(id)
}

fn pop_group(id: u64) {
    let mut trap = TRAP.lock().expect("interrupt stack poisoned");
    trap.stack.retain(|(group_id, _)| *group_id != id);
    rebuild_mirror(&trap.stack);
    if trap.stack.is_empty() {
        if let (Some(signal), Some(previous)) = (trap.signal.take(), trap.previous.take()) {
            let _ = unsafe { sigaction(signal, &previous) };
            tracing::debug!(signal = %signal, "restored previous signal disposition");
        }
    }
}

struct PopOnDrop(u64);

impl Drop for PopOnDrop {
    fn drop(&mut self) {
        pop_group(self.0);
    }
}

/// Run `body` with `pids` registered for kill-on-interrupt.
///
/// The group is popped again when `body` returns or panics. The trap is
/// installed lazily on the first (outermost) registration and the previous
/// disposition restored when the stack empties.
pub(crate) fn scoped_kill_on_interrupt<R>(
    pids: &[Pid],
    signal: Signal,
    body: impl FnOnce() -> R,
) -> Result<R> {
    let id = push_group(pids, signal)?;
    let _guard = PopOnDrop(id);
    Ok(body())
}

#[cfg(test)]
fn tracked_snapshot() -> Vec<i32> {
    let len = TRACKED_LEN.load(Ordering::SeqCst).min(MAX_TRACKED);
    TRACKED
        .iter()
        .take(len)
        .map(|slot| slot.load(Ordering::SeqCst))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test exercises the whole stack lifecycle: the trap state is
    // process-wide, so splitting this up would race between test threads.
    #[test]
    fn test_nested_groups_mirror_most_recent_first() {
        let outer = [Pid::from_raw(100), Pid::from_raw(101)];
        let inner = [Pid::from_raw(200)];

        // SIGUSR1 keeps the test harness unbothered if it ever fired.
        let observed = scoped_kill_on_interrupt(&outer, Signal::SIGUSR1, || {
            let nested =
                scoped_kill_on_interrupt(&inner, Signal::SIGUSR1, tracked_snapshot).unwrap();
            (nested, tracked_snapshot())
        })
        .unwrap();

        // Inner group first while nested, outer group alone afterwards.
        assert_eq!(observed.0, vec![200, 100, 101]);
        assert_eq!(observed.1, vec![100, 101]);

        // Fully unwound: nothing tracked, trap uninstalled.
        assert!(tracked_snapshot().is_empty());
        let trap = TRAP.lock().unwrap();
        assert!(trap.stack.is_empty());
        assert!(trap.previous.is_none());
    }
}
