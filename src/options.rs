//! Run configuration for the dispatcher.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;

/// Hook run on the driver before a job is dispatched.
pub type StartHook<I> = Arc<dyn Fn(&I, usize) + Send + Sync>;

/// Hook run on the driver after a job completes. The result reference is
/// `None` on the failure path and when results are not preserved.
pub type FinishHook<I, O> = Arc<dyn Fn(&I, usize, Option<&O>) + Send + Sync>;

/// Which worker substrate to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Substrate {
    /// Process workers where available, serial execution otherwise.
    #[default]
    Auto,
    /// In-process worker threads.
    Threads,
    /// Forked worker processes.
    Processes,
}

/// Configuration for distributed dispatch over remote hosts.
#[derive(Debug, Clone)]
pub struct DistributeConfig {
    pub hosts: Vec<String>,
    /// How long the master waits for remote connect-backs.
    pub timeout: Duration,
    /// Remote-side command; defaults to re-running the current invocation.
    pub command: Option<String>,
    /// Shell transport program used to reach each host.
    pub via: String,
    /// Address the master binds; defaults to the first non-loopback IPv4.
    pub local_address: Option<Ipv4Addr>,
}

impl DistributeConfig {
    pub fn new(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            timeout: Duration::from_secs(60),
            command: None,
            via: "ssh".to_string(),
            local_address: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn via(mut self, via: impl Into<String>) -> Self {
        self.via = via.into();
        self
    }

    pub fn local_address(mut self, address: Ipv4Addr) -> Self {
        self.local_address = Some(address);
        self
    }
}

/// Options for a single `map`/`each` run.
///
/// Built fluently and passed by value:
///
/// ```
/// use fanout::Options;
///
/// let options: Options<u32, u32> = Options::new().in_threads().workers(4).max_rate(100.0);
/// ```
pub struct Options<I, O> {
    pub(crate) workers: Option<usize>,
    pub(crate) substrate: Substrate,
    pub(crate) max_rate: Option<f64>,
    pub(crate) preserve_results: bool,
    pub(crate) sleep_after: bool,
    pub(crate) interrupt_signal: Option<Signal>,
    pub(crate) start: Option<StartHook<I>>,
    pub(crate) finish: Option<FinishHook<I, O>>,
    pub(crate) progress: Option<String>,
    pub(crate) distribute: Option<DistributeConfig>,
}

impl<I, O> Default for Options<I, O> {
    fn default() -> Self {
        Self {
            workers: None,
            substrate: Substrate::Auto,
            max_rate: None,
            preserve_results: true,
            sleep_after: false,
            interrupt_signal: None,
            start: None,
            finish: None,
            progress: None,
            distribute: None,
        }
    }
}

impl<I, O> Options<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool size. Defaults to the CPU count; 0 runs serially in the caller.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Run on in-process worker threads.
    pub fn in_threads(mut self) -> Self {
        self.substrate = Substrate::Threads;
        self
    }

    /// Run on forked worker processes.
    pub fn in_processes(mut self) -> Self {
        self.substrate = Substrate::Processes;
        self
    }

    /// Throttle dispatch to this many jobs per second, pool-wide.
    pub fn max_rate(mut self, jobs_per_second: f64) -> Self {
        self.max_rate = Some(jobs_per_second);
        self
    }

    /// When `false`, workers discard return values instead of shipping them
    /// back, and the result vector comes back empty.
    pub fn preserve_results(mut self, preserve: bool) -> Self {
        self.preserve_results = preserve;
        self
    }

    /// Skip closing and reaping each worker when its driver exits.
    pub fn sleep_after(mut self, sleep_after: bool) -> Self {
        self.sleep_after = sleep_after;
        self
    }

    /// Signal trapped for kill-on-interrupt. Process pools only.
    pub fn interrupt_signal(mut self, signal: Signal) -> Self {
        self.interrupt_signal = Some(signal);
        self
    }

    /// Hook run before each dispatch.
    pub fn start(mut self, hook: impl Fn(&I, usize) + Send + Sync + 'static) -> Self {
        self.start = Some(Arc::new(hook));
        self
    }

    /// Hook run after each dispatch; the result is `None` on failure.
    pub fn finish(mut self, hook: impl Fn(&I, usize, Option<&O>) + Send + Sync + 'static) -> Self {
        self.finish = Some(Arc::new(hook));
        self
    }

    /// Draw a progress bar with this title. Requires a finite source.
    pub fn progress(mut self, title: impl Into<String>) -> Self {
        self.progress = Some(title.into());
        self
    }

    /// Spread the work over remote hosts.
    pub fn distribute(mut self, config: DistributeConfig) -> Self {
        self.distribute = Some(config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options: Options<u32, u32> = Options::new();
        assert_eq!(options.substrate, Substrate::Auto);
        assert!(options.workers.is_none());
        assert!(options.preserve_results);
        assert!(!options.sleep_after);
    }

    #[test]
    fn test_builder_chains() {
        let options: Options<u32, u32> = Options::new()
            .in_threads()
            .workers(3)
            .max_rate(50.0)
            .preserve_results(false);
        assert_eq!(options.substrate, Substrate::Threads);
        assert_eq!(options.workers, Some(3));
        assert_eq!(options.max_rate, Some(50.0));
        assert!(!options.preserve_results);
    }

    #[test]
    fn test_distribute_defaults() {
        let config = DistributeConfig::new(["h1", "h2"]);
        assert_eq!(config.hosts, vec!["h1", "h2"]);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.via, "ssh");
        assert!(config.command.is_none());
        assert!(config.local_address.is_none());
    }
}
