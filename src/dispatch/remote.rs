//! Distributed dispatch: master listener and connect-back slave mode.
//!
//! The master binds an ephemeral TCP port, starts the same program on each
//! remote host through a shell transport (ssh by default) with `MASTER` set
//! to `<ip>|<port>`, and waits for the remote workers to connect back. The
//! accepted sockets feed the same drive loop as the local process pool.
//!
//! A process that finds `MASTER` in its environment never becomes a master:
//! its `map` call turns into a farm of connect-back workers instead. Since
//! the slave ran the same program up to the same `map` call, it has
//! materialized the same source, which is why array-mode frames can keep
//! carrying nothing but the index even across hosts.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::endpoint::Worker;
use super::ipc::{LineReader, LineWriter};
use super::procs::drive;
use super::serve::serve;
use super::Shared;
use crate::error::{DispatchError, Result, TaskResult};
use crate::factory::JobFactory;
use crate::interrupt;
use crate::options::DistributeConfig;

/// Environment variable carrying the master address as `<ip>|<port>`.
/// Its presence switches a process into slave mode.
pub const MASTER_ENV: &str = "MASTER";

/// Environment variable naming a slave host as the master sees it.
pub const NODE_ENV: &str = "MY_NODE";

/// Pause between shell spawns so a burst of hosts does not overwhelm the
/// shell service.
const SPAWN_STAGGER: Duration = Duration::from_millis(100);

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// True when this process was launched as a distributed slave.
pub(crate) fn is_slave() -> bool {
    std::env::var_os(MASTER_ENV).is_some()
}

/// Run the master side: spawn shells, collect connect-backs, dispatch, and
/// reap the shell children.
pub(crate) fn run_master<I, O>(
    dist: &DistributeConfig,
    per_host: usize,
    factory: &JobFactory<I>,
    shared: &Shared<I, O>,
    sleep_after: bool,
    interrupt_signal: Signal,
) -> Result<()>
where
    I: Serialize + Send + Sync,
    O: DeserializeOwned + Send,
{
    let (pool, mut shells) = accept_remote_workers(dist, per_host)?;
    let shell_pids: Vec<Pid> = shells
        .iter()
        .map(|shell| Pid::from_raw(shell.id() as i32))
        .collect();

    let outcome = interrupt::scoped_kill_on_interrupt(&shell_pids, interrupt_signal, || {
        drive(pool, &shell_pids, factory, shared, sleep_after);
    });

    // The remote sides exit once their sockets close, so the shells drain
    // on their own; reap them on the success path too.
    for shell in &mut shells {
        let _ = shell.wait();
    }
    outcome
}

/// Spawn the shell transports and accept `per_host × hosts` connect-backs,
/// or give up after the configured timeout.
fn accept_remote_workers(
    dist: &DistributeConfig,
    per_host: usize,
) -> Result<(Vec<Worker>, Vec<Child>)> {
    let ip = match dist.local_address {
        Some(ip) => ip,
        None => local_ipv4()?,
    };
    let listener = TcpListener::bind((ip, 0))?;
    let port = listener.local_addr()?.port();
    let command = match &dist.command {
        Some(command) => command.clone(),
        None => current_invocation(),
    };
    tracing::info!(
        %ip,
        port,
        hosts = dist.hosts.len(),
        per_host,
        "starting distributed master"
    );

    let mut shells = Vec::with_capacity(dist.hosts.len());
    for host in &dist.hosts {
        let shell = Command::new(&dist.via)
            .arg(host)
            .arg(remote_command(ip, port, host, &command))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| {
                DispatchError::RemoteSpawn(format!("{} {}: {}", dist.via, host, err))
            })?;
        tracing::debug!(host = %host, pid = shell.id(), "spawned shell transport");
        shells.push(shell);
        thread::sleep(SPAWN_STAGGER);
    }

    let expected = per_host * dist.hosts.len();
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + dist.timeout;
    let mut pool = Vec::with_capacity(expected);
    while pool.len() < expected {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "remote worker connected");
                stream.set_nonblocking(false)?;
                pool.push(Worker::from_stream(stream)?);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    quit_shells(&mut shells);
                    return Err(DispatchError::RemoteWorkerTimeout(dist.timeout));
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                quit_shells(&mut shells);
                return Err(err.into());
            }
        }
    }
    Ok((pool, shells))
}

/// Tell every shell child to quit, then reap it.
fn quit_shells(shells: &mut [Child]) {
    for shell in shells.iter() {
        let _ = signal::kill(Pid::from_raw(shell.id() as i32), Signal::SIGTERM);
    }
    for shell in shells.iter_mut() {
        let _ = shell.wait();
    }
}

/// The command a remote host runs by default: this very invocation.
fn current_invocation() -> String {
    std::env::args().collect::<Vec<_>>().join(" ")
}

/// The full command handed to the shell transport. Single quotes keep the
/// `|` in the address from reading as a shell pipeline on the remote side.
fn remote_command(ip: Ipv4Addr, port: u16, host: &str, command: &str) -> String {
    format!("{MASTER_ENV}='{ip}|{port}' {NODE_ENV}='{host}' {command}")
}

/// First non-loopback IPv4 address on this host.
fn local_ipv4() -> Result<Ipv4Addr> {
    for ifaddr in nix::ifaddrs::getifaddrs()? {
        if let Some(address) = ifaddr.address {
            if let Some(sin) = address.as_sockaddr_in() {
                let ip = sin.ip();
                if !ip.is_loopback() {
                    return Ok(ip);
                }
            }
        }
    }
    Err(DispatchError::InvalidOptions(
        "no non-loopback IPv4 interface found; set local_address explicitly".to_string(),
    ))
}

/// Run the slave side and exit the process.
///
/// Forks `workers` children, each connecting back to the master and serving
/// jobs until the socket closes. Children exit 1 on socket failure and 0 on
/// clean shutdown; the parent reaps them and exits accordingly.
pub(crate) fn run_slave<I, O, F>(
    factory: &JobFactory<I>,
    task: &F,
    workers: usize,
    preserve_results: bool,
) -> !
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(&I, usize) -> TaskResult<O>,
{
    let code = match slave_children(factory, task, workers, preserve_results) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(err) => {
            eprintln!("fanout slave: {err}");
            1
        }
    };
    std::process::exit(code);
}

fn slave_children<I, O, F>(
    factory: &JobFactory<I>,
    task: &F,
    workers: usize,
    preserve_results: bool,
) -> Result<bool>
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(&I, usize) -> TaskResult<O>,
{
    let master = parse_master()?;
    let node = std::env::var(NODE_ENV).unwrap_or_default();
    tracing::info!(%master, node = %node, workers, "entering slave mode");

    let mut pids = Vec::with_capacity(workers);
    for _ in 0..workers.max(1) {
        match unsafe { fork() }? {
            ForkResult::Child => {
                let code = match connect_and_serve(factory, task, master, preserve_results) {
                    Ok(()) => 0,
                    Err(err) => {
                        eprintln!("fanout worker: {err}");
                        1
                    }
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => pids.push(child),
        }
    }

    let mut all_clean = true;
    for pid in pids {
        loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                Ok(WaitStatus::Exited(_, 0)) => break,
                Ok(_) => {
                    all_clean = false;
                    break;
                }
                Err(_) => {
                    all_clean = false;
                    break;
                }
            }
        }
    }
    Ok(all_clean)
}

fn connect_and_serve<I, O, F>(
    factory: &JobFactory<I>,
    task: &F,
    master: SocketAddr,
    preserve_results: bool,
) -> Result<()>
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(&I, usize) -> TaskResult<O>,
{
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
    let stream = TcpStream::connect(master)?;
    let mut reader = LineReader::new(stream.try_clone()?);
    let mut writer = LineWriter::new(stream);
    serve(factory, task, &mut reader, &mut writer, preserve_results)?;
    Ok(())
}

/// Parse `MASTER` as `<host>|<port>`.
fn parse_master() -> Result<SocketAddr> {
    let raw = std::env::var(MASTER_ENV)
        .map_err(|_| DispatchError::InvalidOptions(format!("{MASTER_ENV} is not set")))?;
    let (host, port) = raw.split_once('|').ok_or_else(|| {
        DispatchError::InvalidOptions(format!("malformed {MASTER_ENV} value: {raw}"))
    })?;
    let port: u16 = port.trim().parse().map_err(|_| {
        DispatchError::InvalidOptions(format!("malformed {MASTER_ENV} port: {raw}"))
    })?;
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| DispatchError::InvalidOptions(format!("{MASTER_ENV} does not resolve: {raw}")))
}
