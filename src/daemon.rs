//! The booster pool supervisor.
//!
//! The daemon binds one listening socket per family, forks one waiting
//! booster per family, and then loops on the notify pipe. A booster writes
//! its family tag to the pipe the moment it has consumed a request; the
//! supervisor sleeps the respawn debounce and forks the replacement. Boosters
//! that die without ever notifying (protocol errors, crashes) are caught by
//! the reaper and replaced too, so every family always has exactly one
//! accepting booster.

use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, dup2, fork, pipe, setsid, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::booster::{self, Booster, Family};
use crate::config::LauncherConfig;
use crate::connection::SocketRegistry;
use crate::process_title;
use crate::signal::SignalFlags;

/// How long the supervisor waits on the notify pipe before taking a reaping
/// pass. Keeps shutdown and crash recovery responsive without a SIGCHLD race.
const POLL_INTERVAL_MS: u16 = 1000;

/// Grace period between SIGTERM and SIGKILL at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Pipe the boosters use to request their own replacement. The read end
/// belongs to the supervisor; every booster inherits the write end and sends
/// exactly one tag byte.
struct NotifyPipe {
    rx: Option<File>,
    tx: Option<OwnedFd>,
}

impl NotifyPipe {
    fn new() -> Result<Self> {
        let (rx, tx) = pipe().context("creating notify pipe")?;
        Ok(Self {
            rx: Some(File::from(rx)),
            tx: Some(tx),
        })
    }
}

pub struct Supervisor {
    config: LauncherConfig,
    registry: SocketRegistry,
    notify: NotifyPipe,
    children: Vec<Pid>,
    /// The booster currently blocked in accept, per family. Updated on every
    /// fork; consulted by the reaper to spot boosters that died without
    /// notifying.
    accepting: HashMap<Family, Pid>,
    signals: SignalFlags,
}

impl Supervisor {
    pub fn new(config: LauncherConfig) -> Result<Self> {
        let signals = SignalFlags::install()?;

        // Keep the dynamic linker's lazy binding available to the boosters'
        // later dlopen calls.
        env::remove_var("LD_BIND_NOW");

        let mut registry = SocketRegistry::new(config.socket_dir.clone());
        for family in Family::ALL {
            registry.init(family)?;
        }

        Ok(Self {
            config,
            registry,
            notify: NotifyPipe::new()?,
            children: Vec::new(),
            accepting: HashMap::new(),
            signals,
        })
    }

    /// Fork the initial boosters and supervise until a shutdown signal.
    pub fn run(&mut self) -> Result<()> {
        for family in Family::ALL {
            self.fork_booster(family)?;
        }

        info!("supervising {} families", Family::ALL.len());

        loop {
            if self.signals.shutdown_requested() {
                break;
            }
            if self.signals.take_child_exited() {
                self.reap_zombies()?;
            }

            match self.poll_notification(POLL_INTERVAL_MS)? {
                Some(tag) => self.replace_consumed(tag)?,
                None => {
                    // Poll timeout; take an opportunistic reaping pass.
                    self.reap_zombies()?;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Wait up to `timeout_ms` for a tag byte on the notify pipe.
    fn poll_notification(&mut self, timeout_ms: u16) -> Result<Option<u8>> {
        let rx = self
            .notify
            .rx
            .as_mut()
            .ok_or_else(|| anyhow!("notify pipe closed in supervisor"))?;

        let readable = {
            let mut fds = [PollFd::new(rx.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(timeout_ms)) {
                Ok(0) => false,
                Ok(_) => true,
                Err(nix::errno::Errno::EINTR) => false,
                Err(e) => return Err(e).context("polling notify pipe"),
            }
        };
        if !readable {
            return Ok(None);
        }

        let mut tag = [0u8; 1];
        match rx.read(&mut tag) {
            Ok(1) => Ok(Some(tag[0])),
            Ok(_) => {
                warn!("nothing read from the notify pipe");
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e).context("reading notify pipe"),
        }
    }

    /// A booster consumed a request: debounce, then fork its replacement.
    fn replace_consumed(&mut self, tag: u8) -> Result<()> {
        let Some(family) = Family::from_tag(tag) else {
            warn!("unknown family tag {tag:#04x} on notify pipe");
            return Ok(());
        };

        debug!("booster '{family}' consumed a request");
        if !self.config.respawn_debounce.is_zero() {
            thread::sleep(self.config.respawn_debounce);
        }
        self.fork_booster(family)
    }

    /// Fork one booster. The parent records the pid; the child never returns.
    fn fork_booster(&mut self, family: Family) -> Result<()> {
        match unsafe { fork() }.context("forking booster")? {
            ForkResult::Parent { child } => {
                debug!("forked booster '{family}' as pid {child}");
                self.children.push(child);
                self.accepting.insert(family, child);
                Ok(())
            }
            ForkResult::Child => self.booster_main(family),
        }
    }

    /// The booster child's whole life, from fork to hand-off.
    fn booster_main(&mut self, family: Family) -> ! {
        unsafe {
            let _ = signal(Signal::SIGCHLD, SigHandler::SigDfl);
        }

        // Die with the daemon: no orphaned boosters holding the sockets.
        let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGHUP);

        // The read end belongs to the supervisor alone.
        drop(self.notify.rx.take());

        if let Err(e) = setsid() {
            error!("setting session id: {e}");
        }

        info!("running a new booster of '{family}' type");
        family.preload(&self.config);

        // The target must see exactly the invoker's environment.
        booster::clear_environment();

        process_title::set(&format!("booster-{}", family.tag() as char));

        let mut booster = match Booster::new(&self.registry, family) {
            Ok(b) => b,
            Err(e) => {
                error!("booster setup failed: {e}");
                process::exit(1);
            }
        };

        info!("waiting for message from invoker");
        let request = match booster.read_command() {
            Ok(request) => request,
            Err(e) => {
                error!("receiving launch request: {e}");
                process::exit(1);
            }
        };

        process_title::set(&request.display_name.to_string_lossy());

        // Tell the supervisor a replacement is due; this is the only moment
        // it learns the request was consumed.
        if let Some(tx) = self.notify.tx.take() {
            if let Err(e) = nix::unistd::write(&tx, &[family.tag()]) {
                error!("can't signal the launcher process: {e}");
            }
            drop(tx);
        }

        // The daemon's fate no longer matters to the launched application.
        let _ = nix::sys::prctl::set_pdeathsig(None::<Signal>);

        booster.run(request)
    }

    /// Non-blocking wait over the child list. A booster that exited while
    /// still registered as its family's accepting process died without
    /// notifying, so a replacement is forked here.
    pub fn reap_zombies(&mut self) -> Result<()> {
        // A consumed booster's tag byte is written before it can exit, so
        // draining the pipe first keeps a fast-exiting launch from being
        // mistaken for a crashed booster (and getting a second replacement).
        while let Some(tag) = self.poll_notification(0)? {
            self.replace_consumed(tag)?;
        }

        let exited = reap_exited(&mut self.children);

        let mut respawn = Vec::new();
        for pid in exited {
            if let Some((&family, _)) = self.accepting.iter().find(|&(_, &p)| p == pid) {
                warn!("booster '{family}' (pid {pid}) exited before consuming a request");
                respawn.push(family);
            }
        }
        for family in respawn {
            self.accepting.remove(&family);
            self.fork_booster(family)?;
        }
        Ok(())
    }

    /// Propagate the shutdown to all children, then remove the socket files.
    fn shutdown(&mut self) {
        info!("shutting down");

        for &pid in &self.children {
            let _ = kill(pid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.children.is_empty() && Instant::now() < deadline {
            reap_exited(&mut self.children);
            thread::sleep(Duration::from_millis(100));
        }

        for &pid in &self.children {
            let _ = kill(pid, Signal::SIGKILL);
        }
        reap_exited(&mut self.children);

        self.registry.unlink_all();
    }
}

/// Reap every exited pid out of `children`, returning the reaped ones.
/// Running children stay listed; the call never blocks.
fn reap_exited(children: &mut Vec<Pid>) -> Vec<Pid> {
    let mut alive = Vec::with_capacity(children.len());
    let mut exited = Vec::new();

    for pid in children.drain(..) {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => alive.push(pid),
            Ok(status) => {
                debug!("reaped child {pid}: {status:?}");
                exited.push(pid);
            }
            Err(nix::errno::Errno::ECHILD) => exited.push(pid),
            Err(e) => {
                warn!("waiting for child {pid}: {e}");
                exited.push(pid);
            }
        }
    }

    *children = alive;
    exited
}

/// Classical double-fork daemonization: detach from the controlling terminal,
/// reset the file mode mask, move to `/`, and point stdio at `/dev/null`.
pub fn daemonize() -> Result<()> {
    for _ in 0..2 {
        match unsafe { fork() }.context("forking daemon")? {
            ForkResult::Parent { .. } => process::exit(0),
            ForkResult::Child => {}
        }
    }

    umask(Mode::empty());
    setsid().context("creating daemon session")?;
    chdir("/").context("changing directory to /")?;

    redirect_stdio_to_null()
}

/// Point fds 0-2 at `/dev/null`. Also used for `--quiet`.
pub fn console_quiet() -> Result<()> {
    redirect_stdio_to_null()
}

fn redirect_stdio_to_null() -> Result<()> {
    let stdin = File::open("/dev/null").context("opening /dev/null readonly")?;
    dup2(stdin.as_raw_fd(), 0).context("redirecting stdin")?;

    let stdout = File::options()
        .write(true)
        .open("/dev/null")
        .context("opening /dev/null writeonly")?;
    dup2(stdout.as_raw_fd(), 1).context("redirecting stdout")?;
    dup2(stdout.as_raw_fd(), 2).context("redirecting stderr")?;

    Ok(())
}
