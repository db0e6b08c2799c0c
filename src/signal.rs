//! Signal plumbing for the supervisor.
//!
//! The supervisor is a single blocking loop, so signal handlers only set
//! flags: SIGTERM/SIGINT request shutdown, SIGCHLD wakes the reaper. SIGPIPE
//! is ignored outright; write failures surface as return values.

use anyhow::Result;
use nix::sys::signal::{signal, SigHandler, Signal};
use signal_hook::consts::{SIGCHLD, SIGINT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct SignalFlags {
    shutdown: Arc<AtomicBool>,
    child_exited: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Register the handlers. Call once, before any booster is forked.
    pub fn install() -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let child_exited = Arc::new(AtomicBool::new(false));

        signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;
        signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
        signal_hook::flag::register(SIGCHLD, Arc::clone(&child_exited))?;

        unsafe {
            signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
        }

        Ok(Self {
            shutdown,
            child_exited,
        })
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Read and clear the child-exit flag.
    pub fn take_child_exited(&self) -> bool {
        self.child_exited.swap(false, Ordering::SeqCst)
    }

    #[cfg(test)]
    fn mark_child_exited(&self) {
        self.child_exited.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear() {
        let flags = SignalFlags::install().unwrap();
        assert!(!flags.shutdown_requested());
        assert!(!flags.take_child_exited());
    }

    #[test]
    fn child_flag_is_taken_once() {
        let flags = SignalFlags::install().unwrap();
        flags.mark_child_exited();
        assert!(flags.take_child_exited());
        assert!(!flags.take_child_exited());
    }
}
