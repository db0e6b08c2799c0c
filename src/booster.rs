//! Booster processes: pre-initialized children that assume a target
//! program's identity.
//!
//! A booster pays the expensive initialization of its family up front
//! (shared-object preloading), then blocks on the family socket. Once an
//! invoker has driven the protocol to completion the booster adopts the
//! request: stdio, priority, environment, process name, and finally the jump
//! into the target. The booster process exits with the target's status.

use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Result;
use nix::unistd::dup2;
use tracing::{debug, error, warn};

use crate::config::LauncherConfig;
use crate::connection::{Connection, SocketRegistry};
use crate::error::ProtocolError;
use crate::loader;
use crate::process_title;
use crate::protocol::AppRequest;

/// A booster kind. Each family shares one preload set and one well-known
/// socket; the single-byte tag doubles as the NotifyPipe message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Heavyweight applications; preloads the configured toolkit stack.
    Main,
    /// General-purpose boosters with a light preload set.
    Quick,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::Main, Family::Quick];

    pub fn tag(self) -> u8 {
        match self {
            Family::Main => b'm',
            Family::Quick => b'q',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Family> {
        match tag {
            b'm' => Some(Family::Main),
            b'q' => Some(Family::Quick),
            _ => None,
        }
    }

    pub fn socket_path(self, dir: &Path) -> PathBuf {
        dir.join(format!("booster-{}.socket", self.tag() as char))
    }

    /// Pay the family's startup costs ahead of the request. The hook touches
    /// only the process's own address space: no filesystem writes, no
    /// network.
    pub fn preload(self, config: &LauncherConfig) {
        preload_libraries(config.preload_libs(self));
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag() as char)
    }
}

/// `dlopen` each configured shared object so the target finds them resident.
/// RTLD_GLOBAL so subsequently loaded code can resolve against them.
fn preload_libraries(libs: &[String]) {
    for lib in libs {
        let Ok(name) = CString::new(lib.as_str()) else {
            warn!("skipping preload entry with NUL: {lib:?}");
            continue;
        };
        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            warn!("preload dlopen failed for {lib}");
        } else {
            debug!("preloaded {lib}");
        }
    }
}

pub struct Booster {
    family: Family,
    connection: Connection,
}

impl Booster {
    pub fn new(registry: &SocketRegistry, family: Family) -> Result<Self> {
        Ok(Self {
            family,
            connection: Connection::new(registry, family)?,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Block until an invoker connects and drives the protocol to completion.
    pub fn read_command(&mut self) -> Result<AppRequest, ProtocolError> {
        if !self.connection.accept() {
            return Err(ProtocolError::AcceptFailed);
        }
        self.connection.recv_request()
    }

    /// Adopt the request and transfer control to the target. Only returns by
    /// exiting the process.
    pub fn run(self, request: AppRequest) -> ! {
        if let Some(stdio) = request.stdio {
            transfer_stdio(&stdio);
        }

        // Nice-value failures are ignored.
        unsafe {
            libc::setpriority(libc::PRIO_PROCESS, 0, request.priority);
        }

        install_env(&request.envp);

        process_title::set(&request.argv[0].to_string_lossy());

        // Keep the accepted socket open across the hand-off: its close is how
        // a waiting invoker learns the target has exited.
        let stream = self.connection.into_stream();
        if let Some(stream) = &stream {
            loader::retain_across_exec(stream);
        }

        let err = loader::load_and_enter(&request.exec_path, &request.argv, &request.envp);
        error!(
            "loading executable {} failed: {err}",
            request.exec_path.display()
        );
        drop(stream);
        process::exit(loader::EXIT_LOAD_FAILED);
    }
}

/// Dup the received descriptors onto stdio and close the originals.
fn transfer_stdio(stdio: &[i32; 3]) {
    for (target, &fd) in stdio.iter().enumerate() {
        let target = target as i32;
        if fd < 0 || fd == target {
            continue;
        }
        if let Err(e) = dup2(fd, target) {
            error!("transferring stdio descriptor {fd}: {e}");
            process::exit(1);
        }
        let _ = nix::unistd::close(fd);
    }
}

/// Install the invoker-supplied environment. The daemon cleared the child's
/// environment before `read_command`, so installing each entry amounts to the
/// wholesale replacement the target must observe.
pub fn install_env(envp: &[OsString]) {
    for var in envp {
        let bytes = var.as_bytes();
        match bytes.iter().position(|&b| b == b'=') {
            Some(pos) if pos > 0 => {
                let key = OsStr::from_bytes(&bytes[..pos]);
                let value = OsStr::from_bytes(&bytes[pos + 1..]);
                env::set_var(key, value);
            }
            _ => warn!("skipping malformed environment entry"),
        }
    }
}

/// Drop every variable from the process environment. Runs in the freshly
/// forked booster, before any request handling, so single-threaded access is
/// guaranteed.
pub fn clear_environment() {
    for (key, _) in env::vars_os() {
        env::remove_var(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_tags_round_trip() {
        for family in Family::ALL {
            assert_eq!(Family::from_tag(family.tag()), Some(family));
        }
        assert_eq!(Family::from_tag(b'z'), None);
    }

    #[test]
    fn family_socket_paths_are_distinct() {
        let dir = Path::new("/tmp");
        assert_eq!(
            Family::Main.socket_path(dir),
            PathBuf::from("/tmp/booster-m.socket")
        );
        assert_eq!(
            Family::Quick.socket_path(dir),
            PathBuf::from("/tmp/booster-q.socket")
        );
    }

    #[test]
    fn install_env_sets_received_entries() {
        install_env(&[
            OsString::from("PREWARM_TEST_K1=v1"),
            OsString::from("PREWARM_TEST_K2=v2"),
            OsString::from("no_equals_entry"),
            OsString::from("=empty_key"),
        ]);

        assert_eq!(env::var("PREWARM_TEST_K1").unwrap(), "v1");
        assert_eq!(env::var("PREWARM_TEST_K2").unwrap(), "v2");

        env::remove_var("PREWARM_TEST_K1");
        env::remove_var("PREWARM_TEST_K2");
    }

    #[test]
    fn install_env_keeps_value_equals_signs() {
        install_env(&[OsString::from("PREWARM_TEST_EQ=a=b=c")]);
        assert_eq!(env::var("PREWARM_TEST_EQ").unwrap(), "a=b=c");
        env::remove_var("PREWARM_TEST_EQ");
    }

    #[test]
    fn preload_failure_is_non_fatal() {
        preload_libraries(&["libdoes-not-exist-anywhere.so.999".to_string()]);
    }
}
