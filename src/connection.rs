//! Per-family listening sockets and the request receive state machine.
//!
//! The daemon binds one stream socket per family at startup; boosters inherit
//! the listening descriptors across `fork` and each accepts exactly one
//! client. The receive side acknowledges every message with `MSG_ACK` except
//! the ENV action, which the wire protocol leaves unacknowledged.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::sys::socket::{bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tracing::{error, info, warn};

use crate::booster::Family;
use crate::error::ProtocolError;
use crate::protocol::{self, AppRequest};

/// Kernel accept backlog per family socket. Clients beyond this queue get
/// connection refused while the previous launch's replacement is pending.
const LISTEN_BACKLOG: i32 = 10;

/// The bound listening sockets, one per family. Populated once at daemon
/// startup, read-only afterwards; inherited by every booster.
pub struct SocketRegistry {
    socket_dir: PathBuf,
    sockets: HashMap<Family, UnixListener>,
}

impl SocketRegistry {
    pub fn new(socket_dir: PathBuf) -> Self {
        Self {
            socket_dir,
            sockets: HashMap::new(),
        }
    }

    /// Bind and listen on the family's well-known path. Idempotent: a second
    /// call for the same family keeps the existing socket.
    pub fn init(&mut self, family: Family) -> Result<()> {
        if self.sockets.contains_key(&family) {
            return Ok(());
        }

        let path = self.socket_path(family);
        info!("init socket '{}'", path.display());

        // Unlink a stale path from a previous run.
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("unlinking stale socket {}", path.display()))
            }
        }

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("opening invoker socket")?;
        let addr = UnixAddr::new(&path)?;
        bind(fd.as_raw_fd(), &addr)
            .with_context(|| format!("binding invoker socket {}", path.display()))?;
        listen(&fd, Backlog::new(LISTEN_BACKLOG)?)
            .with_context(|| format!("listening on invoker socket {}", path.display()))?;

        let listener = unsafe { UnixListener::from_raw_fd(fd.into_raw_fd()) };
        self.sockets.insert(family, listener);
        Ok(())
    }

    pub fn get(&self, family: Family) -> Option<&UnixListener> {
        self.sockets.get(&family)
    }

    pub fn socket_path(&self, family: Family) -> PathBuf {
        family.socket_path(&self.socket_dir)
    }

    /// Remove the socket files of every bound family.
    pub fn unlink_all(&self) {
        for family in self.sockets.keys() {
            let _ = fs::remove_file(self.socket_path(*family));
        }
    }
}

/// One booster's side of the invoker connection.
pub struct Connection {
    listener: UnixListener,
    stream: Option<UnixStream>,
}

impl Connection {
    /// Borrow the family's listening socket from the registry.
    pub fn new(registry: &SocketRegistry, family: Family) -> Result<Self> {
        let listener = registry
            .get(family)
            .with_context(|| format!("socket for family '{}' isn't initialized", family))?
            .try_clone()?;
        Ok(Self {
            listener,
            stream: None,
        })
    }

    /// Block until a client connects. EINTR is retried; other errors are
    /// reported and yield `false`.
    pub fn accept(&mut self) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    self.stream = Some(stream);
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accepting connections ({e})");
                    return false;
                }
            }
        }
    }

    /// Drive the receive state machine to a complete request.
    pub fn recv_request(&mut self) -> Result<AppRequest, ProtocolError> {
        let stream = self.stream.as_mut().ok_or(ProtocolError::AcceptFailed)?;
        receive_request(stream)
    }

    /// Close the accepted client; the listening socket is untouched.
    pub fn close(&mut self) {
        self.stream = None;
    }

    /// Hand out the accepted stream for the final adoption stage.
    pub fn into_stream(self) -> Option<UnixStream> {
        self.stream
    }
}

/// Receive state machine: magic word, application name, then actions until
/// END. Terminal errors leave the partial request discarded.
pub fn receive_request(stream: &mut UnixStream) -> Result<AppRequest, ProtocolError> {
    let mut request = AppRequest {
        options: recv_magic(stream)?,
        ..AppRequest::default()
    };

    request.display_name = recv_app_name(stream)?;
    recv_actions(stream, &mut request)?;

    if request.argv.is_empty() {
        request.argv = vec![request.display_name.clone()];
    }
    Ok(request)
}

fn recv_magic(stream: &mut UnixStream) -> Result<u32, ProtocolError> {
    let magic = protocol::recv_u32(stream)?;
    if magic & protocol::MSG_MASK != protocol::MSG_MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    if magic & protocol::MAGIC_VERSION_MASK != protocol::MAGIC_VERSION {
        return Err(ProtocolError::BadVersion(magic));
    }
    protocol::send_u32(stream, protocol::MSG_ACK)?;
    Ok(magic & protocol::MAGIC_OPTION_MASK)
}

fn recv_app_name(stream: &mut UnixStream) -> Result<std::ffi::OsString, ProtocolError> {
    let action = protocol::recv_u32(stream)?;
    if action != protocol::MSG_NAME {
        return Err(ProtocolError::UnknownAction(action));
    }
    let name = protocol::recv_str(stream)?;
    protocol::send_u32(stream, protocol::MSG_ACK)?;
    Ok(name)
}

fn recv_actions(stream: &mut UnixStream, request: &mut AppRequest) -> Result<(), ProtocolError> {
    loop {
        let action = protocol::recv_u32(stream)?;
        match action {
            protocol::MSG_EXEC => {
                request.exec_path = PathBuf::from(protocol::recv_str(stream)?);
                protocol::send_u32(stream, protocol::MSG_ACK)?;
            }
            protocol::MSG_ARGS => {
                recv_args(stream, request)?;
                protocol::send_u32(stream, protocol::MSG_ACK)?;
            }
            protocol::MSG_ENV => {
                // The ENV action is not acknowledged on the wire.
                recv_env(stream, request)?;
            }
            protocol::MSG_PRIO => {
                request.priority = protocol::recv_u32(stream)? as i32;
                protocol::send_u32(stream, protocol::MSG_ACK)?;
            }
            protocol::MSG_IO => {
                request.stdio = Some(protocol::recv_fds(stream)?);
                protocol::send_u32(stream, protocol::MSG_ACK)?;
            }
            protocol::MSG_END => {
                protocol::send_u32(stream, protocol::MSG_ACK)?;
                return Ok(());
            }
            other => return Err(ProtocolError::UnknownAction(other)),
        }
    }
}

fn recv_args(stream: &mut UnixStream, request: &mut AppRequest) -> Result<(), ProtocolError> {
    let argc = protocol::recv_u32(stream)?;
    let arg_max = nix::unistd::sysconf(nix::unistd::SysconfVar::ARG_MAX)
        .ok()
        .flatten()
        .unwrap_or(i64::from(u16::MAX)) as u32;

    if argc == 0 || argc >= arg_max {
        // Out-of-range counts are ignored so argv-less targets still launch.
        warn!("ignoring out-of-range argument count {argc}");
        return Ok(());
    }

    let mut argv = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        argv.push(protocol::recv_str(stream)?);
    }
    request.argv = argv;
    Ok(())
}

fn recv_env(stream: &mut UnixStream, request: &mut AppRequest) -> Result<(), ProtocolError> {
    let n_vars = protocol::recv_u32(stream)?;
    if n_vars == 0 || n_vars >= protocol::MAX_ENV_VARS {
        return Err(ProtocolError::EnvCount(n_vars));
    }

    for _ in 0..n_vars {
        let var = protocol::recv_str(stream)?;
        // Malformed entries are skipped; the peer keeps sending either way.
        if env_entry_ok(&var) {
            request.envp.push(var);
        } else {
            warn!("invalid environment data");
        }
    }
    Ok(())
}

/// An installable entry has a non-empty key, an `=`, and no interior NUL.
fn env_entry_ok(var: &OsStr) -> bool {
    let bytes = var.as_bytes();
    match bytes.iter().position(|&b| b == b'=') {
        Some(0) | None => false,
        Some(_) => !bytes.contains(&0),
    }
}
