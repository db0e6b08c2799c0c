//! Invoker↔booster wire protocol.
//!
//! Every frame starts with a 32-bit little-endian word. Most words are action
//! codes; strings and descriptor sets ride behind their action:
//!
//! ```text
//! ┌────────────┬──────────────────────┬───────┐
//! │   Length   │        Bytes         │  NUL  │
//! │  (4 bytes) │   (length-1 bytes)   │ (1 B) │
//! └────────────┴──────────────────────┴───────┘
//! ```
//!
//! The string length prefix includes the terminating NUL. Stdio descriptors
//! travel as a single SCM_RIGHTS control message of exactly three fds
//! alongside one dummy data byte. Strings are 8-bit clean; nothing here
//! assumes a character set, so the decoded form is `OsString`.

use std::ffi::OsString;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use crate::error::ProtocolError;

/// Mask selecting the action half of a protocol word.
pub const MSG_MASK: u32 = 0xffff_0000;

/// Opening word of every request; version and option bits live in the low half.
pub const MSG_MAGIC: u32 = 0xb005_0000;
pub const MAGIC_VERSION_MASK: u32 = 0x0000_ff00;
pub const MAGIC_VERSION: u32 = 0x0000_0100;
pub const MAGIC_OPTION_MASK: u32 = 0x0000_00ff;

/// Option bit: the invoker intends to wait for the target to exit.
pub const OPTION_WAIT: u32 = 0x0000_0001;

pub const MSG_NAME: u32 = 0x5a3e_0000;
pub const MSG_EXEC: u32 = 0xe8ec_0000;
pub const MSG_ARGS: u32 = 0xa565_0000;
pub const MSG_ENV: u32 = 0xe501_0000;
pub const MSG_PRIO: u32 = 0x5c03_0000;
pub const MSG_IO: u32 = 0x10fd_0000;
pub const MSG_END: u32 = 0xd03e_0000;
pub const MSG_ACK: u32 = 0x600d_0000;
pub const MSG_BAD_CREDS: u32 = 0xbad5_0000;

/// Per-string cap (prefix value, so including the NUL). Protects the booster
/// from a hostile length word.
pub const MAX_STRING_SIZE: u32 = 256 * 1024;

/// Cap on the ENV action's entry count.
pub const MAX_ENV_VARS: u32 = 1024;

/// A fully decoded launch request, complete only once END has been ACK'd.
#[derive(Debug, Default)]
pub struct AppRequest {
    /// Option bits extracted from the magic word.
    pub options: u32,
    /// Shown in the process table; never used to locate the binary.
    pub display_name: OsString,
    /// Absolute path of the target program.
    pub exec_path: PathBuf,
    /// Argv exactly as the target should see it.
    pub argv: Vec<OsString>,
    /// Wholesale replacement environment, `KEY=VALUE` entries.
    pub envp: Vec<OsString>,
    /// Nice value, applied best-effort.
    pub priority: i32,
    /// Stdio received over SCM_RIGHTS; `None` keeps the booster's own stdio.
    pub stdio: Option<[RawFd; 3]>,
}

pub fn send_u32<W: Write>(writer: &mut W, value: u32) -> Result<(), ProtocolError> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn recv_u32<R: Read>(reader: &mut R) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(short_read)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn send_str<W: Write>(writer: &mut W, s: &std::ffi::OsStr) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    send_u32(writer, bytes.len() as u32 + 1)?;
    writer.write_all(bytes)?;
    writer.write_all(&[0])?;
    Ok(())
}

pub fn recv_str<R: Read>(reader: &mut R) -> Result<OsString, ProtocolError> {
    let size = recv_u32(reader)?;
    if size == 0 || size > MAX_STRING_SIZE {
        return Err(ProtocolError::StringLength(size));
    }

    let mut buf = vec![0u8; size as usize];
    reader.read_exact(&mut buf).map_err(short_read)?;

    if buf.pop() != Some(0) {
        return Err(ProtocolError::MissingNul);
    }
    Ok(OsString::from_vec(buf))
}

/// Send the three stdio descriptors with one dummy data byte.
pub fn send_fds<S: AsRawFd>(socket: &S, fds: &[RawFd; 3]) -> Result<(), ProtocolError> {
    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

    let dummy = [0u8; 1];
    let iov = [IoSlice::new(&dummy)];
    let rights = ControlMessage::ScmRights(&fds[..]);

    sendmsg::<()>(socket.as_raw_fd(), &iov, &[rights], MsgFlags::empty(), None)?;
    Ok(())
}

/// Receive exactly three descriptors. Anything other than a single untruncated
/// SCM_RIGHTS message of three fds is rejected.
pub fn recv_fds<S: AsRawFd>(socket: &S) -> Result<[RawFd; 3], ProtocolError> {
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

    let mut dummy = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut dummy)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 3]);

    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )?;

    if !msg.flags.is_empty() {
        return Err(ProtocolError::BadControlMessage);
    }

    let mut cmsgs = msg.cmsgs().map_err(|_| ProtocolError::BadControlMessage)?;
    match (cmsgs.next(), cmsgs.next()) {
        (Some(ControlMessageOwned::ScmRights(fds)), None) if fds.len() == 3 => {
            Ok([fds[0], fds[1], fds[2]])
        }
        _ => Err(ProtocolError::BadControlMessage),
    }
}

fn short_read(e: io::Error) -> ProtocolError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::ShortRead
    } else {
        ProtocolError::Io(e)
    }
}
