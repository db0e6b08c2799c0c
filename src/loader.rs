//! The hand-off into the target program.
//!
//! `load_and_enter` is the boundary the rest of the crate treats as opaque:
//! given a path, argv, and a replacement environment, it transfers control to
//! the target and never returns on success. The current realization is
//! `execve`; the booster's identity (stdio, environment, priority, process
//! name) has already been arranged by the adoption sequence.

use std::ffi::{CString, OsString};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Exit status when the target cannot be resolved or entered.
pub const EXIT_LOAD_FAILED: i32 = 127;

/// Clear FD_CLOEXEC so the descriptor survives the hand-off. Used on the
/// accepted invoker socket, whose close-on-exit is the invoker's only signal
/// that the target has finished.
pub fn retain_across_exec<F: AsRawFd>(fd: &F) {
    let raw = fd.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    }
}

/// Enter the target program. Returns only on failure.
pub fn load_and_enter(path: &Path, argv: &[OsString], envp: &[OsString]) -> io::Error {
    let prog = match CString::new(path.as_os_str().as_bytes()) {
        Ok(prog) => prog,
        Err(_) => return io::Error::from(io::ErrorKind::InvalidInput),
    };
    let argv_c = match to_cstrings(argv) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let envp_c = match to_cstrings(envp) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match nix::unistd::execve(&prog, &argv_c, &envp_c) {
        Ok(infallible) => match infallible {},
        Err(errno) => io::Error::from(errno),
    }
}

fn to_cstrings(strings: &[OsString]) -> Result<Vec<CString>, io::Error> {
    strings
        .iter()
        .map(|s| {
            CString::new(s.as_bytes()).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn load_missing_target_reports_not_found() {
        let err = load_and_enter(
            Path::new("/no/such/binary"),
            &[OsString::from("ghost")],
            &[],
        );
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn interior_nul_is_rejected() {
        use std::os::unix::ffi::OsStringExt;

        let err = load_and_enter(
            Path::new("/bin/true"),
            &[OsString::from_vec(vec![b'a', 0, b'b'])],
            &[],
        );
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn retain_across_exec_clears_cloexec() {
        let (stream, _peer) = UnixStream::pair().unwrap();
        retain_across_exec(&stream);

        let flags = unsafe { libc::fcntl(stream.as_raw_fd(), libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
    }
}
