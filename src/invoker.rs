//! The invoker: a short-lived client that asks a warm booster to launch a
//! program.
//!
//! The send sequence is fixed: magic, name, exec, args, priority, stdio,
//! environment, end. Each message is acknowledged by the booster except the
//! environment action, which the wire protocol leaves unacknowledged. Unless
//! `--no-wait` is given the invoker then blocks until the booster's socket
//! closes, which happens when the launched program exits.

use std::env;
use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

use crate::booster::Family;
use crate::protocol::{
    self, MAGIC_VERSION, MSG_ACK, MSG_ARGS, MSG_BAD_CREDS, MSG_END, MSG_ENV, MSG_EXEC, MSG_IO,
    MSG_MAGIC, MSG_NAME, MSG_PRIO, OPTION_WAIT,
};

/// Suffix stripped from the target's displayed name.
const LAUNCH_SUFFIX: &str = ".launch";

/// Command line of the invoker tool. Everything from the first non-option
/// token on is the target program and its arguments.
#[derive(Debug, Parser)]
#[command(
    name = "prewarm",
    about = "Launch a program through a pre-initialized booster"
)]
pub struct InvokerArgs {
    /// Booster family to launch through (m or q)
    #[arg(long = "type", value_name = "TYPE", value_parser = parse_family)]
    pub family: Option<Family>,

    /// Sleep this many seconds after invoking (0 disables)
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    pub delay: u64,

    /// Don't wait for the launched process to exit
    #[arg(long)]
    pub no_wait: bool,

    /// Print security credential information
    #[arg(long)]
    pub creds: bool,

    /// Target program and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROG [ARGS]...")]
    pub command: Vec<String>,
}

fn parse_family(s: &str) -> Result<Family, String> {
    match s {
        "m" | "main" => Ok(Family::Main),
        "q" | "quick" => Ok(Family::Quick),
        other => Err(format!("unknown booster type '{other}' (expected m or q)")),
    }
}

/// Resolve the target: a name with `/` is taken as a path, anything else is
/// searched along `$PATH` for an executable regular file.
pub fn resolve_program(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }

    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Displayed name of the target: the launch suffix stripped off.
pub fn display_name(name: &str) -> &str {
    name.strip_suffix(LAUNCH_SUFFIX).unwrap_or(name)
}

pub struct InvokerClient {
    stream: UnixStream,
}

impl InvokerClient {
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).with_context(|| {
            format!(
                "failed to initiate connect on the socket {}",
                socket_path.display()
            )
        })?;
        Ok(Self { stream })
    }

    pub fn send_magic(&mut self, options: u32) -> Result<()> {
        protocol::send_u32(&mut self.stream, MSG_MAGIC | MAGIC_VERSION | options)?;
        self.recv_ack()
    }

    pub fn send_name(&mut self, name: &OsStr) -> Result<()> {
        protocol::send_u32(&mut self.stream, MSG_NAME)?;
        protocol::send_str(&mut self.stream, name)?;
        self.recv_ack()
    }

    pub fn send_exec(&mut self, exec_path: &Path) -> Result<()> {
        protocol::send_u32(&mut self.stream, MSG_EXEC)?;
        protocol::send_str(&mut self.stream, exec_path.as_os_str())?;
        self.recv_ack()
    }

    pub fn send_args(&mut self, argv: &[OsString]) -> Result<()> {
        protocol::send_u32(&mut self.stream, MSG_ARGS)?;
        protocol::send_u32(&mut self.stream, argv.len() as u32)?;
        for arg in argv {
            protocol::send_str(&mut self.stream, arg)?;
        }
        self.recv_ack()
    }

    pub fn send_prio(&mut self, priority: i32) -> Result<()> {
        protocol::send_u32(&mut self.stream, MSG_PRIO)?;
        protocol::send_u32(&mut self.stream, priority as u32)?;
        self.recv_ack()
    }

    /// Pass our stdio to the booster.
    pub fn send_io(&mut self) -> Result<()> {
        protocol::send_u32(&mut self.stream, MSG_IO)?;
        protocol::send_fds(&self.stream, &[0, 1, 2])?;
        self.recv_ack()
    }

    /// Send the whole process environment. This action is not acknowledged.
    pub fn send_env(&mut self) -> Result<()> {
        let entries: Vec<OsString> = env::vars_os()
            .map(|(mut key, value)| {
                key.push("=");
                key.push(value);
                key
            })
            .collect();
        self.send_env_entries(&entries)
    }

    pub fn send_env_entries(&mut self, entries: &[OsString]) -> Result<()> {
        protocol::send_u32(&mut self.stream, MSG_ENV)?;
        protocol::send_u32(&mut self.stream, entries.len() as u32)?;
        for entry in entries {
            protocol::send_str(&mut self.stream, entry)?;
        }
        Ok(())
    }

    pub fn send_end(&mut self) -> Result<()> {
        protocol::send_u32(&mut self.stream, MSG_END)?;
        self.recv_ack()
    }

    /// Block until the booster side closes, i.e. until the launched program
    /// has exited.
    pub fn wait_for_exit(&mut self) {
        let mut buf = [0u8; 1];
        let _ = self.stream.read(&mut buf);
    }

    fn recv_ack(&mut self) -> Result<()> {
        let action = protocol::recv_u32(&mut self.stream)?;
        if action == MSG_BAD_CREDS {
            bail!("security credential check failed");
        }
        if action != MSG_ACK {
            bail!("received wrong ack ({action:#010x})");
        }
        Ok(())
    }
}

/// A resolved launch: what gets sent over the wire.
#[derive(Debug)]
pub struct Invocation {
    pub family: Family,
    pub exec_path: PathBuf,
    pub display_name: String,
    pub argv: Vec<OsString>,
    pub no_wait: bool,
}

impl Invocation {
    /// Build from parsed arguments; fails on a missing type or target.
    pub fn from_args(args: &InvokerArgs) -> Result<Self> {
        let family = args
            .family
            .ok_or_else(|| anyhow!("application type is missing"))?;

        let target = args
            .command
            .first()
            .ok_or_else(|| anyhow!("application's name is unknown"))?;
        let exec_path = resolve_program(target)
            .ok_or_else(|| anyhow!("can't find application to invoke: {target}"))?;

        let name = display_name(target).to_string();
        let mut argv: Vec<OsString> = args.command.iter().map(OsString::from).collect();
        argv[0] = OsString::from(&name);

        Ok(Self {
            family,
            exec_path,
            display_name: name,
            argv,
            no_wait: args.no_wait,
        })
    }

    /// Drive the whole send side against the family's socket.
    pub fn run(&self, socket_dir: &Path) -> Result<InvokerClient> {
        let socket_path = self.family.socket_path(socket_dir);
        let mut client = InvokerClient::connect(&socket_path)?;

        let options = if self.no_wait { 0 } else { OPTION_WAIT };
        client.send_magic(options)?;
        client.send_name(OsStr::new(&self.display_name))?;
        client.send_exec(&self.exec_path)?;
        client.send_args(&self.argv)?;
        client.send_prio(current_priority())?;
        client.send_io()?;
        client.send_env()?;
        client.send_end()?;

        Ok(client)
    }
}

/// Snapshot our own nice value for the PRIO action. An errno with a negative
/// result collapses to 0.
pub fn current_priority() -> i32 {
    nix::errno::Errno::clear();
    let priority = unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };
    if nix::errno::Errno::last_raw() != 0 && priority < 0 {
        0
    } else {
        priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> InvokerArgs {
        InvokerArgs::try_parse_from(argv.iter().copied()).unwrap()
    }

    #[test]
    fn parses_flags_and_target_argv() {
        let args = parse(&[
            "prewarm", "--type=m", "--delay", "5", "--no-wait", "/bin/prog", "a", "b",
        ]);

        assert_eq!(args.family, Some(Family::Main));
        assert_eq!(args.delay, 5);
        assert!(args.no_wait);
        assert_eq!(args.command, vec!["/bin/prog", "a", "b"]);
    }

    #[test]
    fn target_arguments_may_look_like_flags() {
        let args = parse(&["prewarm", "--type=q", "/bin/prog", "--verbose", "-x"]);
        assert_eq!(args.command, vec!["/bin/prog", "--verbose", "-x"]);
    }

    #[test]
    fn family_long_names_accepted() {
        assert_eq!(parse(&["prewarm", "--type=quick", "p"]).family, Some(Family::Quick));
        assert_eq!(parse(&["prewarm", "--type=main", "p"]).family, Some(Family::Main));
    }

    #[test]
    fn rejects_unknown_family() {
        assert!(InvokerArgs::try_parse_from(["prewarm", "--type=z", "p"]).is_err());
    }

    #[test]
    fn rejects_malformed_delay() {
        assert!(InvokerArgs::try_parse_from(["prewarm", "--delay", "soon", "p"]).is_err());
    }

    #[test]
    fn creds_flag_parses_without_target() {
        let args = parse(&["prewarm", "--creds"]);
        assert!(args.creds);
        assert!(args.command.is_empty());
    }

    #[test]
    fn display_name_strips_launch_suffix() {
        assert_eq!(display_name("editor.launch"), "editor");
        assert_eq!(display_name("editor"), "editor");
    }

    #[test]
    fn resolve_absolute_path() {
        assert_eq!(
            resolve_program("/bin/sh"),
            Some(PathBuf::from("/bin/sh"))
        );
        assert_eq!(resolve_program("/no/such/prog"), None);
    }

    #[test]
    fn resolve_searches_path() {
        let sh = resolve_program("sh").expect("sh on PATH");
        assert!(sh.is_absolute());
        assert!(is_executable(&sh));
    }

    #[test]
    fn invocation_requires_type_and_target() {
        let no_type = parse(&["prewarm", "/bin/sh"]);
        assert!(Invocation::from_args(&no_type).is_err());

        let no_target = parse(&["prewarm", "--type=q"]);
        assert!(Invocation::from_args(&no_target).is_err());
    }

    #[test]
    fn invocation_rewrites_argv0_to_display_name() {
        let args = parse(&["prewarm", "--type=q", "sh", "-c", "exit"]);
        let invocation = Invocation::from_args(&args).unwrap();

        assert_eq!(invocation.display_name, "sh");
        assert_eq!(
            invocation.argv,
            vec![
                OsString::from("sh"),
                OsString::from("-c"),
                OsString::from("exit")
            ]
        );
        assert!(invocation.exec_path.is_absolute());
    }
}
