//! Socket-level tests of the invoker↔booster protocol: a real bound family
//! socket, the client side driven by `InvokerClient`, the booster side by
//! `Connection`, each on its own thread.

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use prewarm::booster::Family;
use prewarm::connection::{Connection, SocketRegistry};
use prewarm::error::ProtocolError;
use prewarm::invoker::InvokerClient;
use prewarm::protocol::{self, AppRequest, MAGIC_VERSION, MSG_MAGIC, OPTION_WAIT};

fn registry_for(dir: &Path, family: Family) -> SocketRegistry {
    let mut registry = SocketRegistry::new(dir.to_path_buf());
    registry.init(family).unwrap();
    registry
}

fn serve_one(
    registry: &SocketRegistry,
    family: Family,
) -> thread::JoinHandle<Result<AppRequest, ProtocolError>> {
    let mut connection = Connection::new(registry, family).unwrap();
    thread::spawn(move || {
        assert!(connection.accept());
        let result = connection.recv_request();
        connection.close();
        result
    })
}

#[test]
fn invoker_drives_full_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_for(dir.path(), Family::Quick);
    let server = serve_one(&registry, Family::Quick);

    let socket_path = Family::Quick.socket_path(dir.path());
    let mut client = InvokerClient::connect(&socket_path).unwrap();
    client.send_magic(OPTION_WAIT).unwrap();
    client.send_name(OsStr::new("hello")).unwrap();
    client.send_exec(Path::new("/bin/echo")).unwrap();
    client
        .send_args(&[OsString::from("hello"), OsString::from("world")])
        .unwrap();
    client.send_prio(10).unwrap();
    client.send_io().unwrap();
    client
        .send_env_entries(&[OsString::from("LANG=C"), OsString::from("TERM=dumb")])
        .unwrap();
    client.send_end().unwrap();

    let request = server.join().unwrap().unwrap();
    assert_eq!(request.options, OPTION_WAIT);
    assert_eq!(request.display_name, OsString::from("hello"));
    assert_eq!(request.exec_path, PathBuf::from("/bin/echo"));
    assert_eq!(
        request.argv,
        vec![OsString::from("hello"), OsString::from("world")]
    );
    assert_eq!(request.priority, 10);
    assert_eq!(
        request.envp,
        vec![OsString::from("LANG=C"), OsString::from("TERM=dumb")]
    );

    let stdio = request.stdio.expect("stdio descriptors received");
    for fd in stdio {
        assert!(fd > 2, "received fds are fresh duplicates");
        nix::unistd::close(fd).unwrap();
    }
}

#[test]
fn minimal_request_takes_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_for(dir.path(), Family::Main);
    let server = serve_one(&registry, Family::Main);

    let socket_path = Family::Main.socket_path(dir.path());
    let mut client = InvokerClient::connect(&socket_path).unwrap();
    client.send_magic(0).unwrap();
    client.send_name(OsStr::new("bare")).unwrap();
    client.send_end().unwrap();

    let request = server.join().unwrap().unwrap();
    assert_eq!(request.argv, vec![OsString::from("bare")]);
    assert!(request.envp.is_empty());
    assert_eq!(request.priority, 0);
    assert!(request.stdio.is_none());
}

#[test]
fn unsupported_version_hangs_up_without_ack() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_for(dir.path(), Family::Quick);
    let server = serve_one(&registry, Family::Quick);

    let socket_path = Family::Quick.socket_path(dir.path());
    let mut stream = UnixStream::connect(&socket_path).unwrap();
    protocol::send_u32(&mut stream, MSG_MAGIC | 0x0000_0200).unwrap();

    assert!(matches!(
        server.join().unwrap(),
        Err(ProtocolError::BadVersion(_))
    ));

    // The booster exited the connection; the next read sees EOF, no ACK.
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn garbage_action_terminates_connection() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_for(dir.path(), Family::Quick);
    let server = serve_one(&registry, Family::Quick);

    let socket_path = Family::Quick.socket_path(dir.path());
    let mut stream = UnixStream::connect(&socket_path).unwrap();
    protocol::send_u32(&mut stream, MSG_MAGIC | MAGIC_VERSION).unwrap();
    assert_eq!(protocol::recv_u32(&mut stream).unwrap(), protocol::MSG_ACK);
    protocol::send_u32(&mut stream, protocol::MSG_NAME).unwrap();
    protocol::send_str(&mut stream, OsStr::new("victim")).unwrap();
    assert_eq!(protocol::recv_u32(&mut stream).unwrap(), protocol::MSG_ACK);
    protocol::send_u32(&mut stream, 0x1234_0000).unwrap();

    assert!(matches!(
        server.join().unwrap(),
        Err(ProtocolError::UnknownAction(0x1234_0000))
    ));

    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn wait_returns_when_booster_side_closes() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_for(dir.path(), Family::Main);

    let mut connection = Connection::new(&registry, Family::Main).unwrap();
    let server = thread::spawn(move || {
        assert!(connection.accept());
        let request = connection.recv_request().unwrap();
        // Simulate the target running briefly, then exiting: the connection
        // closes with it.
        thread::sleep(Duration::from_millis(50));
        drop(connection);
        request
    });

    let socket_path = Family::Main.socket_path(dir.path());
    let mut client = InvokerClient::connect(&socket_path).unwrap();
    client.send_magic(OPTION_WAIT).unwrap();
    client.send_name(OsStr::new("short-lived")).unwrap();
    client.send_end().unwrap();

    let started = Instant::now();
    client.wait_for_exit();
    assert!(started.elapsed() >= Duration::from_millis(40));

    server.join().unwrap();
}

#[test]
fn second_invoker_queues_in_backlog() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_for(dir.path(), Family::Quick);
    let socket_path = Family::Quick.socket_path(dir.path());

    // Both clients connect before anyone accepts; the kernel backlog holds
    // the second while the first is served.
    let mut first = InvokerClient::connect(&socket_path).unwrap();
    let mut second = InvokerClient::connect(&socket_path).unwrap();

    for client in [&mut first, &mut second] {
        let server = serve_one(&registry, Family::Quick);
        client.send_magic(0).unwrap();
        client.send_name(OsStr::new("queued")).unwrap();
        client.send_end().unwrap();
        let request = server.join().unwrap().unwrap();
        assert_eq!(request.display_name, OsString::from("queued"));
    }
}
