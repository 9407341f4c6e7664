mod common;

use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use common::{event_loop, localhost, wait_until, Shared};
use millstream::{
    Capabilities, ConnectConfig, DisconnectCause, Error, Handler, NonBlockingConnection, Result,
    ServerConfig,
};
use parking_lot::Mutex;

#[derive(Debug, PartialEq)]
enum Observed {
    Available(usize),
    Line(String, usize),
}

struct LineObserver {
    events: Mutex<mpsc::Sender<Observed>>,
}

impl Handler for LineObserver {
    fn capabilities(&self) -> Capabilities {
        Capabilities::DATA
    }

    fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
        let events = self.events.lock();
        let _ = events.send(Observed::Available(conn.available()));
        let line = conn.read_string_by_delimiter(b"\r\n")?;
        let _ = events.send(Observed::Line(line, conn.available()));
        Ok(true)
    }
}

fn next_available(rx: &mpsc::Receiver<Observed>, expected: usize) {
    loop {
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Observed::Available(n) if n == expected => return,
            Observed::Available(n) if n < expected => continue,
            other => panic!("expected {} buffered bytes, got {:?}", expected, other),
        }
    }
}

#[test]
fn test_fragmented_line_is_framed_once_complete() {
    let event_loop = event_loop();
    let (tx, rx) = mpsc::channel();
    let server = event_loop
        .listen(
            ServerConfig::builder().address(localhost()).build(),
            Arc::new(LineObserver {
                events: Mutex::new(tx),
            }),
        )
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.write_all(b"123456").unwrap();
    next_available(&rx, 6);
    client.write_all(b"78901").unwrap();
    next_available(&rx, 11);
    client.write_all(b"234").unwrap();
    next_available(&rx, 14);
    client.write_all(b"\r\n").unwrap();

    let line = loop {
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Observed::Available(_) => continue,
            Observed::Line(line, remaining) => break (line, remaining),
        }
    };
    assert_eq!(line, ("12345678901234".to_string(), 0));
}

#[derive(Default)]
struct IdleWatcher {
    idle_timeouts: AtomicUsize,
    causes: Mutex<Vec<String>>,
}

impl Handler for IdleWatcher {
    fn on_idle_timeout(&self, _conn: &NonBlockingConnection) -> bool {
        self.idle_timeouts.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn on_disconnect(&self, _conn: &NonBlockingConnection, cause: &DisconnectCause) {
        self.causes.lock().push(cause.to_string());
    }
}

#[test]
fn test_idle_timeout_fires_once() {
    let event_loop = event_loop();
    let watcher = Arc::new(IdleWatcher::default());
    let server = event_loop
        .listen(
            ServerConfig::builder()
                .address(localhost())
                .idle_timeout(Duration::from_millis(150))
                .build(),
            watcher.clone(),
        )
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // the server closes the silent connection, so the client sees EOF
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).unwrap(), 0);

    assert!(wait_until(Duration::from_secs(5), || {
        watcher.causes.lock().len() == 1
    }));
    assert_eq!(watcher.idle_timeouts.load(Ordering::SeqCst), 1);
    assert_eq!(watcher.causes.lock()[0], DisconnectCause::IdleTimeout.to_string());
    assert!(wait_until(Duration::from_secs(2), || server.connection_count() == 0));

    let stats = event_loop.stats();
    assert_eq!(stats.dispatchers.iter().map(|d| d.idle_timeouts).sum::<u64>(), 1);
}

#[derive(Default)]
struct Vetoing {
    idle_timeouts: AtomicUsize,
}

impl Handler for Vetoing {
    fn on_idle_timeout(&self, _conn: &NonBlockingConnection) -> bool {
        self.idle_timeouts.fetch_add(1, Ordering::SeqCst) >= 1
    }
}

#[test]
fn test_idle_timeout_can_be_vetoed() {
    let event_loop = event_loop();
    let handler = Arc::new(Vetoing::default());
    let server = event_loop
        .listen(
            ServerConfig::builder()
                .address(localhost())
                .idle_timeout(Duration::from_millis(100))
                .build(),
            handler.clone(),
        )
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        handler.idle_timeouts.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(server.connection_count(), 1);
    assert_eq!(handler.idle_timeouts.load(Ordering::SeqCst), 1);

    // activity re-arms the idle timer; the second expiry is accepted
    client.write_all(b"x").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    assert_eq!(handler.idle_timeouts.load(Ordering::SeqCst), 2);
}

struct LineEcho;

impl Handler for LineEcho {
    fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
        let line = conn.read_by_delimiter(b"\r\n")?;
        conn.write(&line)?;
        conn.write(b"\r\n")?;
        Ok(true)
    }
}

#[test]
fn test_blocking_connection_round_trip() {
    let event_loop = event_loop();
    let server = event_loop
        .listen(
            ServerConfig::builder().address(localhost()).build(),
            Arc::new(LineEcho),
        )
        .unwrap();

    let mut client = event_loop
        .connect_blocking(server.local_addr(), ConnectConfig::default())
        .unwrap();
    client.set_read_timeout(Duration::from_millis(200));

    client.write(b"hello\r\nworld\r\n").unwrap();
    assert_eq!(client.read_string_by_delimiter(b"\r\n").unwrap(), "hello");
    assert_eq!(&client.read_by_length(5).unwrap()[..], b"world");
    assert_eq!(&client.read_by_length(2).unwrap()[..], b"\r\n");

    // nothing else was sent
    assert!(matches!(client.read_by_length(1), Err(Error::Timeout)));

    client.close().unwrap();
    assert!(!client.is_open());
    assert!(matches!(client.write(b"late"), Err(Error::Closed)));
    assert!(wait_until(Duration::from_secs(2), || server.connection_count() == 0));
}

#[test]
fn test_disconnect_reported_once_on_peer_close() {
    struct Recorder(Shared<Vec<String>>);

    impl Handler for Recorder {
        fn on_disconnect(&self, _conn: &NonBlockingConnection, cause: &DisconnectCause) {
            self.0.lock().push(cause.to_string());
        }
    }

    let event_loop = event_loop();
    let causes: Shared<Vec<String>> = Arc::default();
    let server = event_loop
        .listen(
            ServerConfig::builder().address(localhost()).build(),
            Arc::new(Recorder(causes.clone())),
        )
        .unwrap();

    let client = TcpStream::connect(server.local_addr()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || server.connection_count() == 1));
    drop(client);

    assert!(wait_until(Duration::from_secs(5), || !causes.lock().is_empty()));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*causes.lock(), vec![DisconnectCause::PeerClosed.to_string()]);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_outbound_connection_to_framework_server() {
    let event_loop = event_loop();
    let server = event_loop
        .listen(
            ServerConfig::builder().address(localhost()).build(),
            Arc::new(LineEcho),
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let conn = event_loop
        .connect(
            server.local_addr(),
            ConnectConfig::default(),
            Arc::new(LineObserver {
                events: Mutex::new(tx),
            }),
        )
        .unwrap();
    assert!(!conn.is_server_side());
    conn.write(b"ping\r\n").unwrap();

    let line = loop {
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Observed::Available(_) => continue,
            Observed::Line(line, _) => break line,
        }
    };
    assert_eq!(line, "ping");
    conn.close();
}

/// Sends every accepted connection to the test.
struct Handoff {
    conns: Mutex<mpsc::Sender<NonBlockingConnection>>,
    lines: Shared<Vec<String>>,
    suspend: bool,
    greeting: Option<&'static [&'static [u8]]>,
}

impl Handoff {
    fn new(tx: mpsc::Sender<NonBlockingConnection>) -> Self {
        Self {
            conns: Mutex::new(tx),
            lines: Arc::default(),
            suspend: false,
            greeting: None,
        }
    }
}

impl Handler for Handoff {
    fn on_connect(&self, conn: &NonBlockingConnection) -> Result<bool> {
        if self.suspend {
            conn.suspend_receiving()?;
        }
        for part in self.greeting.unwrap_or_default() {
            conn.write(part)?;
        }
        let _ = self.conns.lock().send(conn.clone());
        Ok(true)
    }

    fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
        let line = conn.read_string_by_delimiter(b"\r\n")?;
        self.lines.lock().push(line);
        Ok(true)
    }
}

const GREETING: &[&[u8]] = &[b"part1-", b"part2\r\n"];

#[test]
fn test_manual_flush_holds_output() {
    let event_loop = event_loop();
    let (tx, rx) = mpsc::channel();
    let handler = Handoff {
        greeting: Some(GREETING),
        ..Handoff::new(tx)
    };
    let server = event_loop
        .listen(
            ServerConfig::builder()
                .address(localhost())
                .autoflush(false)
                .build(),
            Arc::new(handler),
        )
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    let conn = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!conn.is_autoflush());
    assert_eq!(conn.pending_write_size(), 13);

    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut buf = [0u8; 13];
    let err = client.read(&mut buf).unwrap_err();
    assert!(matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    ));

    conn.flush().unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"part1-part2\r\n");
    assert!(wait_until(Duration::from_secs(2), || conn.pending_write_size() == 0));
}

#[derive(Default)]
struct LifetimeWatcher {
    connection_timeouts: AtomicUsize,
    causes: Mutex<Vec<DisconnectCause>>,
}

impl Handler for LifetimeWatcher {
    fn on_connection_timeout(&self, _conn: &NonBlockingConnection) -> bool {
        self.connection_timeouts.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn on_disconnect(&self, _conn: &NonBlockingConnection, cause: &DisconnectCause) {
        self.causes.lock().push(cause.clone());
    }
}

#[test]
fn test_connection_timeout_closes_busy_connection() {
    let event_loop = event_loop();
    let watcher = Arc::new(LifetimeWatcher::default());
    let server = event_loop
        .listen(
            ServerConfig::builder()
                .address(localhost())
                .connection_timeout(Duration::from_millis(150))
                .build(),
            watcher.clone(),
        )
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    // activity does not extend the connection lifetime
    for _ in 0..5 {
        if client.write_all(b"tick").is_err() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(wait_until(Duration::from_secs(5), || !watcher.causes.lock().is_empty()));
    assert_eq!(watcher.connection_timeouts.load(Ordering::SeqCst), 1);
    assert!(matches!(
        watcher.causes.lock().as_slice(),
        [DisconnectCause::ConnectionTimeout]
    ));
    assert!(wait_until(Duration::from_secs(2), || server.connection_count() == 0));

    let stats = event_loop.stats();
    assert_eq!(
        stats.dispatchers.iter().map(|d| d.connection_timeouts).sum::<u64>(),
        1
    );
}

#[test]
fn test_suspended_connection_receives_after_resume() {
    let event_loop = event_loop();
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Handoff {
        suspend: true,
        ..Handoff::new(tx)
    });
    let server = event_loop
        .listen(
            ServerConfig::builder().address(localhost()).build(),
            handler.clone(),
        )
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    let conn = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(conn.is_receiving_suspended());

    client.write_all(b"held\r\n").unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(conn.available(), 0);
    assert!(handler.lines.lock().is_empty());

    conn.resume_receiving().unwrap();
    assert!(!conn.is_receiving_suspended());
    assert!(wait_until(Duration::from_secs(5), || !handler.lines.lock().is_empty()));
    assert_eq!(*handler.lines.lock(), vec!["held".to_string()]);

    client.write_all(b"live\r\n").unwrap();
    assert!(wait_until(Duration::from_secs(5), || handler.lines.lock().len() == 2));
}
