// Transport/server scenarios: an echo listener serving real TCP clients,
// a client xprt driving the connect path, and graceful destruction with
// every xprt torn down and the destructor run exactly once.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ukern::net::{
    create_server, create_xprt, Xprt, XprtOps, SHUT_RDWR, XPRT_ST_OPENED, XPRT_TCPCLNT,
    XPRT_TCPSERV,
};
use ukern::process::Completion;
use ukern::RtError;

struct EchoOps;

impl XprtOps for EchoOps {
    fn on_recv(&self, xprt: &Arc<Xprt>) -> ukern::Result<()> {
        let mut buf = [0u8; 512];
        loop {
            match xprt.recv(&mut buf) {
                Ok(0) => {
                    xprt.shutdown(SHUT_RDWR);
                    return Ok(());
                }
                Ok(n) => {
                    let _ = xprt.send(&buf[..n]);
                }
                Err(RtError::WouldBlock) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }
}

struct ClientOps {
    opened: Completion,
    echoed: Completion,
    payload: &'static [u8],
}

impl XprtOps for ClientOps {
    fn on_recv(&self, xprt: &Arc<Xprt>) -> ukern::Result<()> {
        let mut buf = [0u8; 512];
        loop {
            match xprt.recv(&mut buf) {
                Ok(0) => {
                    xprt.shutdown(SHUT_RDWR);
                    return Ok(());
                }
                Ok(n) => {
                    assert_eq!(&buf[..n], &self.payload[..n]);
                    self.echoed.complete();
                }
                Err(RtError::WouldBlock) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn on_changed(&self, xprt: &Arc<Xprt>, state: u32) {
        if state == XPRT_ST_OPENED {
            let _ = xprt.send(self.payload);
            self.opened.complete();
        }
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn spin_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "timed out: {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn echo_server_round_trip() {
    init_logging();
    let server = create_server(16, None).unwrap();
    let listener = create_xprt(
        &server,
        XPRT_TCPSERV,
        "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        Arc::new(EchoOps),
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"ping over the loop").unwrap();

    let mut buf = [0u8; 64];
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping over the loop");
    assert_eq!(server.nr_xprts(), 2);

    drop(client);
    spin_until("connection xprt leaves the server", || server.nr_xprts() == 1);

    listener.destroy();
    server.destroy();
}

#[test]
fn client_xprt_connects_and_hears_the_echo() {
    init_logging();
    let server = create_server(16, None).unwrap();
    let listener = create_xprt(
        &server,
        XPRT_TCPSERV,
        "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        Arc::new(EchoOps),
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let ops = Arc::new(ClientOps {
        opened: Completion::new(),
        echoed: Completion::new(),
        payload: b"xprt to xprt",
    });
    let client = create_xprt(&server, XPRT_TCPCLNT, addr, ops.clone()).unwrap();

    assert!(ops.opened.wait_timeout(Some(5_000)), "client never opened");
    assert!(ops.echoed.wait_timeout(Some(5_000)), "echo never arrived");

    client.shutdown(SHUT_RDWR);
    spin_until("client xprt detaches", || server.nr_xprts() <= 2);
    server.destroy();
    assert_eq!(server.nr_xprts(), 0);
}

#[test]
fn graceful_destroy_reaps_everything() {
    init_logging();
    static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

    let server = create_server(
        16,
        Some(Box::new(|_s| {
            DTOR_RUNS.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    let listener = create_xprt(
        &server,
        XPRT_TCPSERV,
        "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        Arc::new(EchoOps),
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();

    // A few live clients that stay connected through the teardown.
    let clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
    for client in &clients {
        let mut c = client.try_clone().unwrap();
        c.write_all(b"hello").unwrap();
    }
    spin_until("all connections attach", || server.nr_xprts() == 4);

    server.destroy();
    assert_eq!(server.nr_xprts(), 0);
    assert_eq!(DTOR_RUNS.load(Ordering::SeqCst), 1);

    // Every client observes its connection going away.
    for client in clients {
        let mut c = client;
        c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut sink = [0u8; 64];
        loop {
            match c.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) => panic!("expected EOF after destroy, got {}", err),
            }
        }
    }
}
