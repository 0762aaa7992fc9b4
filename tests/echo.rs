//! End-to-end tests driving a real `TcpServer`/`TcpClient` pair over real
//! loopback sockets — no mocks, since the whole point of this crate is
//! observable non-blocking I/O behavior.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use std::sync::Mutex;

use reactor::{Config, InetAddress, LoopThread, TcpClient, TcpServer, TimerId};

fn free_loopback_addr() -> InetAddress {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    InetAddress::from(addr)
}

#[test]
fn echo_roundtrip() {
    let base = LoopThread::start(Config::default(), None);
    let addr = free_loopback_addr();
    let server = TcpServer::new(base.handle(), addr, "echo", false, Config::default()).unwrap();

    server.set_message_callback(Arc::new(|conn, buf, _receive_time| {
        let bytes = buf.retrieve_all_as_bytes();
        conn.send(&bytes);
    }));
    server.start();
    std::thread::sleep(Duration::from_millis(100));

    let mut stream = TcpStream::connect(addr.to_std()).unwrap();
    stream.write_all(b"ping\n").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping\n");
}

#[test]
fn half_close_drains_pending_output() {
    let base = LoopThread::start(Config::default(), None);
    let addr = free_loopback_addr();
    let server = TcpServer::new(base.handle(), addr, "drain", false, Config::default()).unwrap();

    const CHUNK: usize = 1024 * 1024;
    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            for _ in 0..3 {
                conn.send(&vec![b'x'; CHUNK]);
            }
            conn.shutdown();
        }
    }));
    server.start();
    std::thread::sleep(Duration::from_millis(100));

    let mut stream = TcpStream::connect(addr.to_std()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut total = 0usize;
    let mut buf = [0u8; 64 * 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(total, 3 * CHUNK);
}

#[test]
fn high_water_mark_fires_once_per_crossing() {
    let base = LoopThread::start(Config::default(), None);
    let addr = free_loopback_addr();
    let config = Config {
        high_water_mark: 256 * 1024,
        ..Config::default()
    };
    let server = TcpServer::new(base.handle(), addr, "hwm", false, config).unwrap();

    let (tx, rx) = mpsc::channel::<usize>();
    let fire_count = Arc::new(AtomicUsize::new(0));
    let fire_count2 = Arc::clone(&fire_count);
    server.set_high_water_mark_callback(Arc::new(move |_conn, pending| {
        fire_count2.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(pending);
    }));
    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            conn.send(&vec![0u8; 2 * 1024 * 1024]);
        }
    }));
    server.start();
    std::thread::sleep(Duration::from_millis(100));

    // Connect but never read: the peer's receive window fills up, forcing
    // the server's direct write to stall and the remainder into its output
    // buffer, crossing the high-water mark.
    let stream = TcpStream::connect(addr.to_std()).unwrap();

    let pending = rx.recv_timeout(Duration::from_secs(2)).expect("high-water callback never fired");
    assert!(pending >= 256 * 1024);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fire_count.load(Ordering::SeqCst), 1);

    drop(stream);
}

#[test]
fn client_reconnects_once_server_starts() {
    let addr = free_loopback_addr();

    let client_loop = LoopThread::start(Config::default(), None);
    let client_config = Config {
        initial_retry_delay: Duration::from_millis(80),
        max_retry_delay: Duration::from_millis(300),
        ..Config::default()
    };
    let client = TcpClient::new(client_loop.handle(), addr, "retry-client", client_config);

    let (tx, rx) = mpsc::channel::<()>();
    client.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            let _ = tx.send(());
        }
    }));
    client.enable_retry();
    client.connect();

    // Give the client a couple of failed attempts against a closed port
    // before the server ever starts listening.
    std::thread::sleep(Duration::from_millis(250));

    let server_loop = LoopThread::start(Config::default(), None);
    let server = TcpServer::new(server_loop.handle(), addr, "retry-server", false, Config::default()).unwrap();
    server.start();

    rx.recv_timeout(Duration::from_secs(2))
        .expect("client never established a connection after the server started");
}

#[test]
fn cross_thread_echo_many_clients() {
    let base = LoopThread::start(Config::default(), None);
    let addr = free_loopback_addr();
    let server = TcpServer::new(base.handle(), addr, "fanout", false, Config::default()).unwrap();
    server.set_message_callback(Arc::new(|conn, buf, _receive_time| {
        let bytes = buf.retrieve_all_as_bytes();
        conn.send(&bytes);
    }));
    server.set_thread_num(2);
    server.start();
    std::thread::sleep(Duration::from_millis(100));

    const CLIENTS: usize = 8;
    const MESSAGES: usize = 10;
    const MESSAGE_SIZE: usize = 4096;

    let handles: Vec<_> = (0..CLIENTS)
        .map(|_| {
            std::thread::spawn(move || {
                let mut stream = TcpStream::connect(addr.to_std()).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                let payload = vec![7u8; MESSAGE_SIZE];
                for _ in 0..MESSAGES {
                    stream.write_all(&payload).unwrap();
                    let mut received = 0;
                    let mut buf = [0u8; MESSAGE_SIZE];
                    while received < MESSAGE_SIZE {
                        let n = stream.read(&mut buf[received..]).unwrap();
                        assert!(n > 0, "connection closed early");
                        assert_eq!(&buf[received..received + n], &payload[received..received + n]);
                        received += n;
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("client thread panicked");
    }
}

#[test]
fn repeating_timer_cancelled_from_its_own_callback_stops_firing() {
    let base = LoopThread::start(Config::default(), None);
    let handle = base.handle();

    let count = Arc::new(AtomicUsize::new(0));
    let count2 = Arc::clone(&count);
    let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
    let slot2 = Arc::clone(&slot);
    let cancel_handle = handle.clone();

    let id = handle.run_every(Duration::from_millis(50), move || {
        let fired = count2.fetch_add(1, Ordering::SeqCst) + 1;
        if fired == 3 {
            if let Some(id) = *slot2.lock().unwrap() {
                cancel_handle.cancel(id);
            }
        }
    });
    *slot.lock().unwrap() = Some(id);

    // Give the timer well past three firings plus a quiet window to make
    // sure cancelling from inside the third callback actually stops the
    // fourth from being reinserted.
    std::thread::sleep(Duration::from_millis(500));

    assert_eq!(count.load(Ordering::SeqCst), 3);
}
