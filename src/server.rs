//! The listening side: `Acceptor` wraps the bind/listen/accept socket as a
//! single read-interest channel, and `TcpServer` wires its accepted
//! connections to a `LoopThreadPool` and a connection registry. Grounded on
//! muduo's `Acceptor` / `TcpServer`; specified here only at the interfaces
//! it crosses into the core (`EventLoop`, `TcpConnection`, `LoopHandle`).

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::channel::ChannelHandle;
use crate::config::Config;
use crate::event_loop::LoopHandle;
use crate::loop_thread::{LoopThreadPool, ThreadInitCallback};
use crate::net::{InetAddress, Socket};
use crate::tcp_connection::{TcpConnection, TcpConnectionPtr};

type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddress) + Send>;

/// Wraps the listening socket as a single channel. Kept separate from
/// `TcpServer` the way the original keeps it a distinct collaborator: binding
/// and accepting are the only OS-facing concerns here, connection lifecycle
/// is someone else's problem.
pub struct Acceptor {
    socket: Socket,
    channel: ChannelHandle,
    /// A pre-opened spare fd, closed and reopened around an `accept` done
    /// purely to drop a connection when `accept4` fails with `EMFILE`, so
    /// the acceptor's own listening channel is never starved out of
    /// level-triggered readiness by fd exhaustion.
    idle_fd: Mutex<i32>,
    listening: Mutex<bool>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(loop_handle: LoopHandle, listen_addr: InetAddress, reuse_port: bool) -> std::io::Result<Arc<Acceptor>> {
        let socket = Socket::new_tcp(listen_addr)?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(listen_addr)?;

        let idle_fd = syscall!(open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        ))?;

        let channel = ChannelHandle::new(loop_handle, socket.as_raw_fd());
        let acceptor = Arc::new(Acceptor {
            socket,
            channel,
            idle_fd: Mutex::new(idle_fd),
            listening: Mutex::new(false),
            new_connection_cb: Mutex::new(None),
        });

        let owner = Arc::clone(&acceptor);
        acceptor.channel.set_read_callback(move |_ts| owner.handle_read());

        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn listening(&self) -> bool {
        *self.listening.lock().unwrap()
    }

    pub fn listen(&self) -> std::io::Result<()> {
        *self.listening.lock().unwrap() = true;
        self.socket.listen(1024)?;
        self.channel.enable_reading();
        Ok(())
    }

    fn handle_read(&self) {
        loop {
            match self.socket.accept() {
                Ok((socket, peer_addr)) => {
                    if let Some(cb) = self.new_connection_cb.lock().unwrap().as_mut() {
                        cb(socket, peer_addr);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) => {
                    self.drop_one_pending_connection();
                    break;
                }
                Err(e) => {
                    log::error!("acceptor: accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn drop_one_pending_connection(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        let _ = syscall!(close(*idle));
        // Accepting onto the now-free fd slot and immediately dropping it
        // removes one connection from the kernel's backlog.
        if let Ok((_socket, _peer)) = self.socket.accept() {
            log::warn!("acceptor: too many open files, dropped one pending connection");
        }
        if let Ok(fd) = syscall!(open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC
        )) {
            *idle = fd;
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
        let idle = *self.idle_fd.lock().unwrap();
        let _ = syscall!(close(idle));
    }
}

struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water: Option<HighWaterMarkCallback>,
}

/// Accepts connections on `base_loop` and hands each one off to the next
/// loop in an internal `LoopThreadPool`, wiring up the user's four
/// callbacks and an internal close callback that removes the connection
/// from the registry. The registry itself — like the pool — is only ever
/// touched from the base loop's thread.
pub struct TcpServer {
    base_handle: LoopHandle,
    name: String,
    listen_addr: InetAddress,
    config: Config,
    acceptor: Arc<Acceptor>,
    pool: Mutex<LoopThreadPool>,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    next_conn_id: Mutex<u64>,
    callbacks: Mutex<Callbacks>,
    started: std::sync::atomic::AtomicBool,
}

impl TcpServer {
    pub fn new(
        base_handle: LoopHandle,
        listen_addr: InetAddress,
        name: impl Into<String>,
        reuse_port: bool,
        config: Config,
    ) -> std::io::Result<Arc<TcpServer>> {
        let name = name.into();
        let acceptor = Acceptor::new(base_handle.clone(), listen_addr, reuse_port)?;
        let pool = LoopThreadPool::new(base_handle.clone(), config);

        let server = Arc::new(TcpServer {
            base_handle,
            name,
            listen_addr,
            config,
            acceptor,
            pool: Mutex::new(pool),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: Mutex::new(1),
            callbacks: Mutex::new(Callbacks {
                connection: None,
                message: None,
                write_complete: None,
                high_water: None,
            }),
            started: std::sync::atomic::AtomicBool::new(false),
        });

        let owner = Arc::clone(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                owner.new_connection(socket, peer_addr)
            }));

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listen_addr(&self) -> InetAddress {
        self.listen_addr
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        self.callbacks.lock().unwrap().high_water = Some(cb);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.pool.lock().unwrap().set_thread_init_callback(cb);
    }

    /// Must be called before `start()`. `n == 0` keeps accepted connections
    /// on the base loop.
    pub fn set_thread_num(&self, n: usize) {
        self.pool.lock().unwrap().start(n);
    }

    /// Idempotent. Starts the (possibly already-started) loop pool, then
    /// posts the actual `listen()` call onto the base loop.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        let acceptor = Arc::clone(&self.acceptor);
        self.base_handle.run_in_loop(move || {
            if let Err(e) = acceptor.listen() {
                log::error!("server: listen failed: {e}");
            }
        });
    }

    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: InetAddress) {
        debug_assert!(self.base_handle.is_in_loop_thread());
        let io_handle = self.pool.lock().unwrap().next_loop();

        let conn_id = {
            let mut next = self.next_conn_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        let conn_name = format!("{}-{}#{}", self.name, self.listen_addr, conn_id);

        let local_addr = socket.local_addr().unwrap_or(self.listen_addr);
        log::debug!("server {}: new connection {conn_name} from {peer_addr}", self.name);

        let conn = TcpConnection::new(
            io_handle.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
            self.config.high_water_mark,
        );

        {
            let cbs = self.callbacks.lock().unwrap();
            if let Some(cb) = cbs.connection.clone() {
                conn.set_connection_callback(cb);
            }
            if let Some(cb) = cbs.message.clone() {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = cbs.write_complete.clone() {
                conn.set_write_complete_callback(cb);
            }
            if let Some(cb) = cbs.high_water.clone() {
                conn.set_high_water_mark_callback(cb);
            }
        }

        let owner = Arc::clone(self);
        let close_name = conn_name.clone();
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            let owner = Arc::clone(&owner);
            let conn = Arc::clone(conn);
            let name = close_name.clone();
            owner.base_handle.run_in_loop(move || owner.remove_connection(&name, &conn));
        }));

        self.connections.lock().unwrap().insert(conn_name, conn.clone());
        io_handle.run_in_loop(move || conn.connect_established());
    }

    fn remove_connection(self: &Arc<Self>, name: &str, conn: &TcpConnectionPtr) {
        debug_assert!(self.base_handle.is_in_loop_thread());
        self.connections.lock().unwrap().remove(name);
        let conn = Arc::clone(conn);
        let io_handle = conn.loop_handle();
        io_handle.run_in_loop(move || conn.connect_destroyed());
    }
}
