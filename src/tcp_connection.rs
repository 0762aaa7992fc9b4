//! The per-connection state machine: buffered, non-blocking I/O over one
//! accepted or connected socket, with high-water-mark backpressure and
//! half-close support. Grounded on muduo's `TcpConnection`.
//!
//! A connection is constructed on whichever thread is choosing its target
//! subloop (the base loop, for an accepted connection; the caller of
//! `TcpClient::connect`, for an outbound one) and is handed off via
//! `run_in_loop` to live out the rest of its life on that subloop's thread.
//! Everything past construction therefore needs `Send`; see the module
//! comment on [`crate::channel`] for why that makes this an `Arc<Mutex<..>>`
//! rather than an `Rc<RefCell<..>>` despite being thread-affine in practice.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::channel::ChannelHandle;
use crate::event_loop::LoopHandle;
use crate::net::{InetAddress, Socket};
use crate::timestamp::Timestamp;

/// Shared handle to a [`TcpConnection`]. Cloning bumps a refcount; this is
/// the type threaded through every user callback.
pub type TcpConnectionPtr = Arc<TcpConnection>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

/// Output-path state guarded by one mutex: the channel and the output
/// buffer are always touched together by the send/write-readiness state
/// machine, so splitting them into separate locks would buy nothing.
struct Io {
    channel: ChannelHandle,
    output_buffer: Buffer,
}

struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    name: String,
    loop_handle: LoopHandle,
    socket: Socket,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    high_water_mark: usize,
    state: AtomicU8,
    input_buffer: Mutex<Buffer>,
    io: Mutex<Io>,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    /// Constructs a connection in `Connecting` state, wrapping `socket`. The
    /// channel is created here but not yet registered with any poller —
    /// that happens in `connect_established`, once this value has been
    /// handed off to its owning loop's thread via `run_in_loop`.
    pub fn new(
        loop_handle: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
        high_water_mark: usize,
    ) -> TcpConnectionPtr {
        let fd = socket.as_raw_fd();
        let channel = ChannelHandle::new(loop_handle.clone(), fd);
        let _ = socket.set_keep_alive(true);
        let _ = socket.set_tcp_no_delay(true);

        Arc::new(TcpConnection {
            name,
            loop_handle,
            socket,
            local_addr,
            peer_addr,
            high_water_mark,
            state: AtomicU8::new(State::Connecting as u8),
            input_buffer: Mutex::new(Buffer::new()),
            io: Mutex::new(Io {
                channel,
                output_buffer: Buffer::new(),
            }),
            callbacks: Mutex::new(Callbacks {
                connection: None,
                message: None,
                write_complete: None,
                high_water: None,
                close: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub(crate) fn loop_handle(&self) -> LoopHandle {
        self.loop_handle.clone()
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
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

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    /// Installs the channel's four callbacks, ties the channel's lifetime
    /// to this connection, enables read interest and transitions to
    /// `Connected`. Must run on the owning loop's thread — the caller is
    /// expected to have arrived here via `run_in_loop`.
    pub(crate) fn connect_established(self: &TcpConnectionPtr) {
        debug_assert!(self.loop_handle.is_in_loop_thread());
        debug_assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);

        let owner: Arc<dyn std::any::Any + Send + Sync> = Arc::clone(self) as _;
        let channel = self.io.lock().unwrap().channel.clone();
        channel.tie(&owner);

        let read_owner = Arc::clone(self);
        channel.set_read_callback(move |ts| read_owner.handle_read(ts));
        let write_owner = Arc::clone(self);
        channel.set_write_callback(move || write_owner.handle_write());
        let close_owner = Arc::clone(self);
        channel.set_close_callback(move || close_owner.handle_close());
        let error_owner = Arc::clone(self);
        channel.set_error_callback(move || error_owner.handle_error());

        channel.enable_reading();

        log::debug!("connection {} established, {} -> {}", self.name, self.local_addr, self.peer_addr);
        if let Some(cb) = self.callbacks.lock().unwrap().connection.clone() {
            cb(self);
        }
    }

    /// Invoked by the connection's owner (server registry, client) when
    /// it's being torn down directly rather than via a peer-driven close.
    pub(crate) fn connect_destroyed(self: &TcpConnectionPtr) {
        debug_assert!(self.loop_handle.is_in_loop_thread());
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.io.lock().unwrap().channel.disable_all();
            if let Some(cb) = self.callbacks.lock().unwrap().connection.clone() {
                cb(self);
            }
        }
        self.io.lock().unwrap().channel.remove();
    }

    fn handle_read(self: &TcpConnectionPtr, receive_time: Timestamp) {
        let mut guard = self.input_buffer.lock().unwrap();
        match guard.read_from_fd(self.fd()) {
            Ok(0) => {
                drop(guard);
                self.handle_close();
            }
            Ok(_n) => {
                let message_cb = self.callbacks.lock().unwrap().message.clone();
                if let Some(cb) = message_cb {
                    cb(self, &mut guard, receive_time);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(guard);
                log::error!("connection {}: read error: {e}", self.name);
                self.handle_error();
                self.handle_close();
            }
        }
    }

    /// Writes `data` to the peer. Callable from any thread: off the owning
    /// loop's thread, the bytes are copied and the actual send is queued.
    pub fn send(self: &TcpConnectionPtr, data: &[u8]) {
        if self.loop_handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let this = Arc::clone(self);
            self.loop_handle.queue_in_loop(move || this.send_in_loop(&owned));
        }
    }

    fn send_in_loop(self: &TcpConnectionPtr, data: &[u8]) {
        if self.state() == State::Disconnected {
            log::warn!("connection {}: give up writing, already disconnected", self.name);
            return;
        }

        let mut io = self.io.lock().unwrap();
        let mut wrote = 0usize;
        let mut fault = false;

        if !io.channel.is_writing() && io.output_buffer.readable_bytes() == 0 {
            match write_now(self.fd(), data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == data.len() {
                        if let Some(cb) = self.callbacks.lock().unwrap().write_complete.clone() {
                            let this = Arc::clone(self);
                            self.loop_handle.queue_in_loop(move || cb(&this));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if is_broken_pipe(&e) => {
                    log::warn!("connection {}: write fault: {e}", self.name);
                    fault = true;
                }
                Err(e) => {
                    log::error!("connection {}: write error: {e}", self.name);
                }
            }
        }

        if !fault && wrote < data.len() {
            let remaining = &data[wrote..];
            let old_len = io.output_buffer.readable_bytes();
            let new_len = old_len + remaining.len();
            if old_len < self.high_water_mark && new_len >= self.high_water_mark {
                if let Some(cb) = self.callbacks.lock().unwrap().high_water.clone() {
                    let this = Arc::clone(self);
                    self.loop_handle.queue_in_loop(move || cb(&this, new_len));
                }
            }
            io.output_buffer.append(remaining);
            if !io.channel.is_writing() {
                io.channel.enable_writing();
            }
        }
    }

    fn handle_write(self: &TcpConnectionPtr) {
        let outcome = {
            let mut io = self.io.lock().unwrap();
            if !io.channel.is_writing() {
                return;
            }
            match io.output_buffer.write_to_fd(self.fd()) {
                Ok(n) => {
                    io.output_buffer.retrieve(n);
                    if io.output_buffer.readable_bytes() == 0 {
                        io.channel.disable_writing();
                        WriteOutcome::Drained
                    } else {
                        WriteOutcome::Partial
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => WriteOutcome::WouldBlock,
                Err(e) => {
                    log::error!("connection {}: write-readiness error: {e}", self.name);
                    WriteOutcome::WouldBlock
                }
            }
        };

        if outcome == WriteOutcome::Drained {
            if let Some(cb) = self.callbacks.lock().unwrap().write_complete.clone() {
                let this = Arc::clone(self);
                self.loop_handle.queue_in_loop(move || cb(&this));
            }
            if self.state() == State::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    /// Half-closes the write side once any pending output has drained.
    pub fn shutdown(self: &TcpConnectionPtr) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let this = Arc::clone(self);
            self.loop_handle.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(self: &TcpConnectionPtr) {
        let pending = {
            let io = self.io.lock().unwrap();
            io.channel.is_writing() || io.output_buffer.readable_bytes() > 0
        };
        if !pending {
            if let Err(e) = self.socket.shutdown_write() {
                log::warn!("connection {}: shutdown_write failed: {e}", self.name);
            }
        }
    }

    /// Tears the connection down immediately, skipping any drain.
    pub fn force_close(self: &TcpConnectionPtr) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let this = Arc::clone(self);
            self.loop_handle.queue_in_loop(move || this.handle_close());
        }
    }

    fn handle_error(self: &TcpConnectionPtr) {
        match self.socket.take_error() {
            Ok(Some(errno)) => log::error!("connection {}: socket error, errno {errno}", self.name),
            Ok(None) => {}
            Err(e) => log::error!("connection {}: SO_ERROR read failed: {e}", self.name),
        }
    }

    fn handle_close(self: &TcpConnectionPtr) {
        debug_assert!(matches!(self.state(), State::Connected | State::Disconnecting));
        self.set_state(State::Disconnected);
        self.io.lock().unwrap().channel.disable_all();

        // Keep ourselves alive through both callbacks even if the caller's
        // last other `Arc` clone is dropped by the connection callback.
        let guard: TcpConnectionPtr = Arc::clone(self);
        let (connection_cb, close_cb) = {
            let cbs = self.callbacks.lock().unwrap();
            (cbs.connection.clone(), cbs.close.clone())
        };
        if let Some(cb) = connection_cb {
            cb(&guard);
        }
        if let Some(cb) = close_cb {
            cb(&guard);
        }
    }
}

#[derive(PartialEq, Eq)]
enum WriteOutcome {
    Drained,
    Partial,
    WouldBlock,
}

fn write_now(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(fd, data.as_ptr() as *const libc::c_void, data.len()))?;
    Ok(n as usize)
}

fn is_broken_pipe(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET))
}
