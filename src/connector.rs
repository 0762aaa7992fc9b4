//! Non-blocking outbound `connect(2)` with exponential-backoff retry. Grounded
//! on muduo's `Connector`: a transient `Channel` that exists only while a
//! connect attempt is in flight, replaced by a fresh `TcpConnection` the
//! instant the attempt succeeds.

use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::ChannelHandle;
use crate::config::Config;
use crate::error::{classify_connect_errno, ConnectOutcome};
use crate::event_loop::LoopHandle;
use crate::net::{InetAddress, Socket};

/// Invoked once a non-blocking connect completes successfully, handing the
/// now-connected socket and its peer address to whoever owns the connector
/// (a `TcpClient`, in practice) so it can wrap it in a `TcpConnection`.
pub(crate) type NewConnectionCallback = Arc<dyn Fn(Socket, InetAddress) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    state: State,
    channel: Option<ChannelHandle>,
    socket: Option<Socket>,
    /// "Wants to connect" — distinct from `state` so that a `stop()` racing
    /// with an in-flight retry timer prevents the timer from reconnecting.
    connect: bool,
    retry_delay: Duration,
}

/// One outbound connection attempt, with retry. Lives behind an `Arc` so it
/// can be captured into the `Send` closures posted to its owning loop —
/// `start()`/`stop()` are meant to be called from any thread, same as the
/// `TcpClient` that owns it.
pub struct Connector {
    loop_handle: LoopHandle,
    server_addr: InetAddress,
    config: Config,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    inner: Mutex<Inner>,
}

impl Connector {
    pub fn new(loop_handle: LoopHandle, server_addr: InetAddress, config: Config) -> Connector {
        Connector {
            loop_handle,
            server_addr,
            config,
            new_connection_cb: Mutex::new(None),
            inner: Mutex::new(Inner {
                state: State::Disconnected,
                channel: None,
                socket: None,
                connect: false,
                retry_delay: config.initial_retry_delay,
            }),
        }
    }

    pub fn server_addr(&self) -> InetAddress {
        self.server_addr
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    fn set_state(&self, state: State) {
        self.inner.lock().unwrap().state = state;
    }

    /// Callable from any thread. Marks the connector as wanting a
    /// connection and posts the actual attempt onto the owning loop.
    pub fn start(self: &Arc<Self>) {
        self.inner.lock().unwrap().connect = true;
        let this = Arc::clone(self);
        self.loop_handle.run_in_loop(move || this.start_in_loop());
    }

    fn start_in_loop(self: &Arc<Self>) {
        debug_assert!(self.loop_handle.is_in_loop_thread());
        if !self.inner.lock().unwrap().connect {
            log::debug!("connector: do not connect to {}, stopped", self.server_addr);
            return;
        }
        self.connect_in_loop();
    }

    /// Resets backoff and intent, then starts over. Must be called from the
    /// loop thread — typically from within the `new_connection` callback
    /// path of a `TcpClient` reacting to a disconnect.
    pub fn restart(self: &Arc<Self>) {
        debug_assert!(self.loop_handle.is_in_loop_thread());
        self.set_state(State::Disconnected);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.connect = true;
            inner.retry_delay = self.config.initial_retry_delay;
        }
        self.start_in_loop();
    }

    /// Callable from any thread. Clears the intent flag and cancels any
    /// in-flight connect attempt.
    pub fn stop(self: &Arc<Self>) {
        self.inner.lock().unwrap().connect = false;
        let this = Arc::clone(self);
        self.loop_handle.run_in_loop(move || this.stop_in_loop());
    }

    fn stop_in_loop(self: &Arc<Self>) {
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            self.reset_channel();
            let socket = self.inner.lock().unwrap().socket.take();
            drop(socket);
        }
    }

    fn connect_in_loop(self: &Arc<Self>) {
        let socket = match Socket::new_tcp(self.server_addr) {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("connector: failed to create socket: {e}");
                return;
            }
        };
        match socket.connect(self.server_addr) {
            Ok(()) => self.connecting(socket),
            Err(e) => match classify_connect_errno(e.raw_os_error()) {
                ConnectOutcome::Proceed => self.connecting(socket),
                ConnectOutcome::Retry => {
                    log::warn!("connector: transient error connecting to {}: {e}", self.server_addr);
                    self.retry(socket);
                }
                ConnectOutcome::Fatal => {
                    log::error!("connector: fatal error connecting to {}: {e}", self.server_addr);
                    drop(socket);
                }
            },
        }
    }

    fn connecting(self: &Arc<Self>, socket: Socket) {
        self.set_state(State::Connecting);
        let channel = ChannelHandle::new(self.loop_handle.clone(), socket.as_raw_fd());

        let write_owner = Arc::clone(self);
        channel.set_write_callback(move || write_owner.handle_write());
        let error_owner = Arc::clone(self);
        channel.set_error_callback(move || error_owner.handle_error());
        channel.enable_writing();

        let mut inner = self.inner.lock().unwrap();
        inner.socket = Some(socket);
        inner.channel = Some(channel);
    }

    fn handle_write(self: &Arc<Self>) {
        if self.state() != State::Connecting {
            return;
        }
        let err = {
            let inner = self.inner.lock().unwrap();
            inner
                .socket
                .as_ref()
                .expect("connecting state implies a socket")
                .take_error()
        };
        match err {
            Err(e) => {
                log::warn!("connector: SO_ERROR read failed for {}: {e}", self.server_addr);
                self.retry_after_failure();
            }
            Ok(Some(errno)) => {
                log::warn!("connector: connect to {} failed, errno {errno}", self.server_addr);
                self.retry_after_failure();
            }
            Ok(None) => {
                let self_connect = {
                    let inner = self.inner.lock().unwrap();
                    let socket = inner.socket.as_ref().unwrap();
                    matches!((socket.local_addr(), socket.peer_addr()), (Ok(l), Ok(p)) if l == p)
                };
                if self_connect {
                    log::warn!("connector: self-connect detected on {}", self.server_addr);
                    self.retry_after_failure();
                    return;
                }
                self.reset_channel();
                let wants_connect = self.inner.lock().unwrap().connect;
                let socket = self.inner.lock().unwrap().socket.take();
                self.set_state(State::Connected);
                if let Some(socket) = socket {
                    if wants_connect {
                        let peer = socket.peer_addr().unwrap_or(self.server_addr);
                        if let Some(cb) = self.new_connection_cb.lock().unwrap().clone() {
                            cb(socket, peer);
                        }
                    } else {
                        // `stop()` raced with an in-flight successful connect; drop the
                        // socket instead of handing a live fd to the callback.
                        drop(socket);
                    }
                }
            }
        }
    }

    fn handle_error(self: &Arc<Self>) {
        if self.state() != State::Connecting {
            return;
        }
        log::warn!("connector: error event while connecting to {}", self.server_addr);
        self.retry_after_failure();
    }

    fn retry_after_failure(self: &Arc<Self>) {
        self.reset_channel();
        let socket = self.inner.lock().unwrap().socket.take();
        if let Some(socket) = socket {
            self.retry(socket);
        }
    }

    fn retry(self: &Arc<Self>, socket: Socket) {
        drop(socket);
        self.set_state(State::Disconnected);
        if self.inner.lock().unwrap().connect {
            let delay = self.inner.lock().unwrap().retry_delay;
            log::info!("connector: retrying {} in {delay:?}", self.server_addr);
            let this = Arc::clone(self);
            self.loop_handle.run_after(delay, move || this.start_in_loop());
            let mut inner = self.inner.lock().unwrap();
            inner.retry_delay = (inner.retry_delay * 2).min(self.config.max_retry_delay);
        } else {
            log::debug!("connector: not retrying {}, stopped", self.server_addr);
        }
    }

    fn reset_channel(&self) {
        let channel = self.inner.lock().unwrap().channel.take();
        if let Some(channel) = channel {
            channel.disable_all();
            channel.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = Config {
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            ..Config::default()
        };
        let mut delay = config.initial_retry_delay;
        let expected = [500, 1000, 2000, 4000, 8000, 16000, 30000, 30000];
        for want in expected {
            assert_eq!(delay.as_millis() as u64, want);
            delay = (delay * 2).min(config.max_retry_delay);
        }
    }
}
