//! The connecting side: wires a [`Connector`] to the [`TcpConnection`] it
//! eventually produces, with an optional auto-reconnect policy. Grounded on
//! muduo's `TcpClient`; specified here only at the interfaces it crosses
//! into the core (`Connector`, `TcpConnection`, `EventLoop`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::config::Config;
use crate::connector::Connector;
use crate::event_loop::LoopHandle;
use crate::net::{InetAddress, Socket};
use crate::tcp_connection::{TcpConnection, TcpConnectionPtr};

struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water: Option<HighWaterMarkCallback>,
}

/// One outbound endpoint. Owns a [`Connector`] and, once it succeeds, the
/// resulting [`TcpConnection`]; on disconnect it either lets the connection
/// go or, if `enable_retry()` was called, restarts the connector.
pub struct TcpClient {
    loop_handle: LoopHandle,
    server_addr: InetAddress,
    name: String,
    config: Config,
    connector: Arc<Connector>,
    connection: Mutex<Option<TcpConnectionPtr>>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: Mutex<u64>,
    callbacks: Mutex<Callbacks>,
}

impl TcpClient {
    pub fn new(
        loop_handle: LoopHandle,
        server_addr: InetAddress,
        name: impl Into<String>,
        config: Config,
    ) -> Arc<TcpClient> {
        let connector = Arc::new(Connector::new(loop_handle.clone(), server_addr, config));
        let client = Arc::new(TcpClient {
            loop_handle,
            server_addr,
            name: name.into(),
            config,
            connector,
            connection: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: Mutex::new(1),
            callbacks: Mutex::new(Callbacks {
                connection: None,
                message: None,
                write_complete: None,
                high_water: None,
            }),
        });

        let owner = Arc::clone(&client);
        client
            .connector
            .set_new_connection_callback(Arc::new(move |socket, peer_addr| {
                owner.new_connection(socket, peer_addr)
            }));

        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> InetAddress {
        self.server_addr
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

    /// Turns on auto-reconnect: once a connection this client owns is lost,
    /// the connector restarts with a fresh backoff instead of sitting idle.
    /// Must be set before the first disconnect to take effect on it.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
    }

    /// Returns the current connection, if any has been established.
    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.connection.lock().unwrap().clone()
    }

    /// Starts the connector. Callable from any thread.
    pub fn connect(self: &Arc<Self>) {
        self.connect.store(true, Ordering::Release);
        log::info!("client {}: connecting to {}", self.name, self.server_addr);
        self.connector.start();
    }

    /// Stops wanting a connection: cancels any in-flight connect attempt
    /// and suppresses auto-reconnect, but does not touch an already
    /// established connection. Callable from any thread.
    pub fn disconnect(self: &Arc<Self>) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection() {
            conn.shutdown();
        }
    }

    /// Like `disconnect`, but also tears down the connector outright.
    pub fn stop(self: &Arc<Self>) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: InetAddress) {
        debug_assert!(self.loop_handle.is_in_loop_thread());

        if !self.connect.load(Ordering::Acquire) {
            log::debug!("client {}: connection arrived after stop(), discarding", self.name);
            return;
        }

        let conn_id = {
            let mut next = self.next_conn_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        let conn_name = format!("{}-{}#{}", self.name, self.server_addr, conn_id);
        let local_addr = socket.local_addr().unwrap_or(self.server_addr);

        log::debug!("client {}: connection {conn_name} established to {peer_addr}", self.name);

        let conn = TcpConnection::new(
            self.loop_handle.clone(),
            conn_name,
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
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            owner.remove_connection(conn)
        }));

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    /// Invoked (on the owning loop's thread, via the connection's internal
    /// close callback) once a connection this client owns has fully torn
    /// down. Matches against the stored connection by pointer identity so a
    /// stale close from a connection already superseded by a fresh connect
    /// is ignored — the same equality check the original asserts on.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        debug_assert!(self.loop_handle.is_in_loop_thread());
        {
            let mut slot = self.connection.lock().unwrap();
            if matches!(slot.as_ref(), Some(current) if Arc::ptr_eq(current, conn)) {
                *slot = None;
            }
        }
        let conn = Arc::clone(conn);
        let this = Arc::clone(self);
        self.loop_handle.queue_in_loop(move || {
            conn.connect_destroyed();
            if this.retry.load(Ordering::Acquire) && this.connect.load(Ordering::Acquire) {
                this.connector.restart();
            }
        });
    }
}
