//! A non-blocking TCP networking library built on the Reactor pattern.
//!
//! Servers and clients multiplex thousands of connections across a small,
//! fixed pool of I/O threads, one event loop per thread, each dispatching
//! readiness events to per-connection callbacks. See [`EventLoop`] for the
//! per-thread scheduler, [`TcpServer`]/[`TcpClient`] for the user-facing
//! surface, and [`TcpConnection`] for the connection state machine.
//!
//! Only Unix targets are supported: the core relies on `epoll`, `eventfd`
//! and `timerfd`.

#![cfg(unix)]

#[macro_use]
mod macros;

pub mod buffer;
mod channel;
pub mod config;
mod connector;
mod current_loop;
mod event_loop;
pub mod error;
mod loop_thread;
mod net;
mod poller;
mod server;
mod tcp_client;
mod tcp_connection;
mod timer;
mod timer_queue;
mod timestamp;

pub use buffer::Buffer;
pub use config::Config;
pub use connector::Connector;
pub use error::ReactorError;
pub use event_loop::{EventLoop, TimerId};
pub use loop_thread::{LoopThread, LoopThreadPool};
pub use net::{InetAddress, Socket};
pub use server::{Acceptor, TcpServer};
pub use tcp_client::TcpClient;
pub use tcp_connection::{TcpConnection, TcpConnectionPtr};
pub use timestamp::Timestamp;

/// Callback signatures shared by [`TcpServer`], [`TcpClient`] and
/// [`TcpConnection`].
pub mod callbacks {
    use crate::{tcp_connection::TcpConnectionPtr, Buffer, Timestamp};
    use std::sync::Arc;

    pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
    pub type MessageCallback =
        Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;
    pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
    pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
    pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
}
