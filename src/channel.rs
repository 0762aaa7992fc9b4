//! `Channel` binds one file descriptor's readiness events to the callbacks
//! that should run when they fire. It owns no fd: creation and closing
//! belong to whoever constructs the channel (a `Socket`, a timerfd, an
//! eventfd). A `Channel` is always reached through a [`ChannelHandle`],
//! since mutating its interest set requires telling the owning loop's
//! poller about the change.
//!
//! Channels back objects — `TcpConnection`, `Connector` — that are
//! constructed on one thread (e.g. the base loop accepting a connection)
//! and hand themselves off to a different loop's thread to live out the
//! rest of their life. That handoff needs `Send`, and a `Send` type with
//! interior mutability needs `Sync` too (`Arc<T>: Send` requires
//! `T: Send + Sync`), so the handle is an `Arc<Mutex<..>>` rather than the
//! `Rc<RefCell<..>>` a purely single-threaded design would use. In
//! practice the mutex is never contended: thread affinity means only the
//! owning loop's thread ever locks it once the handoff is complete.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use crate::event_loop::LoopHandle;
use crate::timestamp::Timestamp;

pub(crate) const READ_EVENTS: i32 = libc::EPOLLIN | libc::EPOLLPRI;
pub(crate) const WRITE_EVENTS: i32 = libc::EPOLLOUT;
const NONE_EVENTS: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    /// Never registered with the poller.
    New,
    /// Currently registered.
    Added,
    /// Was registered, temporarily taken out (interest set to none).
    Deleted,
}

type ReadCallback = Box<dyn FnMut(Timestamp) + Send>;
type WriteCallback = Box<dyn FnMut() + Send>;
type CloseCallback = Box<dyn FnMut() + Send>;
type ErrorCallback = Box<dyn FnMut() + Send>;

pub(crate) struct Channel {
    fd: RawFd,
    events: i32,
    revents: i32,
    state: ChannelState,
    read_callback: Option<ReadCallback>,
    write_callback: Option<WriteCallback>,
    close_callback: Option<CloseCallback>,
    error_callback: Option<ErrorCallback>,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    event_handling: bool,
    loop_handle: LoopHandle,
}

/// Shared handle to a [`Channel`]. Cloning is cheap (an `Arc` bump); the
/// poller's channel table holds a [`Weak`] clone so it never keeps a
/// channel's owner alive past its own last strong reference.
#[derive(Clone)]
pub struct ChannelHandle(Arc<Mutex<Channel>>);

impl ChannelHandle {
    pub(crate) fn new(loop_handle: LoopHandle, fd: RawFd) -> ChannelHandle {
        ChannelHandle(Arc::new(Mutex::new(Channel {
            fd,
            events: NONE_EVENTS,
            revents: NONE_EVENTS,
            state: ChannelState::New,
            read_callback: None,
            write_callback: None,
            close_callback: None,
            error_callback: None,
            tie: None,
            event_handling: false,
            loop_handle,
        })))
    }

    pub(crate) fn downgrade(&self) -> Weak<Mutex<Channel>> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn from_weak(weak: &Weak<Mutex<Channel>>) -> Option<ChannelHandle> {
        weak.upgrade().map(ChannelHandle)
    }

    pub fn fd(&self) -> RawFd {
        self.0.lock().unwrap().fd
    }

    pub(crate) fn events(&self) -> i32 {
        self.0.lock().unwrap().events
    }

    pub(crate) fn set_revents(&self, revents: i32) {
        self.0.lock().unwrap().revents = revents;
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.0.lock().unwrap().state
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.0.lock().unwrap().state = state;
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + Send + 'static) {
        self.0.lock().unwrap().read_callback = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.0.lock().unwrap().write_callback = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.0.lock().unwrap().close_callback = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.0.lock().unwrap().error_callback = Some(Box::new(cb));
    }

    /// Ties this channel's lifetime guarantee to `owner`: during
    /// `handle_event`, `owner` is promoted from weak to strong for the
    /// duration of the dispatch, so a callback that drops the last other
    /// reference to `owner` cannot cause it to be deallocated mid-dispatch.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        self.0.lock().unwrap().tie = Some(Arc::downgrade(owner));
    }

    pub fn enable_reading(&self) {
        self.update_events(|e| e | READ_EVENTS);
    }

    pub fn disable_reading(&self) {
        self.update_events(|e| e & !READ_EVENTS);
    }

    pub fn enable_writing(&self) {
        self.update_events(|e| e | WRITE_EVENTS);
    }

    pub fn disable_writing(&self) {
        self.update_events(|e| e & !WRITE_EVENTS);
    }

    pub fn disable_all(&self) {
        self.update_events(|_| NONE_EVENTS);
    }

    pub fn is_writing(&self) -> bool {
        self.0.lock().unwrap().events & WRITE_EVENTS != 0
    }

    pub fn is_reading(&self) -> bool {
        self.0.lock().unwrap().events & READ_EVENTS != 0
    }

    pub fn is_none_event(&self) -> bool {
        self.0.lock().unwrap().events == NONE_EVENTS
    }

    fn update_events(&self, f: impl FnOnce(i32) -> i32) {
        let loop_handle = {
            let mut ch = self.0.lock().unwrap();
            ch.events = f(ch.events);
            ch.loop_handle.clone()
        };
        loop_handle.update_channel(self);
    }

    /// Removes this channel from its loop's poller. The channel must have
    /// no pending interest; the caller is expected to have disabled all
    /// events first.
    pub fn remove(&self) {
        let loop_handle = self.0.lock().unwrap().loop_handle.clone();
        loop_handle.remove_channel(self);
    }

    /// Invoked by the poller for every channel returned ready by the last
    /// `poll`. Dispatches in close/error/read/write precedence, matching
    /// `Channel::handleEvent` in the original.
    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let tie = self.0.lock().unwrap().tie.clone();
        let tie_guard = tie.as_ref().and_then(Weak::upgrade);
        if tie.is_some() && tie_guard.is_none() {
            // Owner already gone; silently drop the event.
            return;
        }
        self.dispatch(receive_time);
    }

    /// Runs one callback without holding the channel's lock across the
    /// call, so a callback that turns around and calls back into this
    /// channel (`enable_writing`, `disable_all`, ...) doesn't deadlock on
    /// its own mutex.
    fn invoke_read(&self, receive_time: Timestamp) {
        let mut cb = self.0.lock().unwrap().read_callback.take();
        if let Some(f) = cb.as_mut() {
            f(receive_time);
        }
        if cb.is_some() {
            self.0.lock().unwrap().read_callback = cb;
        }
    }

    fn invoke_write(&self) {
        let mut cb = self.0.lock().unwrap().write_callback.take();
        if let Some(f) = cb.as_mut() {
            f();
        }
        if cb.is_some() {
            self.0.lock().unwrap().write_callback = cb;
        }
    }

    fn invoke_close(&self) {
        let mut cb = self.0.lock().unwrap().close_callback.take();
        if let Some(f) = cb.as_mut() {
            f();
        }
        if cb.is_some() {
            self.0.lock().unwrap().close_callback = cb;
        }
    }

    fn invoke_error(&self) {
        let mut cb = self.0.lock().unwrap().error_callback.take();
        if let Some(f) = cb.as_mut() {
            f();
        }
        if cb.is_some() {
            self.0.lock().unwrap().error_callback = cb;
        }
    }

    fn dispatch(&self, receive_time: Timestamp) {
        {
            let mut ch = self.0.lock().unwrap();
            if ch.event_handling {
                return;
            }
            ch.event_handling = true;
        }

        let revents = self.0.lock().unwrap().revents;

        if revents & libc::EPOLLHUP != 0 && revents & libc::EPOLLIN == 0 {
            self.invoke_close();
        }
        if revents & libc::EPOLLERR != 0 {
            self.invoke_error();
        }
        if revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) != 0 {
            self.invoke_read(receive_time);
        }
        if revents & libc::EPOLLOUT != 0 {
            self.invoke_write();
        }

        self.0.lock().unwrap().event_handling = false;
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
