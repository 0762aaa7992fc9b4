//! The per-thread reactor core: owns the [`crate::poller::Poller`], the
//! [`crate::timer_queue::TimerQueue`], and the cross-thread task queue that
//! lets other threads schedule work onto this loop's thread.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::channel::ChannelHandle;
use crate::config::Config;
use crate::current_loop;
use crate::error::{self, Result};
use crate::poller::Poller;
use crate::timer::Timer;
use crate::timer_queue::TimerQueue;
use crate::timestamp::Timestamp;

/// Opaque handle returned by `run_at`/`run_after`/`run_every`. Only
/// meaningful as an argument to `LoopHandle::cancel`.
///
/// The original implementation pairs a `Timer*` with a sequence number to
/// break ties between timers sharing an expiration; a bare heap address
/// has no safe, stable equivalent here, so identity and tie-break both ride
/// on this one process-wide monotonic counter instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

static NEXT_TIMER_SEQ: AtomicI64 = AtomicI64::new(0);

pub(crate) fn next_timer_seq() -> u64 {
    NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed) as u64
}

type Task = Box<dyn FnOnce() + Send>;

pub(crate) struct Shared {
    thread_id: ThreadId,
    wake_fd: RawFd,
    tasks: Mutex<VecDeque<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
    looping: AtomicBool,
}

/// A cheap, `Send + Sync` handle to an [`EventLoop`] living on some thread.
/// This is the only way code outside that thread may influence the loop:
/// post a task, arm a timer, or ask it to quit. Operations that touch the
/// loop's non-`Send` internals (the poller's channel table, the timer
/// queue) are only ever actually executed on the owning thread, whether
/// called from it directly or bounced there through the task queue.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            error::abort("operation is only valid on the loop's own thread");
        }
    }

    /// Runs `f` now if called from the loop's own thread, otherwise queues
    /// it and wakes the loop.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Always queues `f`, even from the loop's own thread, where it runs
    /// after the current `handle_event`/task dispatch pass finishes.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        let should_wake = {
            let mut tasks = self.shared.tasks.lock().unwrap();
            tasks.push_back(Box::new(f));
            !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire)
        };
        if should_wake {
            self.wake();
        }
    }

    pub fn wake(&self) {
        let one: u64 = 1;
        let _ = syscall!(write(
            self.shared.wake_fd,
            &one as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>()
        ));
    }

    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    pub(crate) fn update_channel(&self, channel: &ChannelHandle) {
        self.assert_in_loop_thread();
        current_loop::with_current(|lp| lp.poller.update_channel(channel));
    }

    pub(crate) fn remove_channel(&self, channel: &ChannelHandle) {
        self.assert_in_loop_thread();
        current_loop::with_current(|lp| lp.poller.remove_channel(channel));
    }

    pub(crate) fn has_channel(&self, channel: &ChannelHandle) -> bool {
        self.assert_in_loop_thread();
        current_loop::with_current(|lp| lp.poller.has_channel(channel))
    }

    /// Schedules `cb` to run at `when`, returning an id usable with
    /// `cancel`. The `Timer` is constructed here, immediately, so the id is
    /// valid the instant this call returns; insertion into the owning
    /// loop's timer queue is posted via `run_in_loop`.
    pub fn run_at(&self, when: Timestamp, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(when, None, cb)
    }

    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Timestamp::now().add(delay), None, cb)
    }

    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Timestamp::now().add(interval), Some(interval), cb)
    }

    fn schedule(
        &self,
        when: Timestamp,
        interval: Option<Duration>,
        cb: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let seq = next_timer_seq();
        let timer = Timer::new(seq, when, interval, cb);
        let id = TimerId(seq);
        self.run_in_loop(move || current_loop::with_current(|lp| lp.timer_queue.insert(timer)));
        id
    }

    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || current_loop::with_current(|lp| lp.timer_queue.cancel(id)));
    }
}

/// The reactor core itself. Not `Send`: constructed on, and run from,
/// exactly one thread, enforced by the thread-local slot in
/// [`crate::current_loop`].
pub struct EventLoop {
    handle: LoopHandle,
    poller: Poller,
    timer_queue: TimerQueue,
    wake_channel: ChannelHandle,
    active_channels: Vec<ChannelHandle>,
    config: Config,
}

impl EventLoop {
    pub fn new(config: Config) -> Result<Box<EventLoop>> {
        if current_loop::is_set() {
            error::abort("another EventLoop already exists on this thread");
        }

        let shared = Arc::new(Shared {
            thread_id: thread::current().id(),
            wake_fd: create_event_fd()?,
            tasks: Mutex::new(VecDeque::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
        });
        let handle = LoopHandle { shared };

        let poller = Poller::new()?;
        let wake_channel = ChannelHandle::new(handle.clone(), handle.shared.wake_fd);
        let timer_queue = TimerQueue::new(handle.clone())?;

        let wake_fd = handle.shared.wake_fd;
        let mut event_loop = Box::new(EventLoop {
            handle,
            poller,
            timer_queue,
            wake_channel,
            active_channels: Vec::new(),
            config,
        });

        event_loop.wake_channel.set_read_callback(move |_ts| {
            let mut buf = [0u8; 8];
            let _ = syscall!(read(
                wake_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len()
            ));
        });

        // `event_loop` is heap-allocated, so its address is stable across
        // the move that returns it from this constructor: registering the
        // thread-local pointer here (rather than only once `run` starts)
        // lets channels created before the first `run` call — an
        // `Acceptor`'s listening socket, for instance — register interest
        // immediately.
        current_loop::set_current(&mut *event_loop as *mut EventLoop);
        event_loop.wake_channel.enable_reading();
        Ok(event_loop)
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.handle.is_in_loop_thread()
    }

    /// Runs the reactor until `quit()` is called. Each iteration: block in
    /// `poll` up to the configured timeout, dispatch every channel that
    /// came back ready, then run whatever tasks have queued up meanwhile.
    pub fn run(&mut self) {
        self.handle.shared.looping.store(true, Ordering::Release);
        while !self.handle.shared.quit.load(Ordering::Acquire) {
            self.active_channels.clear();
            let poll_return = match self.poller.poll(self.config.poll_timeout, &mut self.active_channels) {
                Ok(ts) => ts,
                Err(e) => {
                    log::error!("poller error: {e}");
                    Timestamp::now()
                }
            };
            for channel in self.active_channels.clone() {
                channel.handle_event(poll_return);
            }
            self.do_pending_functors();
        }
        self.handle.shared.looping.store(false, Ordering::Release);
    }

    fn do_pending_functors(&mut self) {
        self.handle
            .shared
            .calling_pending
            .store(true, Ordering::Release);
        let pending: VecDeque<Task> = {
            let mut tasks = self.handle.shared.tasks.lock().unwrap();
            std::mem::take(&mut *tasks)
        };
        for task in pending {
            task();
        }
        self.handle
            .shared
            .calling_pending
            .store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wake_channel.disable_all();
        self.wake_channel.remove();
        let _ = syscall!(close(self.handle.shared.wake_fd));
        current_loop::clear_current();
    }
}

fn create_event_fd() -> Result<RawFd> {
    Ok(syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?)
}
