//! Owns every armed timer for one loop and the single `timerfd` used to
//! wake the loop when the earliest one is due. Grounded on muduo's
//! `TimerQueue`: a `timerfd_settime` reprogrammed to the next deadline
//! rather than one OS timer per `Timer`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::ChannelHandle;
use crate::event_loop::{LoopHandle, TimerId};
use crate::timer::Timer;
use crate::timestamp::Timestamp;

/// Matches muduo's floor on how far out a just-armed timerfd is allowed to
/// be scheduled, avoiding a zero or negative `itimerspec` which some
/// kernels treat as "disarm".
const MIN_INTERVAL: Duration = Duration::from_micros(100);

struct Inner {
    timerfd: RawFd,
    timers: HashMap<u64, Timer>,
    by_expiry: BTreeSet<(Timestamp, u64)>,
    canceling: HashSet<u64>,
    calling_expired: bool,
}

impl Inner {
    fn insert(&mut self, timer: Timer) {
        let earliest_changed = self
            .by_expiry
            .iter()
            .next()
            .map_or(true, |(expiry, _)| timer.expiration() < *expiry);

        self.by_expiry.insert((timer.expiration(), timer.sequence()));
        let when = timer.expiration();
        self.timers.insert(timer.sequence(), timer);

        if earliest_changed {
            self.reset_timerfd_at(when);
        }
    }

    fn cancel(&mut self, id: TimerId) {
        let seq = id.0;
        if self.calling_expired {
            self.canceling.insert(seq);
        }
        if let Some(timer) = self.timers.remove(&seq) {
            self.by_expiry.remove(&(timer.expiration(), seq));
        }
    }

    fn handle_read(&mut self, now: Timestamp) {
        self.drain_timerfd();

        let mut expired = self.pop_expired(now);
        self.calling_expired = true;
        self.canceling.clear();
        for timer in &mut expired {
            timer.run();
        }
        self.calling_expired = false;

        for mut timer in expired {
            let seq = timer.sequence();
            if timer.repeats() && !self.canceling.contains(&seq) {
                timer.restart(Timestamp::now());
                self.insert(timer);
            }
        }

        if let Some((next, _)) = self.by_expiry.iter().next().copied() {
            self.reset_timerfd_at(next);
        }
    }

    fn pop_expired(&mut self, now: Timestamp) -> Vec<Timer> {
        let due: Vec<(Timestamp, u64)> = self.by_expiry.range(..=(now, u64::MAX)).copied().collect();
        let mut expired = Vec::with_capacity(due.len());
        for key in due {
            self.by_expiry.remove(&key);
            if let Some(timer) = self.timers.remove(&key.1) {
                expired.push(timer);
            }
        }
        expired
    }

    fn drain_timerfd(&self) {
        let mut buf = [0u8; 8];
        let _ = syscall!(read(
            self.timerfd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ));
    }

    fn reset_timerfd_at(&self, when: Timestamp) {
        let delay = when.duration_since(Timestamp::now()).max(MIN_INTERVAL);
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as i64,
            },
        };
        if let Err(e) = syscall!(timerfd_settime(self.timerfd, 0, &spec, std::ptr::null_mut())) {
            log::error!("timerfd_settime failed: {e}");
        }
    }
}

pub(crate) struct TimerQueue {
    inner: Arc<Mutex<Inner>>,
    channel: ChannelHandle,
}

impl TimerQueue {
    pub(crate) fn new(loop_handle: LoopHandle) -> io::Result<TimerQueue> {
        let timerfd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        let inner = Arc::new(Mutex::new(Inner {
            timerfd,
            timers: HashMap::new(),
            by_expiry: BTreeSet::new(),
            canceling: HashSet::new(),
            calling_expired: false,
        }));

        let channel = ChannelHandle::new(loop_handle, timerfd);
        let read_inner = Arc::clone(&inner);
        channel.set_read_callback(move |receive_time| {
            read_inner.lock().unwrap().handle_read(receive_time);
        });
        channel.enable_reading();

        Ok(TimerQueue { inner, channel })
    }

    pub(crate) fn insert(&mut self, timer: Timer) {
        self.inner.lock().unwrap().insert(timer);
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        self.inner.lock().unwrap().cancel(id);
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
        let _ = syscall!(close(self.inner.lock().unwrap().timerfd));
    }
}
