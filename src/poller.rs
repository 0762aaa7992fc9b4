//! An `epoll`-backed readiness poller. Mirrors the shape of
//! `mio::sys::unix::selector::epoll::Selector`: an owned epoll fd, a
//! reusable event buffer, and a table mapping each registered fd back to
//! the [`ChannelHandle`] that should receive its readiness.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use crate::channel::{Channel, ChannelHandle, ChannelState};
use crate::timestamp::Timestamp;

const EVENT_BUFFER_SIZE: usize = 16;

pub(crate) struct Poller {
    epoll_fd: RawFd,
    channels: HashMap<RawFd, Weak<Mutex<Channel>>>,
    event_buffer: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let epoll_fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Poller {
            epoll_fd,
            channels: HashMap::new(),
            event_buffer: vec![unsafe { std::mem::zeroed() }; EVENT_BUFFER_SIZE],
        })
    }

    /// Blocks for up to `timeout`, filling `active_channels` with every
    /// channel whose registered interest came back ready. Returns the
    /// timestamp at which `epoll_wait` returned, used as the receive time
    /// for read callbacks fired in this pass.
    pub(crate) fn poll(
        &mut self,
        timeout: Duration,
        active_channels: &mut Vec<ChannelHandle>,
    ) -> io::Result<Timestamp> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let n = loop {
            match syscall!(epoll_wait(
                self.epoll_fd,
                self.event_buffer.as_mut_ptr(),
                self.event_buffer.len() as i32,
                timeout_ms,
            )) {
                Ok(n) => break n as usize,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        let receive_time = Timestamp::now();

        let mut stale = Vec::new();
        for event in &self.event_buffer[..n] {
            let fd = event.u64 as RawFd;
            match self.channels.get(&fd).and_then(ChannelHandle::from_weak) {
                Some(handle) => {
                    handle.set_revents(event.events as i32);
                    active_channels.push(handle);
                }
                None => stale.push(fd),
            }
        }
        for fd in stale {
            self.channels.remove(&fd);
        }

        if n == self.event_buffer.len() && self.event_buffer.len() < 4096 {
            self.event_buffer.resize(self.event_buffer.len() * 2, unsafe { std::mem::zeroed() });
        }

        Ok(receive_time)
    }

    pub(crate) fn update_channel(&mut self, channel: &ChannelHandle) {
        let fd = channel.fd();
        match channel.state() {
            ChannelState::New | ChannelState::Deleted => {
                if channel.is_none_event() {
                    channel.set_state(ChannelState::Deleted);
                    return;
                }
                self.ctl(libc::EPOLL_CTL_ADD, channel);
                self.channels.insert(fd, channel.downgrade());
                channel.set_state(ChannelState::Added);
            }
            ChannelState::Added => {
                if channel.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_state(ChannelState::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    pub(crate) fn remove_channel(&mut self, channel: &ChannelHandle) {
        let fd = channel.fd();
        debug_assert!(channel.is_none_event());
        if channel.state() == ChannelState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        self.channels.remove(&fd);
        channel.set_state(ChannelState::New);
    }

    pub(crate) fn has_channel(&self, channel: &ChannelHandle) -> bool {
        self.channels.contains_key(&channel.fd())
    }

    fn ctl(&mut self, op: libc::c_int, channel: &ChannelHandle) {
        let mut event = libc::epoll_event {
            events: channel.events() as u32,
            u64: channel.fd() as u64,
        };
        if let Err(e) = syscall!(epoll_ctl(self.epoll_fd, op, channel.fd(), &mut event)) {
            log::error!("epoll_ctl({op}) failed for fd {}: {e}", channel.fd());
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = syscall!(close(self.epoll_fd));
    }
}
