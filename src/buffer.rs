//! A growable byte buffer with a reserved prepend region, modeled after the
//! classic `muduo::Buffer`: a `vec![prepend | readable | writable]` layout
//! that lets a single read syscall size itself against an extension buffer
//! on the stack rather than a buffer pre-sized for the largest expected
//! message.

use std::io::{self, IoSliceMut, Read, Write};
use std::os::unix::io::RawFd;

/// Bytes reserved at the front of every buffer for a caller that wants to
/// prepend a header after the fact (e.g. a length prefix computed once the
/// payload is known).
pub const PREPEND_SIZE: usize = 8;

/// Size of the stack-resident extension buffer used by [`Buffer::read_from_fd`]
/// to bound the amount of memory a single readiness event can force the
/// buffer to grow by.
const EXTRA_BUF_SIZE: usize = 65536;

/// `0 <= prepend <= read_index <= write_index <= storage.len()`.
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(1024)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            storage: vec![0u8; PREPEND_SIZE + initial_size],
            read_index: PREPEND_SIZE,
            write_index: PREPEND_SIZE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// A view over the currently readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    /// Advances the read index by `n`. Resets both indices to the prepend
    /// boundary when `n` consumes everything readable, so a long-lived
    /// buffer doesn't slowly migrate its readable region to the end of
    /// `storage` and force spurious compactions.
    pub fn retrieve(&mut self, n: usize) {
        if n < self.readable_bytes() {
            self.read_index += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = PREPEND_SIZE;
        self.write_index = PREPEND_SIZE;
    }

    /// Consumes and returns the entire readable region as an owned buffer.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    fn begin_write_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.write_index..]
    }

    /// Ensures at least `n` writable bytes, compacting in place when the
    /// combined writable-plus-prependable space already covers the request,
    /// reallocating only when it doesn't.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
    }

    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + PREPEND_SIZE {
            self.storage.resize(self.write_index + n, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.read_index..self.write_index, PREPEND_SIZE);
            self.read_index = PREPEND_SIZE;
            self.write_index = self.read_index + readable;
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.begin_write_mut()[..data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Scatter-reads from `fd` into the writable tail and, if that's not
    /// enough, a 64 KiB buffer on the stack; anything landing in the
    /// extension buffer is then appended, growing `storage` at most once
    /// per call. Returns `Ok(0)` on orderly peer close, propagates
    /// `WouldBlock` and other I/O errors untouched.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut file = ManuallyDroppedFd(fd);
        let n = if writable < EXTRA_BUF_SIZE {
            let mut slices = [
                IoSliceMut::new(self.begin_write_mut()),
                IoSliceMut::new(&mut extra),
            ];
            (&mut file).read_vectored(&mut slices)?
        } else {
            (&mut file).read(self.begin_write_mut())?
        };

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes as much of the readable region as the kernel will take in one
    /// `write(2)` call. The caller retrieves the consumed bytes afterward;
    /// this mirrors the split between "how much went out" and "forget it"
    /// that the write-readiness state machine in [`crate::TcpConnection`]
    /// relies on.
    pub fn write_to_fd(&self, fd: RawFd) -> io::Result<usize> {
        let mut file = ManuallyDroppedFd(fd);
        file.write(self.peek())
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

/// A `Read`/`Write` adapter over a borrowed fd that does not close it on
/// drop — `Buffer` never owns the sockets it reads from or writes to.
struct ManuallyDroppedFd(RawFd);

impl Read for ManuallyDroppedFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        syscall!(read(
            self.0,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ))
        .map(|n| n as usize)
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        syscall!(readv(
            self.0,
            bufs.as_ptr() as *const libc::iovec,
            bufs.len() as libc::c_int,
        ))
        .map(|n| n as usize)
    }
}

impl Write for ManuallyDroppedFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        syscall!(write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()))
            .map(|n| n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_with_reserved_prepend() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);
        assert_eq!(buf.writable_bytes(), 1024);
    }

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.peek(), b"hello world");
        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        buf.retrieve(buf.readable_bytes());
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);
    }

    #[test]
    fn retrieve_all_resets_to_prepend_boundary() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        let out = buf.retrieve_all_as_bytes();
        assert_eq!(out, b"abc");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);
    }

    #[test]
    fn compaction_reclaims_eroded_prepend_space() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[0u8; 10]);
        buf.retrieve(10);
        // readable is now empty but read_index has drifted; appending
        // something that fits in total space should compact, not grow.
        let cap_before = buf.storage.len();
        buf.append(&[1u8; 8]);
        assert_eq!(buf.storage.len(), cap_before);
        assert_eq!(buf.peek(), &[1u8; 8]);
    }

    #[test]
    fn ensure_writable_grows_when_compaction_is_not_enough() {
        let mut buf = Buffer::with_capacity(4);
        buf.append(&[0u8; 4]);
        buf.retrieve(2);
        let cap_before = buf.storage.len();
        buf.append(&[1u8; 100]);
        assert!(buf.storage.len() >= cap_before);
        assert_eq!(buf.readable_bytes(), 102);
    }
}
