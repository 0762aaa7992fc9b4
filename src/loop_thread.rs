//! Spawns worker threads that each construct and run exactly one
//! [`EventLoop`], and the fixed-size pool that round-robins accepted
//! connections across them. Grounded on muduo's `EventLoopThread` /
//! `EventLoopThreadPool`.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::Config;
use crate::event_loop::{EventLoop, LoopHandle};

/// A callback run once on a worker thread, immediately after its
/// `EventLoop` is constructed but before it starts looping — useful for
/// per-thread setup (e.g. registering thread-local diagnostics).
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

struct Published {
    handle: Mutex<Option<LoopHandle>>,
    ready: Condvar,
}

/// Owns one worker thread running one `EventLoop`. Dropping it quits the
/// loop and joins the thread.
pub struct LoopThread {
    join: Option<JoinHandle<()>>,
    handle: LoopHandle,
}

impl LoopThread {
    /// Spawns the worker and blocks until it has constructed its loop and
    /// published the handle back here.
    pub fn start(config: Config, init: Option<ThreadInitCallback>) -> LoopThread {
        let published = Arc::new(Published {
            handle: Mutex::new(None),
            ready: Condvar::new(),
        });

        let thread_published = Arc::clone(&published);
        let join = thread::spawn(move || {
            let mut event_loop = EventLoop::new(config).expect("failed to construct EventLoop");
            let handle = event_loop.handle();
            if let Some(init) = &init {
                init(&handle);
            }
            {
                let mut slot = thread_published.handle.lock().unwrap();
                *slot = Some(handle);
                thread_published.ready.notify_one();
            }
            event_loop.run();
        });

        let handle = {
            let mut slot = published.handle.lock().unwrap();
            while slot.is_none() {
                slot = published.ready.wait(slot).unwrap();
            }
            slot.clone().unwrap()
        };

        LoopThread {
            join: Some(join),
            handle,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// A fixed pool of `LoopThread`s, handing out loops in round-robin order.
/// `num_threads == 0` means single-threaded: `next_loop()` always returns
/// the base loop passed at construction.
pub struct LoopThreadPool {
    base_handle: LoopHandle,
    config: Config,
    init: Option<ThreadInitCallback>,
    threads: Vec<LoopThread>,
    next: std::sync::atomic::AtomicUsize,
    started: std::sync::atomic::AtomicBool,
}

impl LoopThreadPool {
    pub fn new(base_handle: LoopHandle, config: Config) -> LoopThreadPool {
        LoopThreadPool {
            base_handle,
            config,
            init: None,
            threads: Vec::new(),
            next: std::sync::atomic::AtomicUsize::new(0),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_thread_init_callback(&mut self, cb: ThreadInitCallback) {
        self.init = Some(cb);
    }

    /// Spawns `num_threads` workers. Idempotent: a second call is a no-op.
    /// Must be called before any connection is routed through `next_loop`.
    pub fn start(&mut self, num_threads: usize) {
        if self.started.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        for i in 0..num_threads {
            let init = self.init.clone();
            let thread = LoopThread::start(self.config, init);
            log::debug!("loop thread pool: started worker {i}");
            self.threads.push(thread);
        }
    }

    /// Returns the next loop in round-robin order, or the base loop if the
    /// pool has no worker threads.
    pub fn next_loop(&self) -> LoopHandle {
        if self.threads.is_empty() {
            return self.base_handle.clone();
        }
        let i = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.threads.len();
        self.threads[i].handle()
    }

    /// Every loop in the pool, including the base loop — used to fan a
    /// thread-init callback out after the fact, or for diagnostics.
    pub fn get_all_loops(&self) -> Vec<LoopHandle> {
        if self.threads.is_empty() {
            vec![self.base_handle.clone()]
        } else {
            self.threads.iter().map(LoopThread::handle).collect()
        }
    }
}
