use std::time::Duration;

/// Tunable knobs so embedders are not stuck with the reference constants
/// baked into the original implementation. `Default` reproduces those
/// constants exactly.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Upper bound on how long a single `EventLoop::run` iteration blocks in
    /// `poll`, absent any readiness.
    pub poll_timeout: Duration,
    /// Initial capacity of a freshly constructed [`crate::Buffer`], not
    /// counting the 8-byte prepend region.
    pub initial_buffer_size: usize,
    /// Byte threshold at which [`crate::TcpConnection`] reports outbound
    /// backpressure via its high-water callback.
    pub high_water_mark: usize,
    /// First retry delay used by [`crate::Connector`] after a failed
    /// connect.
    pub initial_retry_delay: Duration,
    /// Upper bound the retry delay is clamped to after repeated doubling.
    pub max_retry_delay: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            poll_timeout: Duration::from_secs(10),
            initial_buffer_size: 1024,
            high_water_mark: 64 * 1024 * 1024,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}
