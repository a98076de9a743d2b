use std::num::NonZeroUsize;
use std::thread;

/// Tunables of a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Config {
    /// How many jobs may run in parallel.
    pub workers: NonZeroUsize,
    /// At most this many values are kept per frame after a run.
    pub frame_cache_capacity: Option<usize>,
    /// Evaluate visualizations against cached values as soon as they are
    /// attached or modified.
    pub visualize_on_attach: bool,
}

impl Config {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = NonZeroUsize::new(workers).unwrap_or(NonZeroUsize::MIN);
        self
    }

    pub fn with_frame_cache_capacity(mut self, capacity: usize) -> Self {
        self.frame_cache_capacity = Some(capacity);
        self
    }

    pub fn with_visualize_on_attach(mut self, enabled: bool) -> Self {
        self.visualize_on_attach = enabled;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            frame_cache_capacity: None,
            visualize_on_attach: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_workers_means_one() {
        assert_eq!(Config::default().with_workers(0).workers.get(), 1);
        assert_eq!(Config::default().with_workers(3).workers.get(), 3);
    }
}
