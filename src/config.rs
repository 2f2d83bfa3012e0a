//! # Execution pool configuration.
//!
//! ## Sentinel values
//! - `max_concurrent_loaders = 0` is clamped to 1; a pool always has a worker.

use std::num::NonZeroUsize;

/// Environment variable overriding [`PoolConfig::max_concurrent_loaders`].
pub const MAX_CONCURRENT_ENV: &str = "DICOM_LOADER_MAX_CONCURRENT";

pub const DEFAULT_MAX_CONCURRENT_LOADERS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads; loaders beyond this wait in the queue.
    ///
    /// With `1`, loaders start in submission order.
    pub max_concurrent_loaders: usize,

    /// Worker threads are named `<prefix>-<index>`.
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loaders: DEFAULT_MAX_CONCURRENT_LOADERS,
            thread_name_prefix: "series-loader".to_string(),
        }
    }
}

impl PoolConfig {
    /// Defaults, with [`MAX_CONCURRENT_ENV`] applied when it parses.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(MAX_CONCURRENT_ENV) {
            Ok(raw) => match raw.trim().parse::<usize>() {
                Ok(n) => config.with_max_concurrent_loaders(n),
                Err(_) => {
                    tracing::warn!(var = MAX_CONCURRENT_ENV, value = %raw, "config.ignored_invalid_value");
                    config
                }
            },
            Err(_) => config,
        }
    }

    pub fn with_max_concurrent_loaders(mut self, n: usize) -> Self {
        self.max_concurrent_loaders = n;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Worker count with the `0` sentinel resolved.
    #[inline]
    pub fn worker_count(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_concurrent_loaders).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workers_is_clamped() {
        let config = PoolConfig::default().with_max_concurrent_loaders(0);
        assert_eq!(config.worker_count().get(), 1);
        assert_eq!(PoolConfig::default().worker_count().get(), 3);
    }

    #[test]
    fn env_override_and_invalid_value() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var(MAX_CONCURRENT_ENV, " 7 ") };
        assert_eq!(PoolConfig::from_env().max_concurrent_loaders, 7);

        unsafe { std::env::set_var(MAX_CONCURRENT_ENV, "many") };
        assert_eq!(PoolConfig::from_env(), PoolConfig::default());

        unsafe { std::env::set_var(MAX_CONCURRENT_ENV, "0") };
        assert_eq!(PoolConfig::from_env().worker_count().get(), 1);

        unsafe { std::env::remove_var(MAX_CONCURRENT_ENV) };
        assert_eq!(PoolConfig::from_env(), PoolConfig::default());
    }

    #[test]
    fn builder_overrides() {
        let config = PoolConfig::default()
            .with_max_concurrent_loaders(8)
            .with_thread_name_prefix("import");
        assert_eq!(config.worker_count().get(), 8);
        assert_eq!(config.thread_name_prefix, "import");
    }
}
