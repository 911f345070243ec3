//! Log throttling utility
//!
//! Limits how often the same warning is recorded, so a dead signaling link
//! does not flood the log with one line per dropped message. Suppressed
//! repeats are counted and reported with the next line that gets through.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Per-key warning throttle
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use paircall::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
///
/// assert_eq!(throttler.admit("send:call-offer"), Some(0));
/// assert_eq!(throttler.admit("send:call-offer"), None);
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Decide whether an occurrence of `key` is logged.
    ///
    /// Returns the number of occurrences suppressed since the last logged one,
    /// or `None` if this one is suppressed too.
    pub fn admit(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget every key, e.g. once the link is back up
    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }
}

/// Throttled `tracing::warn!`, keyed by `$key`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        match $throttler.admit($key) {
            Some(0) => tracing::warn!($($arg)*),
            Some(suppressed) => {
                tracing::warn!($($arg)*);
                tracing::warn!("{} similar warnings suppressed", suppressed);
            }
            None => {}
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_repeats_are_counted() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert_eq!(throttler.admit("send:call-offer"), Some(0));
        assert_eq!(throttler.admit("send:call-offer"), None);
        assert_eq!(throttler.admit("send:call-offer"), None);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(throttler.admit("send:call-offer"), Some(2));
        assert_eq!(throttler.admit("send:call-offer"), None);
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.admit("send:call-offer").is_some());
        assert!(throttler.admit("send:ice-candidate").is_some());
        assert!(throttler.admit("send:call-offer").is_none());
    }

    #[test]
    fn test_clear_all() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.admit("decode").is_some());
        throttler.clear_all();
        assert_eq!(throttler.admit("decode"), Some(0));
    }
}
