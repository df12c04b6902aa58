use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 20;
/// Default time to wait for a ping acknowledgement.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);
/// Default time to wait for a single peer during an iterative lookup round.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(3000);
/// Default width of the iterative lookup frontier.
pub const DEFAULT_LOOKUP_CONCURRENCY: usize = 5;
/// Default period after which a bucket is refreshed.
pub const DEFAULT_BUCKET_REFRESH_PERIOD: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
/// Routing table configuration, shared by every component of a node.
///
/// Every field is read and written atomically on its own, so changes take effect
/// on the next read and a reader never sees a half written value.
pub struct Config {
    bucket_size: AtomicUsize,
    ping_timeout: AtomicU64,
    lookup_timeout: AtomicU64,
    lookup_concurrency: AtomicUsize,
    bucket_refresh_period: AtomicU64,
    update_routing_table: AtomicBool,
}

impl Config {
    // === Getters ===

    /// Maximum number of contacts per bucket.
    ///
    /// Defaults to [DEFAULT_BUCKET_SIZE]
    pub fn bucket_size(&self) -> usize {
        self.bucket_size.load(Ordering::Relaxed)
    }

    /// Time to wait for a ping acknowledgement before considering a peer unreachable.
    ///
    /// Defaults to [DEFAULT_PING_TIMEOUT]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_micros(self.ping_timeout.load(Ordering::Relaxed))
    }

    /// Time to wait for each peer queried in a lookup round.
    ///
    /// The longer this duration is, the longer lookups take when peers are gone.
    /// The shorter it is, the more answers from busy peers are missed.
    ///
    /// Defaults to [DEFAULT_LOOKUP_TIMEOUT]
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_micros(self.lookup_timeout.load(Ordering::Relaxed))
    }

    /// Maximum number of candidates kept by an iterative lookup, and number of
    /// contacts asked from each peer.
    ///
    /// Defaults to [DEFAULT_LOOKUP_CONCURRENCY]
    pub fn lookup_concurrency(&self) -> usize {
        self.lookup_concurrency.load(Ordering::Relaxed)
    }

    /// Period after which a bucket is refreshed with a lookup.
    ///
    /// Defaults to [DEFAULT_BUCKET_REFRESH_PERIOD]
    pub fn bucket_refresh_period(&self) -> Duration {
        Duration::from_micros(self.bucket_refresh_period.load(Ordering::Relaxed))
    }

    /// Whether incoming messages and lookups update the routing table.
    ///
    /// Defaults to `true`
    pub fn update_routing_table(&self) -> bool {
        self.update_routing_table.load(Ordering::Relaxed)
    }

    // === Setters ===

    pub fn set_bucket_size(&self, size: NonZeroUsize) {
        self.bucket_size.store(size.get(), Ordering::Relaxed);
    }

    pub fn set_ping_timeout(&self, timeout: Duration) {
        self.ping_timeout
            .store(duration_to_micros(timeout), Ordering::Relaxed);
    }

    pub fn set_lookup_timeout(&self, timeout: Duration) {
        self.lookup_timeout
            .store(duration_to_micros(timeout), Ordering::Relaxed);
    }

    pub fn set_lookup_concurrency(&self, concurrency: NonZeroUsize) {
        self.lookup_concurrency
            .store(concurrency.get(), Ordering::Relaxed);
    }

    pub fn set_bucket_refresh_period(&self, period: Duration) {
        self.bucket_refresh_period
            .store(duration_to_micros(period), Ordering::Relaxed);
    }

    /// Turning off routing table updates makes the network stagnate very quickly,
    /// and is almost always a bad idea.
    pub fn set_update_routing_table(&self, update: bool) {
        self.update_routing_table.store(update, Ordering::Relaxed);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_size: AtomicUsize::new(DEFAULT_BUCKET_SIZE),
            ping_timeout: AtomicU64::new(duration_to_micros(DEFAULT_PING_TIMEOUT)),
            lookup_timeout: AtomicU64::new(duration_to_micros(DEFAULT_LOOKUP_TIMEOUT)),
            lookup_concurrency: AtomicUsize::new(DEFAULT_LOOKUP_CONCURRENCY),
            bucket_refresh_period: AtomicU64::new(duration_to_micros(
                DEFAULT_BUCKET_REFRESH_PERIOD,
            )),
            update_routing_table: AtomicBool::new(true),
        }
    }
}

fn duration_to_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(config.bucket_size(), 20);
        assert_eq!(config.ping_timeout(), Duration::from_secs(2));
        assert_eq!(config.lookup_timeout(), Duration::from_millis(3000));
        assert_eq!(config.lookup_concurrency(), 5);
        assert_eq!(config.bucket_refresh_period(), Duration::from_secs(600));
        assert!(config.update_routing_table());
    }

    #[test]
    fn updates_are_visible_on_next_read() {
        let config = Config::default();

        config.set_bucket_size(NonZeroUsize::new(3).unwrap());
        config.set_ping_timeout(Duration::from_millis(150));
        config.set_update_routing_table(false);

        assert_eq!(config.bucket_size(), 3);
        assert_eq!(config.ping_timeout(), Duration::from_millis(150));
        assert!(!config.update_routing_table());
    }
}
