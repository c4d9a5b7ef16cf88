use std::time::Duration;

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct RaptorOptions {
    /// Hard cap on concurrently tracked connections. Accepts arriving while
    ///  the table is full are dropped without any callback.
    pub max_connections: usize,

    /// Idle time after which a connection is forcibly closed by the sweeper.
    ///  Any successful receive or send event resets the clock. Granularity is
    ///  whole seconds.
    pub connection_timeout: Duration,

    /// Number of table slots allocated up front. The table grows by doubling
    ///  up to `max_connections` when the free list runs dry.
    pub initial_capacity: usize,
}

impl Default for RaptorOptions {
    fn default() -> Self {
        RaptorOptions {
            max_connections: 1024,
            connection_timeout: Duration::from_secs(60),
            initial_capacity: 100,
        }
    }
}
