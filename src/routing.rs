use std::time::Instant;

use log::{debug, error};
use parking_lot::Mutex;

use crate::errors::Result;
use crate::metrics;

/// Serializes every routing-table mutation in the process. Concurrent
/// workers touching `ip rule` and `ip route` at the same time corrupt
/// each other's view of the tables, so the lock is held for the routing
/// steps of exactly one interface at a time.
pub struct RoutingCoordinator {
    lock: Mutex<()>,
}

impl RoutingCoordinator {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    pub fn with_lock<F>(&self, interface_name: &str, operation: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let wait_start = Instant::now();
        debug!("acquiring routing lock for {}", interface_name);
        let guard = self.lock.lock();
        let waited = wait_start.elapsed();
        metrics::metrics()
            .routing_lock_wait_seconds
            .observe(waited.as_secs_f64());
        debug!(
            "routing lock acquired for {} after {}ms",
            interface_name,
            waited.as_millis()
        );

        let op_start = Instant::now();
        let result = operation();
        let took = op_start.elapsed();
        metrics::metrics()
            .routing_operation_seconds
            .observe(took.as_secs_f64());
        drop(guard);

        match &result {
            Ok(()) => debug!(
                "routing operation for {} completed in {}ms",
                interface_name,
                took.as_millis()
            ),
            Err(e) => {
                metrics::metrics().routing_operation_failures_total.inc();
                error!("routing operation for {} failed: {}", interface_name, e);
            }
        }
        result
    }

    /// Lock state probe for tests and monitoring.
    pub fn is_locked(&self) -> bool {
        match self.lock.try_lock() {
            Some(guard) => {
                drop(guard);
                false
            }
            None => true,
        }
    }
}

impl Default for RoutingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
