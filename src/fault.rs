//! Named fault-injection points
//!
//! Tests arm a point by name to either fail or block the pipeline at that
//! stage. Production code calls `check` at each stage; an unarmed point is
//! a no-op.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Behavior armed at one injection point
#[derive(Clone)]
enum Fault {
    /// Fail the stage with an injected error
    Fail,
    /// Park the stage until the blocker is released
    Block(Arc<Notify>),
}

/// Registry of injection points, keyed by stage name
///
/// The core stages are `"mount"`, `"checkout"`, and `"inodeCheckout"`.
#[derive(Default)]
pub struct FaultInjector {
    faults: DashMap<String, Fault>,
}

/// Handle used to release a blocking fault
pub struct FaultBlocker {
    notify: Arc<Notify>,
}

impl FaultBlocker {
    /// Let every waiter parked on this fault proceed
    pub fn release(&self) {
        self.notify.notify_waiters();
    }
}

impl FaultInjector {
    pub fn new() -> Self {
        FaultInjector::default()
    }

    /// Arm `name` to fail with `Error::InjectedFault`
    pub fn fail(&self, name: &str) {
        self.faults.insert(name.to_string(), Fault::Fail);
    }

    /// Arm `name` to block; release via the returned blocker
    pub fn block(&self, name: &str) -> FaultBlocker {
        let notify = Arc::new(Notify::new());
        self.faults
            .insert(name.to_string(), Fault::Block(Arc::clone(&notify)));
        FaultBlocker { notify }
    }

    /// Disarm `name`
    pub fn clear(&self, name: &str) {
        self.faults.remove(name);
    }

    /// Observe the point: no-op, error, or park until released
    pub async fn check(&self, name: &str) -> Result<()> {
        let fault = match self.faults.get(name) {
            Some(f) => f.clone(),
            None => return Ok(()),
        };
        match fault {
            Fault::Fail => Err(Error::InjectedFault(name.to_string())),
            Fault::Block(notify) => {
                notify.notified().await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unarmed_point_is_noop() {
        let faults = FaultInjector::new();
        faults.check("checkout").await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_point() {
        let faults = FaultInjector::new();
        faults.fail("mount");
        assert!(matches!(
            faults.check("mount").await,
            Err(Error::InjectedFault(_))
        ));
        faults.clear("mount");
        faults.check("mount").await.unwrap();
    }

    #[tokio::test]
    async fn test_block_point_releases_waiters() {
        let faults = Arc::new(FaultInjector::new());
        let blocker = faults.block("inodeCheckout");

        let waiting = {
            let faults = Arc::clone(&faults);
            tokio::spawn(async move { faults.check("inodeCheckout").await })
        };

        // The waiter should not finish on its own.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        blocker.release();
        waiting.await.unwrap().unwrap();
    }
}
