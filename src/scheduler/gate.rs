use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// One single-permit semaphore per feed.
///
/// Gates are never removed, so a permit always guards the only semaphore for
/// its feed.
#[derive(Debug, Default)]
pub(crate) struct FeedGates {
    gates: Mutex<HashMap<i64, Arc<Semaphore>>>,
}

impl FeedGates {
    /// Take the feed's gate without waiting. `None` when a cycle holds it.
    pub fn try_acquire(&self, feed_id: i64) -> Option<OwnedSemaphorePermit> {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                gates
                    .entry(feed_id)
                    .or_insert_with(|| Arc::new(Semaphore::new(1))),
            )
        };
        gate.try_acquire_owned().ok()
    }
}
