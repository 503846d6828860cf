//! Single-Flight Registry. See spec §4.4.

use crate::fingerprint::Fingerprint;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

/// Cheaply cloneable: headers plus enough to re-open the served bytes, never
/// the payload itself, so fan-out doesn't copy the image into every waiter.
pub type Waiter<T> = oneshot::Sender<T>;

pub struct Registry<T> {
    inflight: Mutex<FxHashMap<Fingerprint, Vec<Waiter<T>>>>,
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Registry { inflight: Mutex::new(FxHashMap::default()) }
    }

    /// Registers a waiter for `fp`. Returns `(receiver, is_leader)`: the
    /// caller awaits the receiver for its result, and must drive the fetch
    /// iff `is_leader` is true.
    pub fn join(&self, fp: Fingerprint) -> (oneshot::Receiver<T>, bool) {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.inflight.lock();
        match guard.get_mut(&fp) {
            Some(waiters) => {
                waiters.push(tx);
                (rx, false)
            }
            None => {
                guard.insert(fp, vec![tx]);
                (rx, true)
            }
        }
    }

    /// Delivers `result` to every waiter registered for `fp`, in join order,
    /// then destroys the waiter list. No-op if no list exists. Waiters whose
    /// receiver has already been dropped (client disconnected) are simply
    /// skipped — their slot discards the result, the fetch itself is
    /// unaffected.
    pub fn complete(&self, fp: Fingerprint, result: T) {
        let waiters = {
            let mut guard = self.inflight.lock();
            guard.remove(&fp)
        };
        let Some(waiters) = waiters else { return };
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::TransformOptions;

    fn fp() -> Fingerprint {
        Fingerprint::compute("http://x/y.png", &TransformOptions::default())
    }

    #[tokio::test]
    async fn first_joiner_is_leader() {
        let registry: Registry<u32> = Registry::new();
        let (_, is_leader) = registry.join(fp());
        assert!(is_leader);
    }

    #[tokio::test]
    async fn second_joiner_is_not_leader() {
        let registry: Registry<u32> = Registry::new();
        let fp = fp();
        let (_rx1, leader1) = registry.join(fp);
        let (_rx2, leader2) = registry.join(fp);
        assert!(leader1);
        assert!(!leader2);
    }

    #[tokio::test]
    async fn complete_fans_out_to_all_waiters() {
        let registry: Registry<u32> = Registry::new();
        let fp = fp();
        let (rx1, _) = registry.join(fp);
        let (rx2, _) = registry.join(fp);
        let (rx3, _) = registry.join(fp);

        registry.complete(fp, 42);

        assert_eq!(rx1.await.unwrap(), 42);
        assert_eq!(rx2.await.unwrap(), 42);
        assert_eq!(rx3.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn complete_with_no_waiters_is_a_no_op() {
        let registry: Registry<u32> = Registry::new();
        registry.complete(fp(), 1); // must not panic
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_affect_others() {
        let registry: Registry<u32> = Registry::new();
        let fp = fp();
        let (rx1, _) = registry.join(fp);
        let (rx2, _) = registry.join(fp);
        drop(rx1);

        registry.complete(fp, 7); // must not panic despite rx1 being dropped
        assert_eq!(rx2.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn a_new_leader_can_join_after_completion() {
        let registry: Registry<u32> = Registry::new();
        let fp = fp();
        let (_, leader1) = registry.join(fp);
        registry.complete(fp, 1);
        let (_, leader2) = registry.join(fp);
        assert!(leader1);
        assert!(leader2);
    }
}
