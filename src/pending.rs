//! Table of in-flight RPC calls keyed by correlation id.
//!
//! Each entry is a one-shot completion handle. Exactly one completion path
//! runs per entry: reply, timeout, disconnect, or explicit cancellation all
//! remove the entry before completing it.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{BusError, Result};

type Completion = oneshot::Sender<Result<Vec<u8>>>;

#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<String, Completion>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Completion>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a call before its request is published, so a reply racing
    /// the publish return still finds its handle.
    pub fn insert(&self, correlation_id: String, completion: Completion) {
        self.lock().insert(correlation_id, completion);
    }

    /// Deliver raw reply bytes. Returns false on a lookup miss (late reply
    /// after timeout or cancellation); the reply is dropped in that case.
    pub fn complete(&self, correlation_id: &str, reply: Vec<u8>) -> bool {
        match self.lock().remove(correlation_id) {
            Some(completion) => completion.send(Ok(reply)).is_ok(),
            None => false,
        }
    }

    /// Drop an entry without completing it (timeout reaping).
    pub fn cancel(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    /// Reject every pending call and empty the table (connection loss).
    pub fn fail_all(&self, error: impl Fn() -> BusError) {
        let drained: Vec<Completion> = {
            let mut calls = self.lock();
            calls.drain().map(|(_, completion)| completion).collect()
        };
        for completion in drained {
            let _ = completion.send(Err(error()));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_completes_exactly_once() {
        let pending = PendingCalls::new();
        let (tx, rx) = oneshot::channel();
        pending.insert("abc".to_string(), tx);

        assert!(pending.complete("abc", vec![1, 2]));
        assert!(!pending.complete("abc", vec![3]));
        assert_eq!(rx.await.unwrap().unwrap(), vec![1, 2]);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn unknown_correlation_ids_are_dropped() {
        let pending = PendingCalls::new();
        assert!(!pending.complete("ghost", vec![9]));
    }

    #[tokio::test]
    async fn fail_all_rejects_every_waiter() {
        let pending = PendingCalls::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.insert("a".to_string(), tx1);
        pending.insert("b".to_string(), tx2);

        pending.fail_all(|| BusError::Disconnected);
        assert!(matches!(rx1.await.unwrap(), Err(BusError::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(BusError::Disconnected)));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn cancel_makes_late_replies_miss() {
        let pending = PendingCalls::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert("late".to_string(), tx);
        pending.cancel("late");
        assert!(!pending.complete("late", vec![1]));
        assert!(rx.try_recv().is_err());
    }
}
