// src/rabbitmq/correlation.rs
// Matches asynchronous replies to the callers waiting for them

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::errors::{RabbitMQError, Result};

struct PendingCall {
    reply_queue: String,
    sender: oneshot::Sender<Vec<u8>>,
}

/// In-flight synchronous calls keyed by correlation id.
///
/// Shared between callers, which `begin` and wait, and the dispatcher, which
/// `resolve`s. An entry leaves the table exactly once: when resolved, or when
/// its caller gives up.
#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<String, PendingCall>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a call. Must happen before the request is published so a
    /// fast reply always finds its entry.
    pub fn begin(&self, correlation_id: &str, reply_queue: &str) -> Result<PendingReply<'_>> {
        let (sender, receiver) = oneshot::channel();
        let mut pending = self.pending();
        if pending.contains_key(correlation_id) {
            return Err(RabbitMQError::DuplicateCorrelation(correlation_id.to_string()));
        }
        pending.insert(
            correlation_id.to_string(),
            PendingCall {
                reply_queue: reply_queue.to_string(),
                sender,
            },
        );
        debug!(correlation_id = %correlation_id, reply_queue = %reply_queue, "Call registered");

        Ok(PendingReply {
            table: self,
            correlation_id: correlation_id.to_string(),
            receiver,
        })
    }

    /// Completes the call registered under `correlation_id`. Unknown ids are
    /// stray replies: logged and otherwise ignored. Returns whether a call
    /// was completed.
    pub fn resolve(&self, correlation_id: &str, payload: Vec<u8>) -> bool {
        let Some(call) = self.pending().remove(correlation_id) else {
            warn!(
                correlation_id = %correlation_id,
                "Stray reply for unknown correlation id, dropping"
            );
            return false;
        };
        debug!(correlation_id = %correlation_id, reply_queue = %call.reply_queue, "Reply matched");
        if call.sender.send(payload).is_err() {
            // the caller stopped waiting between our removal and the send
            warn!(correlation_id = %correlation_id, "Reply arrived after its caller left");
        }
        true
    }

    /// Drops a call without completing it, returning its reply queue.
    pub fn cancel(&self, correlation_id: &str) -> Option<String> {
        self.pending()
            .remove(correlation_id)
            .map(|call| call.reply_queue)
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending().contains_key(correlation_id)
    }

    pub fn reply_queue(&self, correlation_id: &str) -> Option<String> {
        self.pending()
            .get(correlation_id)
            .map(|call| call.reply_queue.clone())
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

/// The waiting side of one registered call.
///
/// Dropping it without waiting removes the entry from the table.
pub struct PendingReply<'a> {
    table: &'a CorrelationTable,
    correlation_id: String,
    receiver: oneshot::Receiver<Vec<u8>>,
}

impl PendingReply<'_> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Suspends until the reply arrives or `deadline` passes. `None` waits
    /// indefinitely.
    pub async fn wait(mut self, deadline: Option<Duration>) -> Result<Vec<u8>> {
        let outcome = match deadline {
            Some(limit) => match tokio::time::timeout(limit, &mut self.receiver).await {
                Ok(received) => received,
                Err(_) => {
                    self.table.cancel(&self.correlation_id);
                    warn!(
                        correlation_id = %self.correlation_id,
                        timeout = ?limit,
                        "RPC call timed out"
                    );
                    return Err(RabbitMQError::CallTimeout(limit));
                }
            },
            None => (&mut self.receiver).await,
        };
        outcome.map_err(|_| RabbitMQError::DispatcherStopped)
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.table.cancel(&self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn resolve_completes_only_its_own_call() {
        let table = CorrelationTable::new();
        let first = table.begin("c1", "q1").unwrap();
        let second = table.begin("c2", "q2").unwrap();

        assert!(table.resolve("c2", b"v2".to_vec()));
        assert!(table.resolve("c1", b"v1".to_vec()));

        assert_eq!(second.wait(None).await.unwrap(), b"v2");
        assert_eq!(first.wait(None).await.unwrap(), b"v1");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn stray_replies_are_ignored() {
        let table = CorrelationTable::new();
        assert!(!table.resolve("nobody", b"late".to_vec()));

        let pending = table.begin("c1", "q1").unwrap();
        assert!(table.resolve("c1", b"once".to_vec()));
        assert!(!table.resolve("c1", b"twice".to_vec()));
        assert_eq!(pending.wait(None).await.unwrap(), b"once");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let table = CorrelationTable::new();
        let _pending = table.begin("c1", "q1").unwrap();
        assert!(matches!(
            table.begin("c1", "q2"),
            Err(RabbitMQError::DuplicateCorrelation(_))
        ));
        assert_eq!(table.reply_queue("c1").as_deref(), Some("q1"));
    }

    #[tokio::test]
    async fn timeout_removes_the_entry() {
        let table = CorrelationTable::new();
        let pending = table.begin("c1", "q1").unwrap();
        let err = pending
            .wait(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, RabbitMQError::CallTimeout(_)));
        assert!(!table.contains("c1"));
    }

    #[test]
    fn dropping_a_pending_reply_cleans_up() {
        let table = CorrelationTable::new();
        drop(table.begin("c1", "q1").unwrap());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn resolution_from_another_task_wakes_the_waiter() {
        let table = Arc::new(CorrelationTable::new());
        let resolver = table.clone();
        let pending = table.begin("c1", "q1").unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            resolver.resolve("c1", b"pong".to_vec());
        });

        let reply = pending.wait(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(reply, b"pong");
    }
}
