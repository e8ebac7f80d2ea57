//! Steering channel — durable per-session FIFO mailbox.
//!
//! External actors push while a session is Active; the worker driving the
//! session drains the mailbox at every suspension point.

use std::sync::Arc;

use crate::config::QueueConfig;
use crate::error::SteeringError;
use crate::session::model::{SessionStatus, SteeringMessage};
use crate::session::registry::SessionRegistry;
use crate::store::{Database, RetryPolicy, with_retry};

/// What a worker should do with everything drained in one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SteeringBatch {
    /// Interrupt the current step and feed `text` to the executor.
    Redirect {
        text: String,
        senders: Vec<String>,
        count: usize,
    },
    /// Stop the execution. Non-abort messages drained alongside are discarded.
    Abort {
        sender: String,
        reason: String,
        discarded: usize,
    },
}

/// Fold a drained burst into a single action. An abort anywhere wins.
pub fn fold_batch(messages: Vec<SteeringMessage>) -> Option<SteeringBatch> {
    if messages.is_empty() {
        return None;
    }

    if let Some(abort) = messages.iter().find(|m| m.is_abort) {
        return Some(SteeringBatch::Abort {
            sender: abort.sender.clone(),
            reason: abort.text.clone(),
            discarded: messages.len() - 1,
        });
    }

    let mut senders: Vec<String> = Vec::new();
    for m in &messages {
        if !senders.contains(&m.sender) {
            senders.push(m.sender.clone());
        }
    }
    let count = messages.len();
    let text = messages
        .into_iter()
        .map(|m| m.text)
        .collect::<Vec<_>>()
        .join("\n");

    Some(SteeringBatch::Redirect {
        text,
        senders,
        count,
    })
}

/// Push/pop/clear over the store, with wake-ups through the registry.
#[derive(Clone)]
pub struct SteeringChannel {
    db: Arc<dyn Database>,
    registry: Arc<SessionRegistry>,
    retry: RetryPolicy,
}

impl SteeringChannel {
    pub fn new(db: Arc<dyn Database>, registry: Arc<SessionRegistry>, config: &QueueConfig) -> Self {
        Self {
            db,
            registry,
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Queue a message for an Active session and wake its worker.
    ///
    /// Sessions in any other state reject the push with
    /// [`SteeringError::SessionNotActive`]; the caller decides whether to
    /// turn the message into a new job instead.
    pub async fn push(
        &self,
        session_id: &str,
        text: &str,
        sender: &str,
        is_abort: bool,
    ) -> Result<i64, SteeringError> {
        let session = with_retry(&self.retry, "get_session", || self.db.get_session(session_id))
            .await?
            .ok_or_else(|| SteeringError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        if session.status != SessionStatus::Active {
            return Err(SteeringError::SessionNotActive {
                session_id: session_id.to_string(),
                status: session.status.to_string(),
            });
        }

        let mut message = SteeringMessage::new(session_id, text, sender);
        message.is_abort = is_abort;
        let Some(seq) =
            with_retry(&self.retry, "push_steering", || self.db.push_steering(&message)).await?
        else {
            // Left Active after the check above.
            let status = self
                .db
                .get_session(session_id)
                .await?
                .map(|s| s.status.to_string())
                .unwrap_or_else(|| "missing".to_string());
            return Err(SteeringError::SessionNotActive {
                session_id: session_id.to_string(),
                status,
            });
        };

        let woke = self.registry.wake(session_id);
        tracing::info!(session_id, sender, is_abort, seq, woke, "Steering message queued");
        Ok(seq)
    }

    /// Oldest message for `session_id`, removed from the mailbox.
    pub async fn pop(&self, session_id: &str) -> Result<Option<SteeringMessage>, SteeringError> {
        Ok(with_retry(&self.retry, "pop_steering", || self.db.pop_steering(session_id)).await?)
    }

    /// Pop until empty, preserving order.
    pub async fn take_all(&self, session_id: &str) -> Result<Vec<SteeringMessage>, SteeringError> {
        let mut messages = Vec::new();
        while let Some(message) = self.pop(session_id).await? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Drain every queued message and fold the burst into one action.
    pub async fn drain(&self, session_id: &str) -> Result<Option<SteeringBatch>, SteeringError> {
        let messages = self.take_all(session_id).await?;
        if !messages.is_empty() {
            tracing::debug!(session_id, count = messages.len(), "Drained steering burst");
        }
        Ok(fold_batch(messages))
    }

    /// Remove every queued message. Returns how many were removed.
    pub async fn clear(&self, session_id: &str) -> Result<usize, SteeringError> {
        let removed =
            with_retry(&self.retry, "clear_steering", || self.db.clear_steering(session_id)).await?;
        if removed > 0 {
            tracing::debug!(session_id, removed, "Cleared steering mailbox");
        }
        Ok(removed)
    }

    pub async fn pending(&self, session_id: &str) -> Result<usize, SteeringError> {
        Ok(self.db.count_steering(session_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::AgentSession;
    use crate::store::LibSqlBackend;

    async fn setup(status: SessionStatus) -> SteeringChannel {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut session = AgentSession::new("s1", "proj");
        session.status = status;
        db.upsert_session(&session).await.unwrap();
        SteeringChannel::new(db, Arc::new(SessionRegistry::new()), &QueueConfig::default())
    }

    #[tokio::test]
    async fn pops_in_push_order() {
        let channel = setup(SessionStatus::Active).await;
        for text in ["m1", "m2", "m3"] {
            channel.push("s1", text, "alice", false).await.unwrap();
        }
        assert_eq!(channel.pop("s1").await.unwrap().unwrap().text, "m1");
        assert_eq!(channel.pop("s1").await.unwrap().unwrap().text, "m2");
        assert_eq!(channel.pop("s1").await.unwrap().unwrap().text, "m3");
        assert!(channel.pop("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn burst_is_concatenated_in_order() {
        let channel = setup(SessionStatus::Active).await;
        for text in ["m1", "m2", "m3"] {
            channel.push("s1", text, "alice", false).await.unwrap();
        }
        let batch = channel.drain("s1").await.unwrap().unwrap();
        assert_eq!(
            batch,
            SteeringBatch::Redirect {
                text: "m1\nm2\nm3".to_string(),
                senders: vec!["alice".to_string()],
                count: 3,
            }
        );
        assert_eq!(channel.pending("s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn abort_wins_regardless_of_position() {
        let channel = setup(SessionStatus::Active).await;
        channel.push("s1", "first", "alice", false).await.unwrap();
        channel.push("s1", "stop", "bob", true).await.unwrap();
        channel.push("s1", "later", "alice", false).await.unwrap();

        let batch = channel.drain("s1").await.unwrap().unwrap();
        assert_eq!(
            batch,
            SteeringBatch::Abort {
                sender: "bob".to_string(),
                reason: "stop".to_string(),
                discarded: 2,
            }
        );
    }

    #[tokio::test]
    async fn inactive_session_rejects_push() {
        let channel = setup(SessionStatus::Complete).await;
        let err = channel.push("s1", "hi", "alice", false).await.unwrap_err();
        assert!(matches!(err, SteeringError::SessionNotActive { .. }));
    }

    #[tokio::test]
    async fn unknown_session_rejects_push() {
        let channel = setup(SessionStatus::Active).await;
        let err = channel.push("nope", "hi", "alice", false).await.unwrap_err();
        assert!(matches!(err, SteeringError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn clear_reports_count() {
        let channel = setup(SessionStatus::Active).await;
        channel.push("s1", "a", "u", false).await.unwrap();
        channel.push("s1", "b", "u", false).await.unwrap();
        assert_eq!(channel.clear("s1").await.unwrap(), 2);
        assert_eq!(channel.clear("s1").await.unwrap(), 0);
    }

    #[test]
    fn empty_burst_folds_to_nothing() {
        assert!(fold_batch(Vec::new()).is_none());
    }

    #[test]
    fn senders_are_deduplicated_in_order() {
        let batch = fold_batch(vec![
            SteeringMessage::new("s", "a", "bob"),
            SteeringMessage::new("s", "b", "alice"),
            SteeringMessage::new("s", "c", "bob"),
        ])
        .unwrap();
        match batch {
            SteeringBatch::Redirect { senders, .. } => assert_eq!(senders, vec!["bob", "alice"]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
