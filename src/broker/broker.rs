// Subscriber registry: routes queue ownership across client sessions

use crate::broker::message::{Command, Id};
use anyhow::{Context, Result};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Address of a client session as seen by the registry: its identity
/// and the sending side of its inbound command queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub rcv_tx: mpsc::Sender<(Id, Command)>,
}

/// A subscription claim, acknowledged once the registry has processed it.
type Claim = (Id, SessionHandle, oneshot::Sender<()>);

/// Handle for publishing subscription claims to the registry fiber.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Claim>,
}

impl RegistryHandle {
    /// Claim `recipient_id` for `session` and wait for the registry to
    /// process it. On return, any prior holder has had END enqueued on
    /// its own inbound queue and the new binding is installed, so the
    /// claimant cannot observe a message ahead of the displacement.
    pub async fn subscribe(&self, recipient_id: Id, session: SessionHandle) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send((recipient_id, session, done_tx))
            .await
            .context("failed to publish subscription to registry")?;
        done_rx
            .await
            .context("registry dropped the subscription claim")
    }
}

/// Process-wide map of recipient id to the currently-subscribed session.
///
/// One fiber owns the map and drains the claim channel, so displacement
/// notifications and installs are observed in claim order. Bindings for
/// dead sessions are healed lazily: the END send just fails and the next
/// claim overwrites them.
pub struct SubscriberRegistry {
    rx: mpsc::Receiver<Claim>,
}

impl SubscriberRegistry {
    /// Create a registry and its claim handle. `queue_bound` caps the
    /// claim channel; sessions publishing claims block only under
    /// adversarial pressure.
    pub fn new(queue_bound: usize) -> (Self, RegistryHandle) {
        let (tx, rx) = mpsc::channel(queue_bound);
        (Self { rx }, RegistryHandle { tx })
    }

    /// Run the registry event loop until every claim handle is dropped.
    pub async fn run(mut self) {
        tracing::info!("subscriber registry started");

        let mut subscribers: HashMap<Id, SessionHandle> = HashMap::new();

        while let Some((recipient_id, session, done)) = self.rx.recv().await {
            if let Some(prior) = subscribers.get(&recipient_id) {
                if prior.session_id != session.session_id {
                    tracing::debug!(
                        recipient_id = %recipient_id,
                        displaced = %prior.session_id,
                        "subscription displaced"
                    );
                    // The displaced session tears its own state down
                    // through its normal command pipeline.
                    let _ = prior.rcv_tx.send((recipient_id.clone(), Command::End)).await;
                }
            }
            subscribers.insert(recipient_id, session);
            // The claimant waits for this before it starts delivering.
            let _ = done.send(());
        }

        tracing::info!("subscriber registry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session(id: &str) -> (SessionHandle, mpsc::Receiver<(Id, Command)>) {
        let (rcv_tx, rcv_rx) = mpsc::channel(8);
        (
            SessionHandle {
                session_id: id.to_string(),
                rcv_tx,
            },
            rcv_rx,
        )
    }

    #[tokio::test]
    async fn test_displacement_notifies_prior_session() {
        let (registry, handle) = SubscriberRegistry::new(8);
        tokio::spawn(registry.run());

        let rid = Id(vec![1]);
        let (first, mut first_rx) = session("first");
        let (second, _second_rx) = session("second");

        handle.subscribe(rid.clone(), first).await.unwrap();
        handle.subscribe(rid.clone(), second).await.unwrap();

        let (end_rid, end_cmd) = tokio::time::timeout(Duration::from_secs(1), first_rx.recv())
            .await
            .expect("displacement timed out")
            .expect("channel closed");
        assert_eq!(end_rid, rid);
        assert_eq!(end_cmd, Command::End);
    }

    #[tokio::test]
    async fn test_reclaim_by_same_session_sends_no_end() {
        let (registry, handle) = SubscriberRegistry::new(8);
        tokio::spawn(registry.run());

        let rid = Id(vec![1]);
        let (first, mut first_rx) = session("first");

        handle.subscribe(rid.clone(), first.clone()).await.unwrap();
        handle.subscribe(rid.clone(), first).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(100), first_rx.recv()).await;
        assert!(outcome.is_err(), "no END expected for a self-reclaim");
    }

    #[tokio::test]
    async fn test_dead_prior_session_is_overwritten() {
        let (registry, handle) = SubscriberRegistry::new(8);
        tokio::spawn(registry.run());

        let rid = Id(vec![1]);
        let (first, first_rx) = session("first");
        drop(first_rx);

        handle.subscribe(rid.clone(), first).await.unwrap();

        // The failed END to the dead session must not wedge the registry
        let (second, _second_rx) = session("second");
        handle.subscribe(rid.clone(), second).await.unwrap();

        let (third, _third_rx) = session("third");
        handle.subscribe(rid, third).await.unwrap();
    }
}
