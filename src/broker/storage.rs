// In-memory connection records

use crate::broker::message::{ErrorKind, Id, PubKey};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Whether a queue accepts new messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Active,
    Off,
}

/// The party a command authenticates as. Recipients address queues by
/// recipient id, senders by the paired sender id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Recipient,
    Sender,
}

/// A message queue record.
///
/// `sender_key` is absent until the recipient secures the queue with
/// KEY; once set it is never replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub recipient_id: Id,
    pub sender_id: Id,
    pub recipient_key: PubKey,
    pub sender_key: Option<PubKey>,
    pub status: QueueStatus,
}

#[derive(Default)]
struct Indexes {
    by_recipient: HashMap<Id, Connection>,
    by_sender: HashMap<Id, Id>,
}

impl Indexes {
    fn contains(&self, id: &Id) -> bool {
        self.by_recipient.contains_key(id) || self.by_sender.contains_key(id)
    }
}

/// Dual-index store of live connections.
///
/// Both indexes live under one lock, so install and removal are atomic:
/// no observer ever sees a record reachable through only one of its ids.
pub struct ConnectionStore {
    inner: Mutex<Indexes>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Indexes::default()),
        }
    }

    /// Install a new connection iff neither id collides with any live
    /// record. Collisions yield DUPLICATE; the caller retries with
    /// fresh ids.
    pub async fn add(
        &self,
        recipient_key: PubKey,
        recipient_id: Id,
        sender_id: Id,
    ) -> Result<(), ErrorKind> {
        let mut inner = self.inner.lock().await;
        if recipient_id == sender_id || inner.contains(&recipient_id) || inner.contains(&sender_id)
        {
            return Err(ErrorKind::Duplicate);
        }

        inner.by_sender.insert(sender_id.clone(), recipient_id.clone());
        inner.by_recipient.insert(
            recipient_id.clone(),
            Connection {
                recipient_id,
                sender_id,
                recipient_key,
                sender_key: None,
                status: QueueStatus::Active,
            },
        );
        Ok(())
    }

    /// Look up a connection in the id space of the given party. A
    /// missing id is AUTH, indistinguishable from a failed signature,
    /// so lookups reveal nothing to unauthorized parties.
    pub async fn get(&self, party: Party, conn_id: &Id) -> Result<Connection, ErrorKind> {
        let inner = self.inner.lock().await;
        let connection = match party {
            Party::Recipient => inner.by_recipient.get(conn_id),
            Party::Sender => inner
                .by_sender
                .get(conn_id)
                .and_then(|rid| inner.by_recipient.get(rid)),
        };
        connection.cloned().ok_or(ErrorKind::Auth)
    }

    /// Install the sender key. A queue is secured exactly once; any
    /// further KEY is AUTH even with the same key.
    pub async fn secure(&self, recipient_id: &Id, sender_key: PubKey) -> Result<(), ErrorKind> {
        let mut inner = self.inner.lock().await;
        let connection = inner
            .by_recipient
            .get_mut(recipient_id)
            .ok_or(ErrorKind::Auth)?;
        if connection.sender_key.is_some() {
            return Err(ErrorKind::Auth);
        }
        connection.sender_key = Some(sender_key);
        Ok(())
    }

    /// Turn the queue off; subsequent sends are rejected with AUTH.
    pub async fn suspend(&self, recipient_id: &Id) -> Result<(), ErrorKind> {
        let mut inner = self.inner.lock().await;
        let connection = inner
            .by_recipient
            .get_mut(recipient_id)
            .ok_or(ErrorKind::Auth)?;
        connection.status = QueueStatus::Off;
        Ok(())
    }

    /// Remove the connection from both indexes.
    pub async fn delete(&self, recipient_id: &Id) -> Result<(), ErrorKind> {
        let mut inner = self.inner.lock().await;
        let connection = inner
            .by_recipient
            .remove(recipient_id)
            .ok_or(ErrorKind::Auth)?;
        inner.by_sender.remove(&connection.sender_id);
        tracing::debug!(recipient_id = %connection.recipient_id, "queue deleted");
        Ok(())
    }
}

impl Default for ConnectionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(bytes: &[u8]) -> PubKey {
        PubKey(bytes.to_vec())
    }

    #[tokio::test]
    async fn test_add_and_get_both_parties() {
        let store = ConnectionStore::new();
        let rid = Id(vec![1]);
        let sid = Id(vec![2]);

        store.add(key(b"rk"), rid.clone(), sid.clone()).await.unwrap();

        let by_recipient = store.get(Party::Recipient, &rid).await.unwrap();
        let by_sender = store.get(Party::Sender, &sid).await.unwrap();
        assert_eq!(by_recipient, by_sender);
        assert_eq!(by_recipient.status, QueueStatus::Active);
        assert_eq!(by_recipient.sender_key, None);

        // Ids are not interchangeable across parties
        assert_eq!(store.get(Party::Recipient, &sid).await, Err(ErrorKind::Auth));
        assert_eq!(store.get(Party::Sender, &rid).await, Err(ErrorKind::Auth));
    }

    #[tokio::test]
    async fn test_add_rejects_any_collision() {
        let store = ConnectionStore::new();
        store
            .add(key(b"rk"), Id(vec![1]), Id(vec![2]))
            .await
            .unwrap();

        // Either id colliding with either index is a duplicate
        for (rid, sid) in [
            (vec![1], vec![9]),
            (vec![2], vec![9]),
            (vec![9], vec![1]),
            (vec![9], vec![2]),
            (vec![9], vec![9]),
        ] {
            assert_eq!(
                store.add(key(b"rk2"), Id(rid), Id(sid)).await,
                Err(ErrorKind::Duplicate)
            );
        }

        // The store is unchanged by rejected installs
        assert!(store.get(Party::Recipient, &Id(vec![9])).await.is_err());
    }

    #[tokio::test]
    async fn test_secure_exactly_once() {
        let store = ConnectionStore::new();
        let rid = Id(vec![1]);
        store.add(key(b"rk"), rid.clone(), Id(vec![2])).await.unwrap();

        store.secure(&rid, key(b"sk")).await.unwrap();
        let connection = store.get(Party::Recipient, &rid).await.unwrap();
        assert_eq!(connection.sender_key, Some(key(b"sk")));

        // Re-securing fails with the same key and with a different one
        assert_eq!(store.secure(&rid, key(b"sk")).await, Err(ErrorKind::Auth));
        assert_eq!(store.secure(&rid, key(b"sk2")).await, Err(ErrorKind::Auth));

        // Unknown queue
        assert_eq!(
            store.secure(&Id(vec![9]), key(b"sk")).await,
            Err(ErrorKind::Auth)
        );
    }

    #[tokio::test]
    async fn test_suspend() {
        let store = ConnectionStore::new();
        let rid = Id(vec![1]);
        store.add(key(b"rk"), rid.clone(), Id(vec![2])).await.unwrap();

        store.suspend(&rid).await.unwrap();
        let connection = store.get(Party::Recipient, &rid).await.unwrap();
        assert_eq!(connection.status, QueueStatus::Off);

        assert_eq!(store.suspend(&Id(vec![9])).await, Err(ErrorKind::Auth));
    }

    #[tokio::test]
    async fn test_delete_removes_both_indexes() {
        let store = ConnectionStore::new();
        let rid = Id(vec![1]);
        let sid = Id(vec![2]);
        store.add(key(b"rk"), rid.clone(), sid.clone()).await.unwrap();

        store.delete(&rid).await.unwrap();
        assert_eq!(store.get(Party::Recipient, &rid).await, Err(ErrorKind::Auth));
        assert_eq!(store.get(Party::Sender, &sid).await, Err(ErrorKind::Auth));

        // Deleting again is AUTH; the ids are free for reuse
        assert_eq!(store.delete(&rid).await, Err(ErrorKind::Auth));
        store.add(key(b"rk"), rid.clone(), sid).await.unwrap();
    }
}
