// Wire protocol types and per-queue message storage

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{Mutex, Notify};

/// Serde helper: opaque byte fields travel hex-encoded on the wire.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// An opaque identifier: a queue id (recipient or sender side) or a
/// message id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl Id {
    /// The empty id used for unaddressed transmissions.
    pub fn empty() -> Self {
        Id(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// A party's public key. Opaque to the broker; only the configured
/// `SignatureVerifier` interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKey(#[serde(with = "hex_bytes")] pub Vec<u8>);

/// Protocol error kinds sent to clients as `ERR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transmission frame could not be decoded.
    #[error("malformed transmission block")]
    Block,
    /// Unknown id, bad signature, suspended queue, or re-securing an
    /// already-secured queue. One kind for all of them, so lookups do
    /// not reveal whether a queue exists.
    #[error("unauthorized")]
    Auth,
    #[error("internal server error")]
    Internal,
    /// Id collision on queue creation; retried internally, never sent.
    #[error("duplicate queue id")]
    Duplicate,
    /// ACK with no message outstanding.
    #[error("command prohibited")]
    Prohibited,
    /// Message queue is full.
    #[error("queue quota exceeded")]
    Quota,
    #[error("no message")]
    NoMsg,
}

/// Protocol commands exchanged between clients and the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Create a new queue owned by the recipient holding this key
    Conn { recipient_key: PubKey },
    /// Subscribe to the queue addressed by the transmission
    Sub,
    /// Secure the queue: only this sender key may send afterwards
    Key { sender_key: PubKey },
    /// Suspend the queue; further sends are rejected
    Off,
    /// Delete the queue
    Del,
    /// Acknowledge the delivered message and request the next
    Ack,
    /// Send a message body into the queue
    Send {
        #[serde(with = "hex_bytes")]
        body: Vec<u8>,
    },
    /// Broker reply to CONN with the fresh id pair
    Ids { recipient_id: Id, sender_id: Id },
    /// Broker push of a queued message
    Msg {
        msg_id: Id,
        timestamp: SystemTime,
        #[serde(with = "hex_bytes")]
        body: Vec<u8>,
    },
    /// Broker notification that the subscription was taken over
    End,
    /// Broker success reply
    Ok,
    /// Broker error reply
    Err { kind: ErrorKind },
}

impl Command {
    pub fn err(kind: ErrorKind) -> Self {
        Command::Err { kind }
    }

    /// True for commands only the broker may originate; they are
    /// rejected when a client sends them.
    pub fn is_broker_origin(&self) -> bool {
        matches!(
            self,
            Command::Ids { .. } | Command::Msg { .. } | Command::End | Command::Ok | Command::Err { .. }
        )
    }
}

/// A framed wire transmission: `(signature, (conn_id, command))`.
///
/// The signature is opaque bytes, empty for broker-origin transmissions
/// and for unsigned sends on unsecured queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transmission {
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub conn_id: Id,
    pub command: Command,
}

impl Transmission {
    /// A broker-origin transmission; the signature slot stays empty.
    pub fn broker(conn_id: Id, command: Command) -> Self {
        Self {
            signature: Vec::new(),
            conn_id,
            command,
        }
    }

    /// Serialize to a newline-delimited JSON frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize from JSON frame bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A message held in a queue until the recipient acknowledges it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Id,
    pub timestamp: SystemTime,
    pub body: Vec<u8>,
}

/// Bounded in-memory FIFO for a single recipient queue.
///
/// Writers see back-pressure as a QUOTA error rather than blocking, so
/// a slow recipient can never stall a sender's session.
pub struct MessageQueue {
    messages: Mutex<VecDeque<Message>>,
    capacity: usize,
    arrived: Notify,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            capacity,
            arrived: Notify::new(),
        }
    }

    /// Append a message to the tail.
    pub async fn write(&self, message: Message) -> Result<(), ErrorKind> {
        let mut messages = self.messages.lock().await;
        if messages.len() >= self.capacity {
            return Err(ErrorKind::Quota);
        }
        messages.push_back(message);
        drop(messages);

        self.arrived.notify_waiters();
        Ok(())
    }

    /// Non-removing head read.
    pub async fn try_peek(&self) -> Option<Message> {
        self.messages.lock().await.front().cloned()
    }

    /// Remove the current head, then read the new head without removing
    /// it. Consume-then-look-for-next in one step, for ACK.
    pub async fn try_del_peek(&self) -> Option<Message> {
        let mut messages = self.messages.lock().await;
        messages.pop_front();
        messages.front().cloned()
    }

    /// Suspend until a message exists, then return it without removal.
    pub async fn peek_blocking(&self) -> Message {
        loop {
            // Register for the wakeup before checking, so a write
            // landing between the check and the await is not missed.
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(message) = self.try_peek().await {
                return message;
            }
            arrived.await;
        }
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

/// Per-recipient message queues, created lazily on first reference.
///
/// Queue lifetime is not tied to the connection record: a queue created
/// by an early SEND survives until broker shutdown, so a late
/// subscriber still observes already-enqueued messages.
pub struct MessageStore {
    queues: Mutex<HashMap<Id, Arc<MessageQueue>>>,
    capacity: usize,
}

impl MessageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Get the queue for `recipient_id`, creating it if needed.
    pub async fn get_or_create(&self, recipient_id: &Id) -> Arc<MessageQueue> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(recipient_id.clone())
            .or_insert_with(|| Arc::new(MessageQueue::new(self.capacity)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message(n: u8) -> Message {
        Message {
            id: Id(vec![n]),
            timestamp: SystemTime::now(),
            body: vec![b'm', n],
        }
    }

    #[tokio::test]
    async fn test_write_and_peek_order() {
        let queue = MessageQueue::new(10);

        queue.write(message(1)).await.unwrap();
        queue.write(message(2)).await.unwrap();

        // Peek does not remove
        assert_eq!(queue.try_peek().await.unwrap().id, Id(vec![1]));
        assert_eq!(queue.try_peek().await.unwrap().id, Id(vec![1]));
        assert_eq!(queue.len().await, 2);

        // Del-peek consumes the head and exposes the next
        assert_eq!(queue.try_del_peek().await.unwrap().id, Id(vec![2]));
        assert_eq!(queue.try_del_peek().await, None);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_write_quota() {
        let queue = MessageQueue::new(2);

        queue.write(message(1)).await.unwrap();
        queue.write(message(2)).await.unwrap();
        assert_eq!(queue.write(message(3)).await, Err(ErrorKind::Quota));

        // Earlier messages are untouched by the rejected write
        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.try_peek().await.unwrap().id, Id(vec![1]));
    }

    #[tokio::test]
    async fn test_peek_blocking_wakes_on_write() {
        let queue = Arc::new(MessageQueue::new(10));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.peek_blocking().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.write(message(7)).await.unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .unwrap();
        assert_eq!(delivered.id, Id(vec![7]));

        // The message was peeked, not consumed
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_peek_blocking_returns_immediately_when_nonempty() {
        let queue = MessageQueue::new(10);
        queue.write(message(1)).await.unwrap();

        let delivered = tokio::time::timeout(Duration::from_millis(100), queue.peek_blocking())
            .await
            .expect("should not block");
        assert_eq!(delivered.id, Id(vec![1]));
    }

    #[tokio::test]
    async fn test_store_creates_queues_lazily() {
        let store = MessageStore::new(10);
        let rid = Id(vec![1, 2, 3]);

        let a = store.get_or_create(&rid).await;
        a.write(message(1)).await.unwrap();

        // Same queue on the next reference
        let b = store.get_or_create(&rid).await;
        assert_eq!(b.len().await, 1);

        // Different id, different queue
        let c = store.get_or_create(&Id(vec![9])).await;
        assert!(c.is_empty().await);
    }

    #[test]
    fn test_transmission_round_trip() {
        let t = Transmission {
            signature: b"sig".to_vec(),
            conn_id: Id(vec![0xab, 0xcd]),
            command: Command::Send {
                body: b"hello".to_vec(),
            },
        };

        let bytes = t.to_bytes().unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');

        let parsed = Transmission::from_bytes(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn test_transmission_hex_fields() {
        let t = Transmission::broker(
            Id(vec![0xab]),
            Command::Err {
                kind: ErrorKind::Auth,
            },
        );

        let json = String::from_utf8(t.to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"conn_id\":\"ab\""));
        assert!(json.contains("\"signature\":\"\""));
        assert!(json.contains("\"auth\""));
    }

    #[test]
    fn test_malformed_transmission() {
        assert!(Transmission::from_bytes(b"not json").is_err());
        assert!(Transmission::from_bytes(b"{\"signature\":\"zz\"}").is_err());
    }

    #[test]
    fn test_broker_origin_commands() {
        assert!(Command::Ok.is_broker_origin());
        assert!(Command::End.is_broker_origin());
        assert!(!Command::Sub.is_broker_origin());
        assert!(!Command::Send { body: vec![] }.is_broker_origin());
    }
}
