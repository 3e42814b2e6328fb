// Client sessions: per-connection fibers and the subscription state machine

use crate::broker::broker::SessionHandle;
use crate::broker::message::{Command, ErrorKind, Id, Message, MessageQueue, PubKey, Transmission};
use crate::broker::server::BrokerState;
use crate::broker::storage::{Party, QueueStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Queue creation retries before giving up on id collisions.
const MAX_CREATE_ATTEMPTS: usize = 3;

/// Lifecycle of a subscription's one-shot background waiter.
///
/// `Pending` closes the window between deciding to fork the waiter and
/// recording its handle; it guarantees at most one waiter is ever live
/// per (session, queue).
enum SubThread {
    Idle,
    Pending,
    Running(JoinHandle<()>),
}

/// Per-queue subscription state within one session.
struct Subscription {
    /// Set while a delivered message awaits ACK; at most one
    /// unacknowledged MSG is ever outstanding per queue.
    delivered: bool,
    sub_thread: SubThread,
}

impl Subscription {
    fn new() -> Self {
        Self {
            delivered: false,
            sub_thread: SubThread::Idle,
        }
    }
}

/// Session state shared between the process fiber and waiter fibers.
struct SessionShared {
    session_id: String,
    state: Arc<BrokerState>,
    subscriptions: Mutex<HashMap<Id, Subscription>>,
    /// Inbound queue sender, handed to the registry so broker pushes
    /// (END) arrive through the session's own pipeline.
    rcv_tx: mpsc::Sender<(Id, Command)>,
    /// Outbound queue towards the send fiber.
    snd_tx: mpsc::Sender<(Id, Command)>,
}

/// A connected client: receive, process, and send fibers over one
/// stream. The fibers live and die together; teardown aborts every
/// subscription waiter and clears the subscription map, leaving the
/// shared stores untouched.
pub struct ClientSession;

impl ClientSession {
    /// Drive one client connection to completion. Returns when the
    /// transport closes or any fiber stops.
    pub async fn run<S>(state: Arc<BrokerState>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let bound = state.config.tbq_size;
        let (rcv_tx, rcv_rx) = mpsc::channel(bound);
        let (snd_tx, snd_rx) = mpsc::channel(bound);

        let shared = Arc::new(SessionShared {
            session_id: Uuid::new_v4().to_string(),
            state,
            subscriptions: Mutex::new(HashMap::new()),
            rcv_tx: rcv_tx.clone(),
            snd_tx,
        });

        tracing::info!(session = %shared.session_id, "client session started");

        let send_task = tokio::spawn(send_loop(write_half, snd_rx));
        let process_task = tokio::spawn(process_loop(shared.clone(), rcv_rx));

        // The receive loop runs inline; it ends on transport loss and on
        // either sibling fiber going away.
        receive_loop(&shared, read_half, rcv_tx).await;

        process_task.abort();
        send_task.abort();

        let mut subscriptions = shared.subscriptions.lock().await;
        for (_, subscription) in subscriptions.drain() {
            if let SubThread::Running(handle) = subscription.sub_thread {
                handle.abort();
            }
        }

        tracing::info!(session = %shared.session_id, "client session ended");
    }
}

/// Read framed transmissions, verify them, and feed the process fiber.
/// Malformed frames become broker errors on the same path, so they are
/// surfaced over the wire in arrival order.
async fn receive_loop<S>(
    shared: &Arc<SessionShared>,
    read_half: ReadHalf<S>,
    rcv_tx: mpsc::Sender<(Id, Command)>,
) where
    S: AsyncRead,
{
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let item = match Transmission::from_bytes(trimmed.as_bytes()) {
                    Ok(transmission) => {
                        let command =
                            verify_transmission(&shared.state, &transmission, trimmed.as_bytes())
                                .await;
                        (transmission.conn_id, command)
                    }
                    Err(e) => {
                        tracing::warn!(
                            session = %shared.session_id,
                            error = %e,
                            "malformed transmission"
                        );
                        (Id::empty(), Command::err(ErrorKind::Block))
                    }
                };

                if rcv_tx.send(item).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(session = %shared.session_id, error = %e, "transport read failed");
                break;
            }
        }
    }
}

/// Authorize a transmission against the connection record's keys.
///
/// The lookup happens before verification and a missing id collapses to
/// the same AUTH as a bad signature, so nothing leaks about queue
/// existence. `raw` is the framed line handed to the verifier.
async fn verify_transmission(state: &BrokerState, t: &Transmission, raw: &[u8]) -> Command {
    // Broker-origin commands are never accepted from clients.
    if t.command.is_broker_origin() {
        return Command::err(ErrorKind::Internal);
    }

    match &t.command {
        // Queue creation carries its own key; nothing to check against yet.
        Command::Conn { .. } => t.command.clone(),

        Command::Sub | Command::Key { .. } | Command::Off | Command::Del | Command::Ack => {
            match state.connections.get(Party::Recipient, &t.conn_id).await {
                Ok(connection)
                    if state
                        .verifier
                        .verify(&t.signature, raw, &connection.recipient_key) =>
                {
                    t.command.clone()
                }
                _ => Command::err(ErrorKind::Auth),
            }
        }

        Command::Send { .. } => match state.connections.get(Party::Sender, &t.conn_id).await {
            Ok(connection) => {
                let authorized = match &connection.sender_key {
                    Some(key) => state.verifier.verify(&t.signature, raw, key),
                    // Unsecured queue: accept only unsigned sends.
                    None => t.signature.is_empty(),
                };
                if authorized {
                    t.command.clone()
                } else {
                    Command::err(ErrorKind::Auth)
                }
            }
            Err(_) => Command::err(ErrorKind::Auth),
        },

        // Broker-origin variants were rejected above.
        _ => Command::err(ErrorKind::Internal),
    }
}

/// Dispatch verified commands and broker pushes in arrival order.
async fn process_loop(shared: Arc<SessionShared>, mut rcv_rx: mpsc::Receiver<(Id, Command)>) {
    while let Some((conn_id, command)) = rcv_rx.recv().await {
        let response = match command {
            Command::Conn { recipient_key } => create_queue(&shared, recipient_key).await,
            Command::Sub => subscribe(&shared, &conn_id).await,
            Command::Key { sender_key } => {
                let reply = match shared.state.connections.secure(&conn_id, sender_key).await {
                    Ok(()) => Command::Ok,
                    Err(kind) => Command::err(kind),
                };
                (conn_id, reply)
            }
            Command::Off => {
                let reply = match shared.state.connections.suspend(&conn_id).await {
                    Ok(()) => Command::Ok,
                    Err(kind) => Command::err(kind),
                };
                (conn_id, reply)
            }
            Command::Del => {
                let reply = match shared.state.connections.delete(&conn_id).await {
                    Ok(()) => {
                        // The deleting session must see no further MSG
                        // for this queue.
                        end_subscription(&shared, &conn_id).await;
                        Command::Ok
                    }
                    Err(kind) => Command::err(kind),
                };
                (conn_id, reply)
            }
            Command::Ack => acknowledge(&shared, &conn_id).await,
            Command::Send { body } => send_message(&shared, &conn_id, body).await,
            // Displacement: drop the subscription and pass END through.
            Command::End => {
                end_subscription(&shared, &conn_id).await;
                (conn_id, Command::End)
            }
            // Verification errors from the receive fiber.
            Command::Err { kind } => (conn_id, Command::err(kind)),
            // Remaining broker-origin commands never reach this queue.
            Command::Ids { .. } | Command::Msg { .. } | Command::Ok => {
                (conn_id, Command::err(ErrorKind::Internal))
            }
        };

        if shared.snd_tx.send(response).await.is_err() {
            break;
        }
    }
}

/// Drain the outbound queue onto the transport.
async fn send_loop<S>(mut write_half: WriteHalf<S>, mut snd_rx: mpsc::Receiver<(Id, Command)>)
where
    S: AsyncWrite,
{
    while let Some((conn_id, command)) = snd_rx.recv().await {
        let frame = Transmission::broker(conn_id, command);
        match frame.to_bytes() {
            Ok(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to encode transmission");
            }
        }
    }
}

/// CONN: install a connection under fresh ids, retrying on collisions,
/// and subscribe the creator to its own queue.
async fn create_queue(shared: &Arc<SessionShared>, recipient_key: PubKey) -> (Id, Command) {
    let state = &shared.state;

    for _ in 0..MAX_CREATE_ATTEMPTS {
        let recipient_id = state.ids.fresh(state.config.queue_id_bytes).await;
        let sender_id = state.ids.fresh(state.config.queue_id_bytes).await;

        match state
            .connections
            .add(recipient_key.clone(), recipient_id.clone(), sender_id.clone())
            .await
        {
            Ok(()) => {
                tracing::info!(
                    session = %shared.session_id,
                    recipient_id = %recipient_id,
                    "queue created"
                );
                // The creator is its queue's subscriber from the start;
                // the interim OK from the subscribe path is dropped in
                // favour of the IDS reply.
                subscribe(shared, &recipient_id).await;
                return (
                    recipient_id.clone(),
                    Command::Ids {
                        recipient_id,
                        sender_id,
                    },
                );
            }
            Err(ErrorKind::Duplicate) => continue,
            Err(kind) => return (Id::empty(), Command::err(kind)),
        }
    }

    tracing::error!(session = %shared.session_id, "exhausted queue id retries");
    (Id::empty(), Command::err(ErrorKind::Internal))
}

/// SUB: claim the queue in the registry on first subscribe; on
/// re-subscribe just free the delivery latch. Either way, try to hand
/// over the queue head.
async fn subscribe(shared: &Arc<SessionShared>, recipient_id: &Id) -> (Id, Command) {
    let already_subscribed = {
        let mut subscriptions = shared.subscriptions.lock().await;
        match subscriptions.get_mut(recipient_id) {
            Some(subscription) => {
                subscription.delivered = false;
                true
            }
            None => false,
        }
    };

    if !already_subscribed {
        let handle = SessionHandle {
            session_id: shared.session_id.clone(),
            rcv_tx: shared.rcv_tx.clone(),
        };
        if let Err(e) = shared.state.registry.subscribe(recipient_id.clone(), handle).await {
            tracing::error!(session = %shared.session_id, error = %e, "registry unavailable");
            return (recipient_id.clone(), Command::err(ErrorKind::Internal));
        }
        shared
            .subscriptions
            .lock()
            .await
            .insert(recipient_id.clone(), Subscription::new());
    }

    deliver_message(shared, recipient_id, PeekOp::Peek).await
}

/// ACK: drain the delivery latch, consume the acked head, and try to
/// hand over the next message.
async fn acknowledge(shared: &Arc<SessionShared>, recipient_id: &Id) -> (Id, Command) {
    {
        let mut subscriptions = shared.subscriptions.lock().await;
        match subscriptions.get_mut(recipient_id) {
            Some(subscription) if subscription.delivered => subscription.delivered = false,
            _ => return (recipient_id.clone(), Command::err(ErrorKind::Prohibited)),
        }
    }

    deliver_message(shared, recipient_id, PeekOp::DelPeek).await
}

/// SEND: enqueue a message for an active queue.
async fn send_message(shared: &Arc<SessionShared>, sender_id: &Id, body: Vec<u8>) -> (Id, Command) {
    let state = &shared.state;

    // Authorization already ran in the receive fiber; this lookup routes
    // the message and re-checks the queue state.
    let connection = match state.connections.get(Party::Sender, sender_id).await {
        Ok(connection) => connection,
        Err(kind) => return (sender_id.clone(), Command::err(kind)),
    };
    if connection.status == QueueStatus::Off {
        return (sender_id.clone(), Command::err(ErrorKind::Auth));
    }

    let message = Message {
        id: state.ids.fresh(state.config.msg_id_bytes).await,
        timestamp: SystemTime::now(),
        body,
    };

    let queue = state.queues.get_or_create(&connection.recipient_id).await;
    match queue.write(message).await {
        Ok(()) => (sender_id.clone(), Command::Ok),
        Err(kind) => (sender_id.clone(), Command::err(kind)),
    }
}

/// Drop the subscription for `recipient_id`, killing its waiter if one
/// is live. Used for displacement (END) and queue deletion.
async fn end_subscription(shared: &Arc<SessionShared>, recipient_id: &Id) {
    let mut subscriptions = shared.subscriptions.lock().await;
    if let Some(subscription) = subscriptions.remove(recipient_id) {
        if let SubThread::Running(handle) = subscription.sub_thread {
            handle.abort();
        }
    }
}

/// Which head read `deliver_message` performs.
enum PeekOp {
    Peek,
    DelPeek,
}

/// Hand the queue head to the client if one is ready; otherwise make
/// sure a single waiter fiber is watching the queue.
async fn deliver_message(
    shared: &Arc<SessionShared>,
    recipient_id: &Id,
    op: PeekOp,
) -> (Id, Command) {
    let queue = shared.state.queues.get_or_create(recipient_id).await;
    let head = match op {
        PeekOp::Peek => queue.try_peek().await,
        PeekOp::DelPeek => queue.try_del_peek().await,
    };

    if let Some(message) = head {
        let mut subscriptions = shared.subscriptions.lock().await;
        if let Some(subscription) = subscriptions.get_mut(recipient_id) {
            subscription.delivered = true;
        }
        return (recipient_id.clone(), msg_command(message));
    }

    // Empty queue: fork the one-shot waiter unless one is already up.
    let should_fork = {
        let mut subscriptions = shared.subscriptions.lock().await;
        match subscriptions.get_mut(recipient_id) {
            Some(subscription) if matches!(subscription.sub_thread, SubThread::Idle) => {
                subscription.sub_thread = SubThread::Pending;
                true
            }
            _ => false,
        }
    };

    if should_fork {
        let handle = tokio::spawn(subscriber_fiber(
            shared.clone(),
            recipient_id.clone(),
            queue,
        ));

        let mut subscriptions = shared.subscriptions.lock().await;
        match subscriptions.get_mut(recipient_id) {
            Some(subscription) if matches!(subscription.sub_thread, SubThread::Pending) => {
                subscription.sub_thread = SubThread::Running(handle);
            }
            // The subscription was displaced or deleted while forking;
            // the waiter must not outlive it.
            _ => handle.abort(),
        }
    }

    (recipient_id.clone(), Command::Ok)
}

/// Waiter fiber: blocks until the queue has a head, pushes it to the
/// client, and retires. At most one exists per (session, queue).
async fn subscriber_fiber(shared: Arc<SessionShared>, recipient_id: Id, queue: Arc<MessageQueue>) {
    loop {
        queue.peek_blocking().await;

        // Reserve outbound capacity before touching subscription state,
        // so the push and the latch change are observed together.
        let permit = match shared.snd_tx.reserve().await {
            Ok(permit) => permit,
            Err(_) => return, // session is shutting down
        };

        let mut subscriptions = shared.subscriptions.lock().await;
        let subscription = match subscriptions.get_mut(&recipient_id) {
            Some(subscription) => subscription,
            None => return, // unsubscribed while waiting
        };

        // A re-subscribe may have handed the head over while this fiber
        // was waking up; the latch keeps delivery single, and the
        // outstanding ACK will drive the next step.
        if subscription.delivered {
            subscription.sub_thread = SubThread::Idle;
            return;
        }

        // Re-read the head under the latch: the message that woke this
        // fiber may have been consumed by an ACK in the meantime.
        match queue.try_peek().await {
            Some(message) => {
                subscription.sub_thread = SubThread::Idle;
                subscription.delivered = true;
                permit.send((recipient_id.clone(), msg_command(message)));
                return;
            }
            None => {
                drop(subscriptions);
                continue;
            }
        }
    }
}

fn msg_command(message: Message) -> Command {
    Command::Msg {
        msg_id: message.id,
        timestamp: message.timestamp,
        body: message.body,
    }
}
