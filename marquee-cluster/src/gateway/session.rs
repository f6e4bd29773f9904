use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures_util::Stream;
use marquee_core::{Id, RoomCode, ServerMessage};
use parking_lot::Mutex;
use thiserror::Error;

pub type SessionId = Id<Session>;

/// The identity a session assumes when it creates or joins a room.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub user_id: String,
    pub username: String,
}

/// One client's live connection to this node.
///
/// A session is bound to at most one room at a time; the binding is
/// dropped on leave or disconnect.
pub struct Session {
    pub id: SessionId,
    identity: Mutex<Option<SessionIdentity>>,
    bound_room: Mutex<Option<RoomCode>>,
    outbox: Outbox,
}

impl Session {
    pub fn new(outbox_cap: usize) -> Self {
        Self {
            id: SessionId::next(),
            identity: Mutex::new(None),
            bound_room: Mutex::new(None),
            outbox: Outbox::new(outbox_cap),
        }
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.identity.lock().clone()
    }

    pub fn set_identity(&self, identity: SessionIdentity) {
        *self.identity.lock() = Some(identity);
    }

    pub fn bound_room(&self) -> Option<RoomCode> {
        self.bound_room.lock().clone()
    }

    pub fn bind(&self, code: RoomCode) {
        *self.bound_room.lock() = Some(code);
    }

    /// Drops the room binding, returning the code it held.
    pub fn unbind(&self) -> Option<RoomCode> {
        self.bound_room.lock().take()
    }

    /// Queues a message for the client, applying the backpressure policy.
    pub fn push(&self, message: ServerMessage) -> Result<(), SessionClosed> {
        self.outbox.push(message)
    }

    pub fn close(&self) {
        self.outbox.close()
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    /// The stream the connection task drains into the socket.
    pub fn stream(&self) -> OutboxStream {
        self.outbox.stream()
    }
}

/// The session's send buffer could not take a message that must not be
/// dropped; the session is now closed.
#[derive(Debug, Error)]
#[error("session outbox overflowed")]
pub struct SessionClosed;

/// The buffered outbound half of a session.
///
/// State updates are idempotent, so once the buffer is full the oldest
/// one makes way for anything newer. Messages that must reach the client
/// close the whole session instead when no state update can be evicted.
struct Outbox {
    cap: usize,
    queue: Arc<Mutex<VecDeque<ServerMessage>>>,
    waker: Arc<Mutex<Option<Waker>>>,
    closed: Arc<AtomicBool>,
}

impl Outbox {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            queue: Default::default(),
            waker: Default::default(),
            closed: Default::default(),
        }
    }

    fn push(&self, message: ServerMessage) -> Result<(), SessionClosed> {
        if self.is_closed() {
            return Err(SessionClosed);
        }

        let mut queue = self.queue.lock();

        if queue.len() >= self.cap {
            let evictable = queue.iter().position(|queued| queued.is_droppable());

            match (evictable, message.is_droppable()) {
                (Some(index), _) => {
                    queue.remove(index);
                }
                // A newer state update loses to a backlog of messages
                // that must all be delivered
                (None, true) => return Ok(()),
                (None, false) => {
                    drop(queue);
                    self.close();
                    return Err(SessionClosed);
                }
            }
        }

        queue.push_back(message);
        drop(queue);
        self.wake();

        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake()
        }
    }

    fn stream(&self) -> OutboxStream {
        OutboxStream {
            queue: self.queue.clone(),
            waker: self.waker.clone(),
            closed: self.closed.clone(),
        }
    }
}

/// Yields queued messages until the session closes and drains.
pub struct OutboxStream {
    queue: Arc<Mutex<VecDeque<ServerMessage>>>,
    waker: Arc<Mutex<Option<Waker>>>,
    closed: Arc<AtomicBool>,
}

impl Stream for OutboxStream {
    type Item = ServerMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Park the waker before looking, so a push between the check and
        // the return cannot slip by unnoticed
        *self.waker.lock() = Some(cx.waker().clone());

        if let Some(message) = self.queue.lock().pop_front() {
            return Poll::Ready(Some(message));
        }

        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn update(revision: u64) -> ServerMessage {
        let mut state = marquee_core::RoomState::new(RoomCode::parse("ABC123").expect("valid"));
        state.created_at = revision;

        ServerMessage::RoomStateUpdate {
            room_code: "ABC123".to_string(),
            room_state: state,
        }
    }

    fn lifecycle() -> ServerMessage {
        ServerMessage::RoomLeft {
            room_code: "ABC123".to_string(),
        }
    }

    fn queued_len(session: &Session) -> usize {
        session.outbox.queue.lock().len()
    }

    #[test]
    fn old_state_updates_make_way_for_new_ones() {
        let session = Session::new(4);

        for revision in 0..10 {
            session.push(update(revision)).expect("state updates never close");
        }

        assert_eq!(queued_len(&session), 4);

        // The survivors are the newest ones
        let queue = session.outbox.queue.lock();
        let first = queue.front().expect("non-empty");

        match first {
            ServerMessage::RoomStateUpdate { room_state, .. } => {
                assert_eq!(room_state.created_at, 6)
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn lifecycle_messages_evict_state_updates_but_never_drop() {
        let session = Session::new(2);

        session.push(update(1)).expect("queues");
        session.push(update(2)).expect("queues");

        session.push(lifecycle()).expect("evicts a state update instead");

        assert_eq!(queued_len(&session), 2);
        assert!(!session.is_closed());
    }

    #[test]
    fn a_backlog_of_undroppable_messages_closes_the_session() {
        let session = Session::new(2);

        session.push(lifecycle()).expect("queues");
        session.push(lifecycle()).expect("queues");

        // A state update is simply skipped
        session.push(update(1)).expect("skipped without closing");
        assert!(!session.is_closed());

        // Another message that must be delivered cannot fit
        assert!(session.push(lifecycle()).is_err());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn the_stream_drains_then_ends_on_close() {
        use futures_util::StreamExt;

        let session = Session::new(8);
        let mut stream = session.stream();

        session.push(lifecycle()).expect("queues");
        session.push(update(1)).expect("queues");
        session.close();

        assert!(matches!(
            stream.next().await,
            Some(ServerMessage::RoomLeft { .. })
        ));
        assert!(matches!(
            stream.next().await,
            Some(ServerMessage::RoomStateUpdate { .. })
        ));
        assert!(stream.next().await.is_none());
    }
}
