use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::history::ChatHistory;

pub type SessionId = u64;

/// Queued outbound items a member may fall behind by before it is dropped.
pub const OUTBOX_CAPACITY: usize = 256;

/// One item on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Line(String),
    /// A room's history, queued as one item so replay never counts against
    /// the member's backlog.
    History(Vec<String>),
}

/// Bounded queue drained by a connection's writer task.
pub type Outbox = mpsc::Sender<Outbound>;

/// Resolves once the registry no longer holds the session, whether it left,
/// was replaced by a newer registration, or was dropped for lagging.
pub type RemovalSignal = oneshot::Receiver<()>;

/// A registered session as the registry sees it.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub username: String,
    outbox: Outbox,
    // Dropped together with the handle, which is what resolves the
    // session's `RemovalSignal`.
    _registered: oneshot::Sender<()>,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        username: impl Into<String>,
        outbox: Outbox,
    ) -> (Self, RemovalSignal) {
        let (registered, removal) = oneshot::channel();
        let handle = Self {
            id,
            username: username.into(),
            outbox,
            _registered: registered,
        };
        (handle, removal)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Rooms a stale session with the same username was removed from.
    pub evicted_from: Vec<String>,
    /// Number of history lines queued for the new member.
    pub replayed: usize,
}

/// Room name to ordered members, plus each room's chat history.
///
/// All mutation goes through one lock. The lock is never held across an
/// `.await`: delivery only enqueues onto each member's [`Outbox`], so holding
/// it for a whole join (evict, replay, insert) is cheap and keeps replayed
/// history ahead of any broadcast that happens after the join. A member whose
/// outbox is full is removed rather than waited on.
pub struct RoomRegistry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

struct RegistryState {
    rooms: HashMap<String, Vec<SessionHandle>>,
    history: ChatHistory,
}

impl RoomRegistry {
    pub fn new(history_limit: Option<usize>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                rooms: HashMap::new(),
                history: ChatHistory::new(history_limit),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds `session` to `room`, first evicting any session already registered
    /// under the same username, then replays the room's history to it.
    pub fn join(&self, session: SessionHandle, room: &str) -> JoinOutcome {
        let mut state = self.lock();
        let evicted_from = state.evict_username(&session.username);
        let replayed = state.replay_history(room, &session.outbox);
        state
            .rooms
            .entry(room.to_string())
            .or_default()
            .push(session);

        JoinOutcome {
            evicted_from,
            replayed,
        }
    }

    /// Removes the session, returning the room it left. A no-op for sessions
    /// that are not registered.
    pub fn leave(&self, id: SessionId) -> Option<String> {
        self.lock().remove(id)
    }

    /// Logs `message` in the room's history and queues it for every member,
    /// the sender included. Returns how many members it was queued for.
    pub fn broadcast(&self, room: &str, message: impl Into<String>) -> usize {
        self.lock().broadcast(room, message.into())
    }

    /// Broadcasts into the room session `id` currently belongs to. Returns
    /// `None`, and sends nothing, once the session is no longer registered.
    pub fn broadcast_as(&self, id: SessionId, message: impl Into<String>) -> Option<usize> {
        let mut state = self.lock();
        let room = state.room_of(id)?.to_string();
        Some(state.broadcast(&room, message.into()))
    }

    pub fn replay_history(&self, room: &str, outbox: &Outbox) -> usize {
        self.lock().replay_history(room, outbox)
    }

    pub fn room_of(&self, id: SessionId) -> Option<String> {
        self.lock().room_of(id).map(str::to_string)
    }

    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.lock().rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Usernames in `room`, in join order.
    pub fn members(&self, room: &str) -> Vec<String> {
        self.lock()
            .rooms
            .get(room)
            .map(|members| members.iter().map(|m| m.username.clone()).collect())
            .unwrap_or_default()
    }

    pub fn history(&self, room: &str) -> Vec<String> {
        self.lock()
            .history
            .replay(room)
            .map(str::to_string)
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Every critical section leaves the maps consistent, so a panic
        // elsewhere does not invalidate them.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RegistryState {
    fn room_of(&self, id: SessionId) -> Option<&str> {
        self.rooms
            .iter()
            .find(|(_, members)| members.iter().any(|member| member.id == id))
            .map(|(room, _)| room.as_str())
    }

    fn evict_username(&mut self, username: &str) -> Vec<String> {
        let stale: Vec<SessionId> = self
            .rooms
            .values()
            .flatten()
            .filter(|member| member.username == username)
            .map(|member| member.id)
            .collect();

        stale.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Drops the session and logs its departure in the room it left. The
    /// notice is recorded even when the room empties, so later joiners see
    /// it on replay.
    fn remove(&mut self, id: SessionId) -> Option<String> {
        let room = self.room_of(id)?.to_string();
        let members = self.rooms.get_mut(&room)?;
        let position = members.iter().position(|member| member.id == id)?;
        let SessionHandle { username, .. } = members.remove(position);

        self.broadcast(&room, format!("{username} has left the room."));
        if self.rooms.get(&room).is_some_and(Vec::is_empty) {
            self.rooms.remove(&room);
        }

        Some(room)
    }

    fn broadcast(&mut self, room: &str, message: String) -> usize {
        self.history.append(room, message.clone());

        let mut delivered = 0;
        let mut lagging = Vec::new();
        if let Some(members) = self.rooms.get(room) {
            for member in members {
                match member.outbox.try_send(Outbound::Line(message.clone())) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => lagging.push(member.id),
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(room, username = %member.username, "member outbox closed")
                    }
                }
            }
        }

        for id in lagging {
            warn!(room, session = id, "dropping member that stopped reading");
            self.remove(id);
        }
        delivered
    }

    fn replay_history(&self, room: &str, outbox: &Outbox) -> usize {
        let lines: Vec<String> = self.history.replay(room).map(str::to_string).collect();
        if lines.is_empty() {
            return 0;
        }

        let replayed = lines.len();
        match outbox.try_send(Outbound::History(lines)) {
            Ok(()) => replayed,
            Err(err) => {
                debug!(room, error = %err, "could not queue history replay");
                0
            }
        }
    }
}
