//! Authoritative map from bar id to its live membership.
//!
//! The outer map is only locked long enough to find or insert a room; every
//! membership change then happens under that room's own mutex, so traffic in
//! one bar never waits on another. A room that loses its last member is marked
//! closed under its lock before it is unlinked from the map, which keeps a
//! concurrent join from landing in a room that is about to disappear.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, trace};

use crate::{
    error::RegistryError,
    message::{BarId, BarSummary, MemberId, MemberInfo, Role, ServerToClient},
};

const BAR_ID_LENGTH: usize = 10;

pub type ConnectionId = u64;

/// Write side of one client connection, as seen by everything except its own task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbox: mpsc::Sender<ServerToClient>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbox: mpsc::Sender<ServerToClient>) -> Self {
        Self { id, outbox }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a direct reply, waiting for room in this connection's own outbox.
    pub async fn deliver(&self, message: ServerToClient) -> bool {
        self.outbox.send(message).await.is_ok()
    }

    /// Queues a message without waiting. Returns false if the recipient was skipped.
    pub fn try_deliver(&self, message: ServerToClient) -> bool {
        match self.outbox.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(connection = self.id, "outbox full, skipping recipient");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(connection = self.id, "outbox closed, skipping recipient");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Member {
    pub info: MemberInfo,
    pub connection: ConnectionHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub id: BarId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub members: Vec<MemberInfo>,
}

#[derive(Debug)]
pub struct JoinOutcome {
    /// Everyone in the room after the join, joiner included.
    pub members: Vec<MemberInfo>,
    /// Connections of everyone except the joiner, already sent `user_joined`.
    pub peers: Vec<ConnectionHandle>,
}

#[derive(Debug)]
pub struct LeaveOutcome {
    pub member: MemberInfo,
    pub remaining: Vec<ConnectionHandle>,
    pub room_closed: bool,
}

#[derive(Debug)]
pub struct Audience {
    pub sender: MemberInfo,
    pub recipients: Vec<ConnectionHandle>,
}

struct Room {
    id: BarId,
    title: String,
    created_at: DateTime<Utc>,
    members: HashMap<MemberId, Member>,
    closed: bool,
}

impl Room {
    fn member_infos(&self) -> Vec<MemberInfo> {
        self.members.values().map(|member| member.info.clone()).collect()
    }

    fn connections_except(&self, excluded: Option<&str>) -> Vec<ConnectionHandle> {
        self.members
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != excluded)
            .map(|(_, member)| member.connection.clone())
            .collect()
    }

    /// The member entry for `member_id`, if it is still owned by `connection`.
    fn member_on(&self, member_id: &str, connection: ConnectionId) -> Option<&Member> {
        self.members
            .get(member_id)
            .filter(|member| member.connection.id() == connection)
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            members: self.member_infos(),
        }
    }
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<BarId, Arc<Mutex<Room>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new bar with `creator` as its only member, promoted to host.
    pub async fn create_room(
        &self,
        title: String,
        creator: MemberInfo,
        connection: ConnectionHandle,
    ) -> (BarId, MemberInfo) {
        let host = MemberInfo {
            role: Role::Host,
            ..creator
        };

        let mut rooms = self.rooms.write().await;
        let id = loop {
            let candidate = nanoid::nanoid!(BAR_ID_LENGTH);
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        let mut members = HashMap::new();
        members.insert(
            host.id.clone(),
            Member {
                info: host.clone(),
                connection,
            },
        );

        rooms.insert(
            id.clone(),
            Arc::new(Mutex::new(Room {
                id: id.clone(),
                title,
                created_at: Utc::now(),
                members,
                closed: false,
            })),
        );

        (id, host)
    }

    /// Adds `member` to the room and announces it while the room is still locked.
    ///
    /// The joiner's `joined_bar` is queued before anyone else in the room can
    /// see the new member, so no `user_joined` or chat for this room can reach
    /// the joiner ahead of its member list.
    pub async fn join_room(
        &self,
        room_id: &str,
        member: MemberInfo,
        connection: ConnectionHandle,
    ) -> Result<JoinOutcome, RegistryError> {
        let room = self.room(room_id).await?;
        let mut room = room.lock().await;
        if room.closed {
            return Err(RegistryError::RoomNotFound(room_id.to_string()));
        }

        let member_id = member.id.clone();
        room.members.insert(
            member_id.clone(),
            Member {
                info: member.clone(),
                connection: connection.clone(),
            },
        );

        let users = room
            .members
            .values()
            .filter(|other| other.info.id != member_id)
            .map(|other| other.info.clone())
            .collect();
        connection
            .deliver(ServerToClient::JoinedBar {
                bar_id: room.id.clone(),
                users,
            })
            .await;

        let peers = room.connections_except(Some(&member_id));
        for peer in &peers {
            peer.try_deliver(ServerToClient::UserJoined {
                user: member.clone(),
            });
        }

        Ok(JoinOutcome {
            members: room.member_infos(),
            peers,
        })
    }

    /// Removes a member, but only while `connection` still owns its entry.
    /// Unknown rooms or members are not an error.
    pub async fn leave_room(
        &self,
        room_id: &str,
        member_id: &str,
        connection: ConnectionId,
    ) -> Option<LeaveOutcome> {
        let room = self.room(room_id).await.ok()?;

        let outcome = {
            let mut guard = room.lock().await;
            guard.member_on(member_id, connection)?;
            let member = guard.members.remove(member_id)?;
            let room_closed = guard.members.is_empty();
            guard.closed = room_closed;
            let remaining = guard.connections_except(None);
            for peer in &remaining {
                peer.try_deliver(ServerToClient::UserLeft {
                    user: member.info.clone(),
                });
            }
            LeaveOutcome {
                member: member.info,
                remaining,
                room_closed,
            }
        };

        if outcome.room_closed {
            let mut rooms = self.rooms.write().await;
            if rooms
                .get(room_id)
                .is_some_and(|current| Arc::ptr_eq(current, &room))
            {
                rooms.remove(room_id);
                debug!(bar = room_id, "bar emptied and removed");
            }
        }

        Some(outcome)
    }

    pub async fn list_rooms(&self) -> Vec<BarSummary> {
        let rooms: Vec<_> = self.rooms.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let room = room.lock().await;
            if room.closed {
                continue;
            }
            summaries.push(BarSummary {
                id: room.id.clone(),
                title: room.title.clone(),
                user_count: room.members.len(),
                created_at: room.created_at,
            });
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub async fn get_room(&self, room_id: &str) -> Result<RoomSnapshot, RegistryError> {
        let room = self.room(room_id).await?;
        let room = room.lock().await;
        if room.closed {
            return Err(RegistryError::RoomNotFound(room_id.to_string()));
        }
        Ok(room.snapshot())
    }

    /// Resolves who should receive an event sent by `sender_id` over `connection`.
    pub async fn audience(
        &self,
        room_id: &str,
        sender_id: &str,
        connection: ConnectionId,
        include_sender: bool,
    ) -> Option<Audience> {
        let room = self.room(room_id).await.ok()?;
        let room = room.lock().await;
        let sender = room.member_on(sender_id, connection)?.info.clone();
        let excluded = (!include_sender).then_some(sender_id);
        Some(Audience {
            sender,
            recipients: room.connections_except(excluded),
        })
    }

    /// Records a member's self-reported mute flag and returns the other members to notify.
    pub async fn set_muted(
        &self,
        room_id: &str,
        member_id: &str,
        connection: ConnectionId,
        muted: bool,
    ) -> Vec<ConnectionHandle> {
        let Ok(room) = self.room(room_id).await else {
            return Vec::new();
        };
        let mut room = room.lock().await;
        let owned = room
            .members
            .get_mut(member_id)
            .filter(|member| member.connection.id() == connection);
        match owned {
            Some(member) => {
                member.info.is_muted = muted;
                room.connections_except(Some(member_id))
            }
            None => Vec::new(),
        }
    }

    async fn room(&self, room_id: &str) -> Result<Arc<Mutex<Room>>, RegistryError> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))
    }
}
