/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-memory users, rooms and per-room routing of signal envelopes.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use meshroom_protocol::{Recipient, SignalBody, SignalEnvelope};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 6;

pub fn gen_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect()
}

fn unique_id(taken: impl Fn(&str) -> bool) -> String {
    loop {
        let id = gen_id();
        if !taken(&id) {
            return id;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    UnknownRoom,
    Full,
}

struct Member {
    conn_id: u64,
    name: String,
    tx: mpsc::Sender<String>,
}

struct Room {
    members: BTreeMap<String, Member>,
    // set while nobody is in the room
    idle_since: Option<Instant>,
}

impl Room {
    fn new() -> Self {
        Self {
            members: BTreeMap::new(),
            idle_since: Some(Instant::now()),
        }
    }
}

/// Registered users live for the whole process; rooms are dropped by [`Rooms::sweep_idle`]
/// once they stayed empty long enough.
pub struct Rooms {
    max_members: usize,
    next_conn: u64,
    users: HashMap<String, String>,
    rooms: HashMap<String, Room>,
}

impl Rooms {
    pub fn new(max_members: usize) -> Self {
        Self {
            max_members,
            next_conn: 1,
            users: HashMap::new(),
            rooms: HashMap::new(),
        }
    }

    pub fn register_user(&mut self, name: &str) -> String {
        let id = unique_id(|id| self.users.contains_key(id));
        self.users.insert(id.clone(), name.to_string());
        id
    }

    pub fn create_room(&mut self, owner: &str, name: &str) -> String {
        let id = unique_id(|id| self.rooms.contains_key(id));
        debug!(room = %id, owner = %owner, name = %name, "room created");
        self.rooms.insert(id.clone(), Room::new());
        id
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Member ids in sorted order; `None` for an unknown room.
    pub fn members(&self, room_id: &str) -> Option<Vec<String>> {
        self.rooms
            .get(room_id)
            .map(|r| r.members.keys().cloned().collect())
    }

    /// Whether `user_id` could join right now. A user already present replaces itself,
    /// so it never counts against the limit.
    pub fn check_join(&self, room_id: &str, user_id: &str) -> Result<(), JoinError> {
        let room = self.rooms.get(room_id).ok_or(JoinError::UnknownRoom)?;
        if !room.members.contains_key(user_id) && room.members.len() >= self.max_members {
            return Err(JoinError::Full);
        }
        Ok(())
    }

    /// Adds the member and returns its connection id. An earlier socket for the same
    /// user is dropped from the room, which ends its writer.
    pub fn join(
        &mut self,
        room_id: &str,
        user_id: &str,
        name: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<u64, JoinError> {
        self.check_join(room_id, user_id)?;
        let conn_id = self.next_conn;
        self.next_conn += 1;
        let room = self.rooms.get_mut(room_id).ok_or(JoinError::UnknownRoom)?;
        room.idle_since = None;
        let prev = room.members.insert(
            user_id.to_string(),
            Member {
                conn_id,
                name: name.to_string(),
                tx,
            },
        );
        if let Some(prev) = prev {
            debug!(room = %room_id, user = %user_id, old = prev.conn_id, "member socket replaced");
        }
        Ok(conn_id)
    }

    /// Removes the member only if `conn_id` is still its current socket.
    pub fn leave(&mut self, room_id: &str, user_id: &str, conn_id: u64) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        match room.members.get(user_id) {
            Some(m) if m.conn_id == conn_id => {
                room.members.remove(user_id);
                if room.members.is_empty() {
                    room.idle_since = Some(Instant::now());
                }
                true
            }
            _ => false,
        }
    }

    pub fn display_name(&self, room_id: &str, user_id: &str) -> Option<String> {
        self.rooms
            .get(room_id)?
            .members
            .get(user_id)
            .map(|m| m.name.clone())
    }

    /// Stamps `env` with the sender and room, then queues it on every recipient's outbox.
    /// Returns how many outboxes accepted it.
    pub fn route(&self, room_id: &str, from: &str, mut env: SignalEnvelope) -> usize {
        let Some(room) = self.rooms.get(room_id) else {
            return 0;
        };
        env.from = from.to_string();
        env.room_id = room_id.to_string();
        let targets = recipients(room.members.keys().map(String::as_str), from, &env.to);
        if targets.is_empty() {
            debug!(room = %room_id, from = %from, kind = env.kind(), "no recipient");
            return 0;
        }
        let text = match serde_json::to_string(&env) {
            Ok(t) => t,
            Err(e) => {
                warn!(room = %room_id, from = %from, "serialize envelope failed: {e}");
                return 0;
            }
        };
        let mut delivered = 0;
        for id in targets {
            let Some(member) = room.members.get(&id) else {
                continue;
            };
            match member.tx.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(room = %room_id, to = %id, "outbox rejected envelope: {e}"),
            }
        }
        delivered
    }

    /// Announces that `user_id` left to everyone still in the room.
    pub fn broadcast_leave(&self, room_id: &str, user_id: &str) -> usize {
        let env = SignalEnvelope::new(room_id, user_id, Recipient::All, SignalBody::Leave);
        self.route(room_id, user_id, env)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Drops rooms that have been empty for at least `ttl` as of `now`. Returns how many
    /// went away.
    pub fn sweep_idle(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|id, room| {
            let expired = room.members.is_empty()
                && room
                    .idle_since
                    .is_some_and(|t| now.saturating_duration_since(t) >= ttl);
            if expired {
                debug!(room = %id, "idle room dropped");
            }
            !expired
        });
        before - self.rooms.len()
    }
}

/// Member ids an envelope from `from` addressed to `to` is delivered to. The sender never
/// receives its own envelopes.
pub fn recipients<'a>(
    members: impl IntoIterator<Item = &'a str>,
    from: &str,
    to: &Recipient,
) -> Vec<String> {
    members
        .into_iter()
        .filter(|id| *id != from && to.is_for(id))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshroom_protocol::SessionDescription;

    fn room_with(rooms: &mut Rooms, users: &[&str]) -> (String, Vec<mpsc::Receiver<String>>) {
        let id = rooms.create_room("owner", "standup");
        let rxs = users
            .iter()
            .map(|u| {
                let (tx, rx) = mpsc::channel(8);
                rooms.join(&id, u, u, tx).unwrap();
                rx
            })
            .collect();
        (id, rxs)
    }

    #[test]
    fn ids_are_six_lowercase_alphanumerics() {
        for _ in 0..50 {
            let id = gen_id();
            assert_eq!(id.len(), 6);
            assert!(id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn recipients_skip_sender_and_honor_direct_target() {
        let members = ["alice", "bob", "carol"];
        assert_eq!(
            recipients(members, "alice", &Recipient::All),
            vec!["bob", "carol"]
        );
        assert_eq!(
            recipients(members, "alice", &Recipient::Peer("carol".into())),
            vec!["carol"]
        );
        assert!(recipients(members, "alice", &Recipient::Peer("alice".into())).is_empty());
        assert!(recipients(members, "alice", &Recipient::Peer("dave".into())).is_empty());
    }

    #[test]
    fn route_stamps_sender_and_room() {
        let mut rooms = Rooms::new(4);
        let (id, mut rxs) = room_with(&mut rooms, &["alice", "bob"]);
        let forged = SignalEnvelope::to_peer(
            "elsewhere",
            "mallory",
            "bob",
            SignalBody::Offer(SessionDescription::offer("O1")),
        );
        assert_eq!(rooms.route(&id, "alice", forged), 1);

        let text = rxs[1].try_recv().unwrap();
        let env: SignalEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(env.from, "alice");
        assert_eq!(env.room_id, id);
        assert!(rxs[0].try_recv().is_err());
    }

    #[test]
    fn full_room_rejects_newcomers_but_not_rejoins() {
        let mut rooms = Rooms::new(2);
        let (id, _rxs) = room_with(&mut rooms, &["alice", "bob"]);
        assert_eq!(rooms.check_join(&id, "carol"), Err(JoinError::Full));
        assert_eq!(rooms.check_join(&id, "bob"), Ok(()));
        assert_eq!(rooms.check_join("nope", "bob"), Err(JoinError::UnknownRoom));
    }

    #[test]
    fn replaced_socket_cannot_remove_its_successor() {
        let mut rooms = Rooms::new(4);
        let id = rooms.create_room("owner", "standup");
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        let first = rooms.join(&id, "alice", "Alice", tx1).unwrap();
        let second = rooms.join(&id, "alice", "Alice", tx2).unwrap();
        assert_ne!(first, second);
        // first outbox sender was dropped with the replaced member
        assert!(matches!(
            rx1.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        assert!(!rooms.leave(&id, "alice", first));
        assert_eq!(rooms.members(&id).unwrap(), vec!["alice"]);
        assert!(rooms.leave(&id, "alice", second));
        assert!(rooms.members(&id).unwrap().is_empty());
    }

    #[test]
    fn leave_is_broadcast_to_the_rest() {
        let mut rooms = Rooms::new(4);
        let (id, mut rxs) = room_with(&mut rooms, &["alice", "bob", "carol"]);
        assert_eq!(rooms.broadcast_leave(&id, "bob"), 2);
        let (head, tail) = rxs.split_at_mut(2);
        for rx in [&mut head[0], &mut tail[0]] {
            let env: SignalEnvelope = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(env.body, SignalBody::Leave);
            assert_eq!(env.from, "bob");
        }
    }

    #[test]
    fn registered_users_get_distinct_ids() {
        let mut rooms = Rooms::new(4);
        let a = rooms.register_user("Alice");
        let b = rooms.register_user("Alice");
        assert_ne!(a, b);
        let room = rooms.create_room(&a, "standup");
        assert!(rooms.contains(&room));
        assert_eq!(rooms.members(&room), Some(Vec::new()));
        assert_eq!(rooms.room_count(), 1);
    }

    #[test]
    fn only_rooms_empty_past_ttl_are_swept() {
        let ttl = Duration::from_secs(600);
        let mut rooms = Rooms::new(4);
        let empty = rooms.create_room("owner", "empty");
        let (busy, _rxs) = room_with(&mut rooms, &["alice"]);
        let start = Instant::now();

        assert_eq!(rooms.sweep_idle(start, ttl), 0);
        let later = start + ttl + Duration::from_secs(1);
        assert_eq!(rooms.sweep_idle(later, ttl), 1);
        assert!(!rooms.contains(&empty));
        assert!(rooms.contains(&busy));

        // an emptied room starts its idle clock at the last leave
        let solo = rooms.create_room("owner", "solo");
        let (tx, _rx) = mpsc::channel(8);
        let conn = rooms.join(&solo, "carol", "Carol", tx).unwrap();
        assert_eq!(rooms.sweep_idle(later + ttl, ttl), 0);
        assert!(rooms.leave(&solo, "carol", conn));
        let left = Instant::now();
        assert_eq!(rooms.sweep_idle(left + ttl - Duration::from_secs(1), ttl), 0);
        assert_eq!(rooms.sweep_idle(left + ttl + Duration::from_secs(1), ttl), 1);
        assert!(rooms.contains(&busy));
    }
}
