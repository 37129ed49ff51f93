use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = String;
pub type ConnectionId = Uuid;

/// A room member as seen by everyone else. `user_id` is the membership key,
/// `display_name` is room-scoped and may change at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub user_id: UserId,
    pub display_name: String,
}

impl UserRef {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        UserRef {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Member {
    user: UserRef,
    connections: HashSet<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// The user was already a member; their entry was refreshed in place.
    Rejoined { previous_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub member: UserRef,
    /// Set when the departing member was host and someone else took over.
    pub new_host: Option<UserRef>,
    pub now_empty: bool,
}

/// Membership of a single room.
///
/// Members are kept in join order, so tenure is the position in the list and
/// the host is always the first entry. A rejoin keeps the original position.
#[derive(Debug, Default, Clone)]
pub struct PresenceLedger {
    members: Vec<Member>,
}

impl PresenceLedger {
    pub fn new() -> Self {
        PresenceLedger::default()
    }

    pub fn join(&mut self, user: UserRef, connection: Option<ConnectionId>) -> JoinOutcome {
        if let Some(member) = self.member_mut(&user.user_id) {
            let previous_name = std::mem::replace(&mut member.user.display_name, user.display_name);
            member.connections.extend(connection);
            return JoinOutcome::Rejoined { previous_name };
        }

        self.members.push(Member {
            user,
            connections: connection.into_iter().collect(),
        });
        JoinOutcome::Joined
    }

    /// Removes the member outright, whatever connections they still hold.
    pub fn leave(&mut self, user_id: &str) -> Option<Departure> {
        let position = self.position(user_id)?;
        Some(self.remove_at(position))
    }

    /// Forgets one transport connection. The member only departs once their
    /// last connection is gone.
    pub fn drop_connection(&mut self, user_id: &str, connection: ConnectionId) -> Option<Departure> {
        let position = self.position(user_id)?;
        let member = &mut self.members[position];

        if !member.connections.remove(&connection) || !member.connections.is_empty() {
            return None;
        }

        Some(self.remove_at(position))
    }

    /// Returns the previous display name, or `None` if the user is not a member.
    pub fn rename(&mut self, user_id: &str, display_name: String) -> Option<String> {
        let member = self.member_mut(user_id)?;
        Some(std::mem::replace(&mut member.user.display_name, display_name))
    }

    pub fn host(&self) -> Option<&UserRef> {
        self.members.first().map(|m| &m.user)
    }

    pub fn get(&self, user_id: &str) -> Option<&UserRef> {
        self.members
            .iter()
            .find(|m| m.user.user_id == user_id)
            .map(|m| &m.user)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.position(user_id).is_some()
    }

    pub fn members(&self) -> Vec<UserRef> {
        self.members.iter().map(|m| m.user.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn position(&self, user_id: &str) -> Option<usize> {
        self.members.iter().position(|m| m.user.user_id == user_id)
    }

    fn member_mut(&mut self, user_id: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.user.user_id == user_id)
    }

    fn remove_at(&mut self, position: usize) -> Departure {
        let member = self.members.remove(position).user;
        let new_host = if position == 0 {
            self.host().cloned()
        } else {
            None
        };

        Departure {
            member,
            new_host,
            now_empty: self.members.is_empty(),
        }
    }
}
