//! Client-side mirror of the server's user and channel tables, kept in sync
//! from UserState/ChannelState traffic by the engine task.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::msgs;

pub const ROOT_CHANNEL: u32 = 0;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct User {
    pub session: u32,
    pub name: String,
    /// Registered account id, set for authenticated users.
    pub user_id: Option<u32>,
    pub authenticated: bool,
    pub mute: bool,
    pub deaf: bool,
    pub suppressed: bool,
    pub recording: bool,
    pub channel: u32,
    /// Last address the server reported for this user, if we ever asked.
    pub address: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub parent: Option<u32>,
    pub temporary: bool,
    pub position: i32,
}

/// Users and channels, each under its own lock. The engine's message
/// handlers write; anyone holding the state may read.
#[derive(Debug, Default)]
pub struct ServerState {
    users: Mutex<HashMap<u32, User>>,
    channels: Mutex<HashMap<u32, Channel>>,
    max_message_length: Mutex<Option<u32>>,
}

impl ServerState {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn user(&self, session: u32) -> Option<User> {
        self.users.lock().unwrap().get(&session).cloned()
    }

    pub fn user_by_name(&self, name: &str) -> Option<User> {
        self.users
            .lock()
            .unwrap()
            .values()
            .find(|u| u.name == name)
            .cloned()
    }

    pub fn users(&self) -> Vec<User> {
        self.users.lock().unwrap().values().cloned().collect()
    }

    pub fn channel(&self, id: u32) -> Option<Channel> {
        self.channels.lock().unwrap().get(&id).cloned()
    }

    pub fn channel_by_name(&self, name: &str) -> Option<Channel> {
        self.channels
            .lock()
            .unwrap()
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels.lock().unwrap().values().cloned().collect()
    }

    pub fn max_message_length(&self) -> Option<u32> {
        *self.max_message_length.lock().unwrap()
    }

    pub fn set_max_message_length(&self, len: u32) {
        *self.max_message_length.lock().unwrap() = Some(len);
    }

    /// Applies a UserState message. A session we have not seen before is
    /// only created when the message carries a name. Returns the user if
    /// this created it, so the engine can fire the join event for sessions
    /// other than our own.
    pub fn update_user(&self, msg: msgs::UserState) -> Option<User> {
        let session = msg.session?;

        let mut users = self.users.lock().unwrap();

        let created = !users.contains_key(&session);
        if created && msg.name.is_none() {
            return None;
        }

        let user = users.entry(session).or_insert_with(|| User {
            session,
            name: String::new(),
            user_id: None,
            authenticated: false,
            mute: false,
            deaf: false,
            suppressed: false,
            recording: false,
            channel: ROOT_CHANNEL,
            address: None,
        });

        if let Some(name) = msg.name {
            user.name = name;
        }

        if let Some(id) = msg.user_id {
            user.user_id = Some(id);
            user.authenticated = true;
        }

        // the self_* flags win when both are present
        if let Some(mute) = msg.mute {
            user.mute = mute;
        }
        if let Some(mute) = msg.self_mute {
            user.mute = mute;
        }
        if let Some(deaf) = msg.deaf {
            user.deaf = deaf;
        }
        if let Some(deaf) = msg.self_deaf {
            user.deaf = deaf;
        }

        if let Some(suppress) = msg.suppress {
            user.suppressed = suppress;
        }
        if let Some(recording) = msg.recording {
            user.recording = recording;
        }

        if let Some(channel_id) = msg.channel_id {
            // a reference to a channel we do not know falls back to root
            let channels = self.channels.lock().unwrap();
            user.channel = if channels.contains_key(&channel_id) {
                channel_id
            } else {
                ROOT_CHANNEL
            };
        }

        if created {
            Some(user.clone())
        } else {
            None
        }
    }

    pub fn remove_user(&self, session: u32) {
        self.users.lock().unwrap().remove(&session);
    }

    /// Records the address from a UserStats answer. The server reports a
    /// 16-byte IPv6-mapped form; the IPv4 address is its last four bytes.
    pub fn set_user_address(&self, session: u32, address: &[u8]) {
        if address.len() < 4 {
            return;
        }

        let mut v4 = [0; 4];
        v4.copy_from_slice(&address[address.len() - 4..]);

        if let Some(user) = self.users.lock().unwrap().get_mut(&session) {
            user.address = Some(Ipv4Addr::from(v4));
        }
    }

    /// Applies a ChannelState message. Unknown channels are created only
    /// for the root or when both a resolvable parent and a name are given.
    pub fn update_channel(&self, msg: msgs::ChannelState) {
        let id = match msg.channel_id {
            Some(id) => id,
            None => return,
        };

        let mut channels = self.channels.lock().unwrap();

        let parent_known = msg.parent.map(|p| channels.contains_key(&p));

        if !channels.contains_key(&id) {
            let may_create =
                id == ROOT_CHANNEL || (parent_known == Some(true) && msg.name.is_some());
            if !may_create {
                return;
            }

            channels.insert(
                id,
                Channel {
                    id,
                    name: String::new(),
                    description: String::new(),
                    parent: None,
                    temporary: msg.temporary.unwrap_or(false),
                    position: 0,
                },
            );
        }

        let channel = match channels.get_mut(&id) {
            Some(channel) => channel,
            None => return,
        };

        if parent_known == Some(true) {
            channel.parent = msg.parent;
        }
        if let Some(name) = msg.name {
            channel.name = name;
        }
        if let Some(description) = msg.description {
            channel.description = description;
        }
        if let Some(position) = msg.position {
            channel.position = position;
        }
    }

    /// Drops a channel. Users pointing at it are not touched here; the
    /// server reassigns them with the next UserState.
    pub fn remove_channel(&self, id: u32) {
        self.channels.lock().unwrap().remove(&id);
    }

    pub fn clear(&self) {
        self.users.lock().unwrap().clear();
        self.channels.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_state(id: u32, parent: Option<u32>, name: Option<&str>) -> msgs::ChannelState {
        msgs::ChannelState {
            channel_id: Some(id),
            parent,
            name: name.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    fn user_state(session: u32, name: Option<&str>) -> msgs::UserState {
        msgs::UserState {
            session: Some(session),
            name: name.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn channel_tree_create_and_remove() {
        let state = ServerState::new();

        state.update_channel(channel_state(0, None, Some("Root")));
        state.update_channel(channel_state(3, Some(0), Some("A")));
        assert_eq!(state.channel(3).unwrap().parent, Some(0));

        state.remove_channel(3);
        assert!(state.channel(3).is_none());
        assert!(state.channel(0).is_some());
        assert_eq!(state.channels().len(), 1);
    }

    #[test]
    fn channel_needs_parent_and_name() {
        let state = ServerState::new();
        state.update_channel(channel_state(0, None, Some("Root")));

        // no parent
        state.update_channel(channel_state(5, None, Some("X")));
        assert!(state.channel(5).is_none());

        // no name
        state.update_channel(channel_state(5, Some(0), None));
        assert!(state.channel(5).is_none());

        // unresolvable parent
        state.update_channel(channel_state(5, Some(99), Some("X")));
        assert!(state.channel(5).is_none());

        state.update_channel(channel_state(5, Some(0), Some("X")));
        assert!(state.channel(5).is_some());
    }

    #[test]
    fn user_needs_name_to_appear() {
        let state = ServerState::new();

        assert!(state.update_user(user_state(9, None)).is_none());
        assert!(state.user(9).is_none());

        let created = state.update_user(user_state(9, Some("bob"))).unwrap();
        assert_eq!(created.name, "bob");

        // second state for the same session is an update, not a join
        assert!(state.update_user(user_state(9, Some("bob2"))).is_none());
        assert_eq!(state.user(9).unwrap().name, "bob2");
    }

    #[test]
    fn self_flags_take_precedence() {
        let state = ServerState::new();
        state.update_user(user_state(1, Some("u")));

        let msg = msgs::UserState {
            session: Some(1),
            mute: Some(true),
            self_mute: Some(false),
            deaf: Some(false),
            self_deaf: Some(true),
            ..Default::default()
        };
        state.update_user(msg);

        let user = state.user(1).unwrap();
        assert!(!user.mute);
        assert!(user.deaf);
    }

    #[test]
    fn user_id_marks_authenticated() {
        let state = ServerState::new();
        state.update_user(user_state(1, Some("u")));

        let msg = msgs::UserState {
            session: Some(1),
            user_id: Some(77),
            ..Default::default()
        };
        state.update_user(msg);

        let user = state.user(1).unwrap();
        assert!(user.authenticated);
        assert_eq!(user.user_id, Some(77));
    }

    #[test]
    fn unknown_channel_reference_falls_back_to_root() {
        let state = ServerState::new();
        state.update_channel(channel_state(0, None, Some("Root")));
        state.update_channel(channel_state(3, Some(0), Some("A")));

        let mut msg = user_state(1, Some("u"));
        msg.channel_id = Some(3);
        state.update_user(msg);
        assert_eq!(state.user(1).unwrap().channel, 3);

        state.remove_channel(3);

        // next state moves the user to a gone channel: lands at root
        let mut msg = user_state(1, None);
        msg.channel_id = Some(3);
        state.update_user(msg);
        assert_eq!(state.user(1).unwrap().channel, ROOT_CHANNEL);
    }

    #[test]
    fn stats_address_is_ipv4_mapped() {
        let state = ServerState::new();
        state.update_user(user_state(1, Some("u")));

        let mapped = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 192, 168, 1, 20];
        state.set_user_address(1, &mapped);

        assert_eq!(
            state.user(1).unwrap().address,
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );
    }

    #[test]
    fn lookup_by_name() {
        let state = ServerState::new();
        state.update_user(user_state(4, Some("alice")));
        assert_eq!(state.user_by_name("alice").unwrap().session, 4);
        assert!(state.user_by_name("bob").is_none());
    }
}
