//! In-memory fakes for the persistence port and the registry read side.

use axum::extract::ws::Message as Frame;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::chat::message::{GroupId, Message, NewMessage, UserId};
use crate::chat::store::MessageStore;
use crate::error::StoreError;
use crate::ws::registry::{ConnectionHandle, PeerLookup};

#[derive(Default)]
pub struct FakeStore {
    appended: Mutex<Vec<Message>>,
    members: Mutex<HashMap<GroupId, HashSet<UserId>>>,
    fail_appends: AtomicBool,
}

impl FakeStore {
    pub fn set_members<I: IntoIterator<Item = UserId>>(&self, group_id: GroupId, members: I) {
        self.members
            .lock()
            .unwrap()
            .insert(group_id, members.into_iter().collect());
    }

    pub fn fail_appends(&self) {
        self.fail_appends.store(true, Ordering::SeqCst);
    }

    pub fn appended(&self) -> Vec<Message> {
        self.appended.lock().unwrap().clone()
    }
}

impl MessageStore for FakeStore {
    fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::LockPoisoned);
        }
        let mut appended = self.appended.lock().unwrap();
        let persisted = message.into_persisted(appended.len() as i64 + 1);
        appended.push(persisted.clone());
        Ok(persisted)
    }

    fn list_group_members(&self, group_id: GroupId) -> HashSet<UserId> {
        self.members
            .lock()
            .unwrap()
            .get(&group_id)
            .cloned()
            .unwrap_or_default()
    }

    fn direct_history(&self, a: UserId, b: UserId) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .appended()
            .into_iter()
            .filter(|m| {
                let receiver = m.addressing.receiver_id();
                (m.sender_id == a && receiver == Some(b)) || (m.sender_id == b && receiver == Some(a))
            })
            .collect())
    }

    fn group_history(&self, group_id: GroupId) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .appended()
            .into_iter()
            .filter(|m| m.addressing.group_id() == Some(group_id))
            .collect())
    }
}

/// Registry stand-in that records every lookup.
pub struct RecordingLookup {
    handles: HashMap<UserId, ConnectionHandle>,
    lookups: Mutex<Vec<UserId>>,
}

impl RecordingLookup {
    /// One live connection per listed user, each with `capacity` slots.
    pub fn with_connections(
        users: &[UserId],
        capacity: usize,
    ) -> (Self, HashMap<UserId, mpsc::Receiver<Frame>>) {
        let mut handles = HashMap::new();
        let mut receivers = HashMap::new();
        for &user_id in users {
            let (tx, rx) = mpsc::channel(capacity);
            handles.insert(user_id, ConnectionHandle::new(tx));
            receivers.insert(user_id, rx);
        }
        let lookup = Self {
            handles,
            lookups: Mutex::new(Vec::new()),
        };
        (lookup, receivers)
    }

    pub fn handle(&self, user_id: UserId) -> &ConnectionHandle {
        &self.handles[&user_id]
    }

    pub fn lookups(&self) -> HashSet<UserId> {
        self.lookups.lock().unwrap().iter().copied().collect()
    }

    pub fn lookup_log(&self) -> Vec<UserId> {
        self.lookups.lock().unwrap().clone()
    }
}

impl PeerLookup for RecordingLookup {
    fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.lookups.lock().unwrap().push(user_id);
        self.handles.get(&user_id).cloned()
    }
}
