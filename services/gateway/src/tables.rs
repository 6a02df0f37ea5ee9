//! Shared tables: the two fixed-capacity concurrent maps visible to every
//! worker.
//!
//! The Channels Table stores membership as composite keys
//! `channel \0 fd_decimal` with no value payload; presence is membership.
//! The Auth Table stores one session row per fd, last-writer-wins.
//!
//! Capacity is enforced at insertion: a full table yields
//! [`TableError::CapacityExhausted`], which is distinguishable from an
//! idempotent re-insert (Ok).  Iteration tolerates concurrent insertion;
//! snapshot semantics are not provided.

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("CapacityExhausted")]
    CapacityExhausted,
}

/// Authenticated identity bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub fd: u64,
    pub account_id: i64,
    pub profile_id: i64,
    pub entity_id: Option<i64>,
    pub token: String,
    pub device_hash: String,
}

fn membership_key(channel: &str, fd: u64) -> String {
    format!("{channel}\0{fd}")
}

/// Channel membership table.
pub struct ChannelsTable {
    members: DashMap<String, ()>,
    capacity: usize,
}

impl ChannelsTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            members: DashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a membership.  `Ok(true)` on a new row, `Ok(false)` when the
    /// membership already existed.
    pub fn insert(&self, channel: &str, fd: u64) -> Result<bool, TableError> {
        let key = membership_key(channel, fd);
        if self.members.contains_key(&key) {
            return Ok(false);
        }
        if self.members.len() >= self.capacity {
            return Err(TableError::CapacityExhausted);
        }
        Ok(self.members.insert(key, ()).is_none())
    }

    /// Remove a membership; idempotent.
    pub fn remove(&self, channel: &str, fd: u64) -> bool {
        self.members.remove(&membership_key(channel, fd)).is_some()
    }

    /// Prefix scan: every fd subscribed to `channel`.
    pub fn members_of(&self, channel: &str) -> Vec<u64> {
        let prefix = format!("{channel}\0");
        self.members
            .iter()
            .filter_map(|entry| {
                let key = entry.key();
                key.strip_prefix(&prefix)
                    .and_then(|suffix| suffix.parse::<u64>().ok())
            })
            .collect()
    }

    /// Full-table scan filtered by fd suffix; used for disconnect cleanup.
    pub fn channels_of(&self, fd: u64) -> Vec<String> {
        self.members
            .iter()
            .filter_map(|entry| {
                let (channel, member_fd) = entry.key().rsplit_once('\0')?;
                (member_fd.parse::<u64>().ok()? == fd).then(|| channel.to_owned())
            })
            .collect()
    }

    /// Remove every membership for `fd`, returning the channels it left.
    pub fn remove_fd(&self, fd: u64) -> Vec<String> {
        let channels = self.channels_of(fd);
        for channel in &channels {
            self.remove(channel, fd);
        }
        channels
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Session table keyed by fd.
pub struct AuthTable {
    sessions: DashMap<u64, Session>,
    capacity: usize,
}

impl AuthTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: DashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert or replace the session for `session.fd`.  Re-authentication on
    /// the same fd is last-writer-wins and never counts against capacity.
    pub fn insert(&self, session: Session) -> Result<(), TableError> {
        if !self.sessions.contains_key(&session.fd) && self.sessions.len() >= self.capacity {
            return Err(TableError::CapacityExhausted);
        }
        self.sessions.insert(session.fd, session);
        Ok(())
    }

    pub fn get(&self, fd: u64) -> Option<Session> {
        self.sessions.get(&fd).map(|s| s.clone())
    }

    pub fn remove(&self, fd: u64) -> Option<Session> {
        self.sessions.remove(&fd).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// The pair of process-wide tables, allocated once at startup.
pub struct SharedTables {
    pub channels: ChannelsTable,
    pub sessions: AuthTable,
}

impl SharedTables {
    pub fn new(subscriptions_capacity: usize, sessions_capacity: usize) -> Self {
        Self {
            channels: ChannelsTable::new(subscriptions_capacity),
            sessions: AuthTable::new(sessions_capacity),
        }
    }
}
