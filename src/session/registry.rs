// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Pending registrations and live sessions, both keyed by session id.
//!
//! Each map sits behind one std mutex, so "check and remove" is a single
//! critical section and a registration can be consumed at most once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::AgentConfig;
use crate::session::CallSession;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Registration {
    config: Arc<AgentConfig>,
    registered_at: Instant,
}

/// Agent configurations waiting for their AudioSocket connection.
#[derive(Default)]
pub struct PendingRegistry {
    entries: Mutex<HashMap<String, Registration>>,
}

impl std::fmt::Debug for PendingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `config` for `session_id`. Returns `true` if it replaced an
    /// earlier registration.
    pub fn register(&self, session_id: &str, config: AgentConfig) -> bool {
        lock(&self.entries)
            .insert(
                session_id.to_string(),
                Registration {
                    config: Arc::new(config),
                    registered_at: Instant::now(),
                },
            )
            .is_some()
    }

    /// Remove and return the registration for `session_id`.
    pub fn take(&self, session_id: &str) -> Option<Arc<AgentConfig>> {
        lock(&self.entries).remove(session_id).map(|r| r.config)
    }

    /// Put back a registration that was taken but not used, unless a newer
    /// one arrived in the meantime.
    pub fn restore(&self, session_id: &str, config: Arc<AgentConfig>) {
        lock(&self.entries)
            .entry(session_id.to_string())
            .or_insert_with(|| Registration {
                config,
                registered_at: Instant::now(),
            });
    }

    pub fn remove(&self, session_id: &str) -> bool {
        lock(&self.entries).remove(session_id).is_some()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        lock(&self.entries).contains_key(session_id)
    }

    /// Drop registrations older than `ttl`; returns how many were dropped.
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|id, r| {
            let keep = now.duration_since(r.registered_at) < ttl;
            if !keep {
                tracing::info!(session_id = %id, "registry: purging unclaimed registration");
            }
            keep
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sessions that are currently connected.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<CallSession>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.len())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `session`. Fails if another live session already
    /// holds the id.
    pub fn insert(&self, session: Arc<CallSession>) -> Result<(), Arc<CallSession>> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(session.id()) {
            return Err(session);
        }
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    /// Free the slot, but only if it still belongs to `session`.
    pub fn remove(&self, session: &CallSession) -> bool {
        let mut sessions = lock(&self.sessions);
        match sessions.get(session.id()) {
            Some(s) if std::ptr::eq(Arc::as_ptr(s), session) => {
                sessions.remove(session.id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<CallSession>> {
        lock(&self.sessions).get(session_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<Arc<CallSession>> {
        lock(&self.sessions).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
