//! In-memory store implementations.
//!
//! Used as the runtime default when no database is configured and as the
//! deterministic double in tests. Each store keeps its map behind a single
//! async mutex, so every operation is atomic with respect to the others —
//! including the rate-limit increment-and-compare and backup-code
//! consumption.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::events::{EventFilter, EventStore, SecurityEvent};
use crate::mfa::{MfaEnrollment, MfaStore};
use crate::ratelimit::{CounterStore, WindowCounter};
use crate::session::{AdminSession, SessionInsert, SessionStore};

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, WindowCounter>>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn window_elapsed(counter: &WindowCounter, window: Duration, now: DateTime<Utc>) -> Result<bool> {
    let window = ChronoDuration::from_std(window).context("window out of range")?;
    Ok(now >= counter.window_start + window)
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_get(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCounter> {
        let mut counters = self.counters.lock().await;
        let fresh = WindowCounter {
            count: 1,
            window_start: now,
        };
        let counter = match counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if window_elapsed(entry, window, now)? {
                    // Lazily overwrite the stale window.
                    *entry = fresh;
                } else {
                    entry.count += 1;
                }
                *entry
            }
            Entry::Vacant(vacant) => *vacant.insert(fresh),
        };
        Ok(counter)
    }

    async fn peek(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<WindowCounter> {
        let counters = self.counters.lock().await;
        match counters.get(key) {
            Some(counter) if !window_elapsed(counter, window, now)? => Ok(*counter),
            _ => Ok(WindowCounter {
                count: 0,
                window_start: now,
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<Vec<u8>, AdminSession>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &AdminSession) -> Result<SessionInsert> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.token_hash) {
            return Ok(SessionInsert::Conflict);
        }
        sessions.insert(session.token_hash.clone(), session.clone());
        Ok(SessionInsert::Inserted)
    }

    async fn get(&self, token_hash: &[u8]) -> Result<Option<AdminSession>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(token_hash).cloned())
    }

    async fn revoke(&self, token_hash: &[u8]) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(token_hash) {
            session.revoked = true;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryMfaStore {
    enrollments: Mutex<HashMap<Uuid, MfaEnrollment>>,
}

impl MemoryMfaStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MfaStore for MemoryMfaStore {
    async fn load(&self, user_id: Uuid) -> Result<Option<MfaEnrollment>> {
        let enrollments = self.enrollments.lock().await;
        Ok(enrollments.get(&user_id).cloned())
    }

    async fn upsert(&self, enrollment: &MfaEnrollment) -> Result<()> {
        let mut enrollments = self.enrollments.lock().await;
        enrollments.insert(enrollment.user_id, enrollment.clone());
        Ok(())
    }

    async fn consume_backup_code(&self, user_id: Uuid, code_hash: &str) -> Result<bool> {
        let mut enrollments = self.enrollments.lock().await;
        let Some(enrollment) = enrollments.get_mut(&user_id) else {
            return Ok(false);
        };
        let before = enrollment.backup_code_hashes.len();
        enrollment.backup_code_hashes.retain(|hash| hash != code_hash);
        Ok(enrollment.backup_code_hashes.len() < before)
    }

    async fn delete(&self, user_id: Uuid) -> Result<()> {
        let mut enrollments = self.enrollments.lock().await;
        enrollments.remove(&user_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test convenience: matching events without going through the trait.
    pub async fn recent_events(
        &self,
        filter: &EventFilter,
        since: DateTime<Utc>,
    ) -> Vec<SecurityEvent> {
        let events = self.events.lock().await;
        events
            .iter()
            .filter(|event| matches(event, filter, since))
            .cloned()
            .collect()
    }
}

fn matches(event: &SecurityEvent, filter: &EventFilter, since: DateTime<Utc>) -> bool {
    if event.created_at < since {
        return false;
    }
    if let Some(kind) = filter.kind {
        if event.kind != kind {
            return false;
        }
    }
    if let Some(user_id) = filter.user_id {
        if event.user_id != Some(user_id) {
            return false;
        }
    }
    if let Some(client_ip) = &filter.client_ip {
        if event.client_ip.as_deref() != Some(client_ip.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: &SecurityEvent) -> Result<()> {
        let mut events = self.events.lock().await;
        events.push(event.clone());
        Ok(())
    }

    async fn recent(
        &self,
        filter: &EventFilter,
        since: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>> {
        Ok(self.recent_events(filter, since).await)
    }
}
