//! Record-store implementations behind the component store traits.
//!
//! The core never talks to a database directly: rate-limit counters,
//! sessions, MFA enrollments, and the event log are reached through narrow
//! traits owned by their components. `memory` is the deterministic in-process
//! implementation (and the default when no database is configured);
//! `postgres` is the durable one.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use crate::events::EventStore;
use crate::mfa::MfaStore;
use crate::ratelimit::CounterStore;
use crate::session::SessionStore;

/// The full set of stores the service wires at startup.
#[derive(Clone)]
pub struct Stores {
    pub counters: Arc<dyn CounterStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub mfa: Arc<dyn MfaStore>,
    pub events: Arc<dyn EventStore>,
}

impl Stores {
    /// In-process stores; state lives only as long as the service.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            counters: Arc::new(memory::MemoryCounterStore::new()),
            sessions: Arc::new(memory::MemorySessionStore::new()),
            mfa: Arc::new(memory::MemoryMfaStore::new()),
            events: Arc::new(memory::MemoryEventStore::new()),
        }
    }

    /// Durable stores over one shared connection pool.
    #[must_use]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self {
            counters: Arc::new(postgres::PgCounterStore::new(pool.clone())),
            sessions: Arc::new(postgres::PgSessionStore::new(pool.clone())),
            mfa: Arc::new(postgres::PgMfaStore::new(pool.clone())),
            events: Arc::new(postgres::PgEventStore::new(pool)),
        }
    }
}
