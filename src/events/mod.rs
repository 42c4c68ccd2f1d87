//! Append-only security event log shared by every auth component.
//!
//! Every transition in the login and MFA state machines records exactly one
//! event here, failures included. Writers treat the log as mandatory: when the
//! underlying store cannot accept an event, the enclosing operation fails
//! closed instead of proceeding with a hole in the audit trail.

pub mod detector;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Closed set of security-relevant event types.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    Login,
    FailedLogin,
    MfaEnabled,
    AdminAccess,
    IpBlocked,
}

impl SecurityEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::FailedLogin => "failed_login",
            Self::MfaEnabled => "mfa_enabled",
            Self::AdminAccess => "admin_access",
            Self::IpBlocked => "ip_blocked",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "login" => Some(Self::Login),
            "failed_login" => Some(Self::FailedLogin),
            "mfa_enabled" => Some(Self::MfaEnabled),
            "admin_access" => Some(Self::AdminAccess),
            "ip_blocked" => Some(Self::IpBlocked),
            _ => None,
        }
    }
}

/// A single immutable entry in the security audit trail.
#[derive(Clone, Debug)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub kind: SecurityEventKind,
    pub user_id: Option<Uuid>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    #[must_use]
    pub fn new(kind: SecurityEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            user_id: None,
            client_ip: None,
            user_agent: None,
            details: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_client_ip(mut self, client_ip: Option<&str>) -> Self {
        self.client_ip = client_ip.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: Option<&str>) -> Self {
        self.user_agent = user_agent.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Filter for reading back recent events. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub kind: Option<SecurityEventKind>,
    pub user_id: Option<Uuid>,
    pub client_ip: Option<String>,
}

impl EventFilter {
    #[must_use]
    pub fn kind(kind: SecurityEventKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_client_ip(mut self, client_ip: &str) -> Self {
        self.client_ip = Some(client_ip.to_string());
        self
    }
}

/// Append-only storage for security events.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: &SecurityEvent) -> Result<()>;

    /// Events matching `filter` with `created_at >= since`, oldest first.
    async fn recent(&self, filter: &EventFilter, since: DateTime<Utc>) -> Result<Vec<SecurityEvent>>;
}

/// Shared front for the event store.
#[derive(Clone)]
pub struct SecurityEventLog {
    store: Arc<dyn EventStore>,
}

impl SecurityEventLog {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Record one event.
    ///
    /// # Errors
    /// Returns an error when the store cannot accept the event; the caller
    /// must then fail its enclosing operation rather than continue without
    /// the audit entry.
    pub async fn record(&self, event: SecurityEvent) -> Result<()> {
        debug!(kind = event.kind.as_str(), "recording security event");
        self.store
            .append(&event)
            .await
            .context("failed to append security event")
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub async fn recent(
        &self,
        filter: &EventFilter,
        since: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>> {
        self.store
            .recent(filter, since)
            .await
            .context("failed to read security events")
    }
}
