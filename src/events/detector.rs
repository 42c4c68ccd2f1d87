//! Suspicious-activity heuristics over the recent event window.
//!
//! Alerts are derived values: recomputed on demand from the event log, never
//! persisted on their own. Delivery goes through an [`AlertSink`] so the
//! notification channel stays an external collaborator.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use super::{EventFilter, SecurityEventKind, SecurityEventLog};

const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);
const DEFAULT_HISTORY_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_FAILED_MEDIUM: usize = 5;
const DEFAULT_FAILED_CRITICAL: usize = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Severity {
    Low,
    Medium,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::Critical => "critical",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SuspiciousActivityAlert {
    pub user_id: Option<Uuid>,
    pub client_ip: Option<String>,
    pub severity: Severity,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Outbound alert channel. The production default logs a structured warning;
/// deployments wire a pager or chat notifier here.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: &SuspiciousActivityAlert);
}

#[derive(Clone, Copy, Debug)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: &SuspiciousActivityAlert) {
        warn!(
            severity = alert.severity.as_str(),
            user_id = ?alert.user_id,
            client_ip = ?alert.client_ip,
            reason = %alert.reason,
            "suspicious activity detected"
        );
    }
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    window: Duration,
    history_window: Duration,
    failed_medium: usize,
    failed_critical: usize,
}

impl DetectorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            history_window: DEFAULT_HISTORY_WINDOW,
            failed_medium: DEFAULT_FAILED_MEDIUM,
            failed_critical: DEFAULT_FAILED_CRITICAL,
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_failed_thresholds(mut self, medium: usize, critical: usize) -> Self {
        self.failed_medium = medium;
        self.failed_critical = critical;
        self
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SuspiciousActivityDetector {
    events: SecurityEventLog,
    sink: Arc<dyn AlertSink>,
    config: DetectorConfig,
}

impl SuspiciousActivityDetector {
    #[must_use]
    pub fn new(events: SecurityEventLog, sink: Arc<dyn AlertSink>, config: DetectorConfig) -> Self {
        Self {
            events,
            sink,
            config,
        }
    }

    /// Evaluate recent history for the given user/address pair.
    ///
    /// Returns the highest-severity finding, or `None` when nothing stands
    /// out.
    ///
    /// # Errors
    /// Returns an error when the event log cannot be read; callers treat this
    /// as an infrastructure failure and fail closed.
    pub async fn detect(
        &self,
        user_id: Option<Uuid>,
        client_ip: Option<&str>,
    ) -> Result<Option<SuspiciousActivityAlert>> {
        let now = Utc::now();
        let since = now - to_chrono(self.config.window);

        let mut verdict: Option<(Severity, String)> = None;

        if let Some(ip) = client_ip {
            let filter = EventFilter::kind(SecurityEventKind::FailedLogin).with_client_ip(ip);
            let failed = self.events.recent(&filter, since).await?.len();
            escalate(&mut verdict, self.grade_failures(failed, "address"));
        }

        if let Some(user_id) = user_id {
            let filter = EventFilter::kind(SecurityEventKind::FailedLogin).with_user(user_id);
            let failed = self.events.recent(&filter, since).await?.len();
            escalate(&mut verdict, self.grade_failures(failed, "account"));

            if let Some(ip) = client_ip {
                escalate(&mut verdict, self.grade_new_address(user_id, ip, now).await?);
            }
        }

        Ok(verdict.map(|(severity, reason)| SuspiciousActivityAlert {
            user_id,
            client_ip: client_ip.map(str::to_string),
            severity,
            reason,
            timestamp: now,
        }))
    }

    /// Hand an alert to the notification channel.
    pub fn trigger(&self, alert: &SuspiciousActivityAlert) {
        self.sink.notify(alert);
    }

    fn grade_failures(&self, failed: usize, subject: &str) -> Option<(Severity, String)> {
        if failed >= self.config.failed_critical {
            Some((
                Severity::Critical,
                format!("{failed} failed logins for {subject} within window"),
            ))
        } else if failed >= self.config.failed_medium {
            Some((
                Severity::Medium,
                format!("{failed} failed logins for {subject} within window"),
            ))
        } else {
            None
        }
    }

    /// Low-severity signal: the account has a successful-login history, none
    /// of it from the current address.
    async fn grade_new_address(
        &self,
        user_id: Uuid,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Severity, String)>> {
        let since = now - to_chrono(self.config.history_window);
        let filter = EventFilter::kind(SecurityEventKind::Login).with_user(user_id);
        let logins = self.events.recent(&filter, since).await?;
        if logins.is_empty() {
            return Ok(None);
        }
        let seen = logins
            .iter()
            .any(|event| event.client_ip.as_deref() == Some(ip));
        if seen {
            Ok(None)
        } else {
            Ok(Some((
                Severity::Low,
                "login from previously unseen address".to_string(),
            )))
        }
    }
}

fn escalate(verdict: &mut Option<(Severity, String)>, candidate: Option<(Severity, String)>) {
    if let Some((severity, reason)) = candidate {
        match verdict {
            Some((current, _)) if *current >= severity => {}
            _ => *verdict = Some((severity, reason)),
        }
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero())
}

#[cfg(test)]
mod tests {
    use super::{
        DetectorConfig, LogAlertSink, Severity, SuspiciousActivityDetector,
    };
    use crate::events::{SecurityEvent, SecurityEventKind, SecurityEventLog};
    use crate::store::memory::MemoryEventStore;
    use std::sync::Arc;
    use uuid::Uuid;

    fn detector_with_log() -> (SuspiciousActivityDetector, SecurityEventLog) {
        let store = Arc::new(MemoryEventStore::new());
        let log = SecurityEventLog::new(store);
        let detector = SuspiciousActivityDetector::new(
            log.clone(),
            Arc::new(LogAlertSink),
            DetectorConfig::new().with_failed_thresholds(3, 6),
        );
        (detector, log)
    }

    #[tokio::test]
    async fn quiet_history_produces_no_alert() {
        let (detector, _log) = detector_with_log();
        let alert = detector
            .detect(Some(Uuid::new_v4()), Some("203.0.113.5"))
            .await
            .unwrap();
        assert!(alert.is_none());
    }

    #[tokio::test]
    async fn repeated_failures_escalate_by_count() {
        let (detector, log) = detector_with_log();
        for _ in 0..3 {
            log.record(
                SecurityEvent::new(SecurityEventKind::FailedLogin)
                    .with_client_ip(Some("198.51.100.7")),
            )
            .await
            .unwrap();
        }

        let alert = detector
            .detect(None, Some("198.51.100.7"))
            .await
            .unwrap()
            .expect("medium alert");
        assert_eq!(alert.severity, Severity::Medium);

        for _ in 0..3 {
            log.record(
                SecurityEvent::new(SecurityEventKind::FailedLogin)
                    .with_client_ip(Some("198.51.100.7")),
            )
            .await
            .unwrap();
        }

        let alert = detector
            .detect(None, Some("198.51.100.7"))
            .await
            .unwrap()
            .expect("critical alert");
        assert_eq!(alert.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn unseen_address_with_login_history_is_low() {
        let (detector, log) = detector_with_log();
        let user = Uuid::new_v4();
        log.record(
            SecurityEvent::new(SecurityEventKind::Login)
                .with_user(user)
                .with_client_ip(Some("192.0.2.10")),
        )
        .await
        .unwrap();

        let alert = detector
            .detect(Some(user), Some("203.0.113.20"))
            .await
            .unwrap()
            .expect("low alert");
        assert_eq!(alert.severity, Severity::Low);

        // Known address stays quiet.
        let alert = detector.detect(Some(user), Some("192.0.2.10")).await.unwrap();
        assert!(alert.is_none());
    }
}
