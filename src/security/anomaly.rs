//! Suspicious-activity heuristics and compliance report model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A canned access-log heuristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Heuristic {
    /// More than 5 failed accesses per user and table within an hour
    RepeatedFailedAccess,
    /// More than 1000 reads per user and table within 10 minutes
    BulkRead,
}

impl Heuristic {
    pub const ALL: [Heuristic; 2] = [Heuristic::RepeatedFailedAccess, Heuristic::BulkRead];

    pub fn as_str(&self) -> &'static str {
        match self {
            Heuristic::RepeatedFailedAccess => "repeated_failed_access",
            Heuristic::BulkRead => "bulk_read",
        }
    }

    pub fn threshold(&self) -> i64 {
        match self {
            Heuristic::RepeatedFailedAccess => 5,
            Heuristic::BulkRead => 1000,
        }
    }

    pub fn window(&self) -> Duration {
        match self {
            Heuristic::RepeatedFailedAccess => Duration::hours(1),
            Heuristic::BulkRead => Duration::minutes(10),
        }
    }

    /// Access-log filter selecting the rows this heuristic counts
    pub(crate) fn filter_sql(&self) -> &'static str {
        match self {
            Heuristic::RepeatedFailedAccess => "success = false",
            Heuristic::BulkRead => "kind = 'read' AND success = true",
        }
    }

    /// Severity for `count` events in the window; `None` when not suspicious
    pub fn severity(&self, count: i64) -> Option<Severity> {
        let threshold = self.threshold();
        if count >= threshold * 4 {
            Some(Severity::High)
        } else if count > threshold {
            Some(Severity::Medium)
        } else {
            None
        }
    }
}

/// A persisted suspicious-activity alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub heuristic: Heuristic,
    pub severity: Severity,
    pub user_id: Option<String>,
    pub schema_name: String,
    pub table_name: String,
    pub event_count: i64,
    pub window_start: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub description: String,
}

impl SecurityAlert {
    /// Alert for a counted group, if the count crosses the threshold
    pub fn evaluate(
        heuristic: Heuristic,
        user_id: Option<String>,
        schema_name: String,
        table_name: String,
        event_count: i64,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let severity = heuristic.severity(event_count)?;
        let description = format!(
            "{} by {} on {}.{}: {} events in {} minutes",
            heuristic.as_str().replace('_', " "),
            user_id.as_deref().unwrap_or("unknown user"),
            schema_name,
            table_name,
            event_count,
            heuristic.window().num_minutes()
        );
        Some(Self {
            heuristic,
            severity,
            user_id,
            schema_name,
            table_name,
            event_count,
            window_start: now - heuristic.window(),
            detected_at: now,
            description,
        })
    }
}

/// Access statistics over a time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub read_count: i64,
    pub write_count: i64,
    pub delete_count: i64,
    pub privileged_count: i64,
    pub failed_count: i64,
    pub distinct_users: i64,
    pub alert_count: i64,
    pub generated_at: DateTime<Utc>,
}

impl ComplianceReport {
    pub fn total_accesses(&self) -> i64 {
        self.read_count + self.write_count + self.delete_count + self.privileged_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_access_severity() {
        let h = Heuristic::RepeatedFailedAccess;
        assert_eq!(h.severity(5), None);
        assert_eq!(h.severity(6), Some(Severity::Medium));
        assert_eq!(h.severity(19), Some(Severity::Medium));
        assert_eq!(h.severity(20), Some(Severity::High));
    }

    #[test]
    fn test_bulk_read_severity() {
        let h = Heuristic::BulkRead;
        assert_eq!(h.severity(1000), None);
        assert_eq!(h.severity(1001), Some(Severity::Medium));
        assert_eq!(h.severity(4000), Some(Severity::High));
    }

    #[test]
    fn test_alert_evaluation() {
        let now = Utc::now();
        let alert = SecurityAlert::evaluate(
            Heuristic::BulkRead,
            Some("u-9".to_string()),
            "module_vendas".to_string(),
            "pedidos".to_string(),
            1500,
            now,
        )
        .unwrap();

        assert_eq!(alert.severity, Severity::Medium);
        assert_eq!(alert.window_start, now - Duration::minutes(10));
        assert!(alert.description.contains("bulk read by u-9"));

        assert!(SecurityAlert::evaluate(
            Heuristic::BulkRead,
            None,
            "s".to_string(),
            "t".to_string(),
            10,
            now
        )
        .is_none());
    }
}
