use crate::models::meter::{Alert, Severity};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertSummary {
    pub total: usize,
    pub unread: usize,
    /// Unread count per severity name.
    pub unread_by_severity: BTreeMap<Severity, usize>,
}

impl AlertSummary {
    pub fn describe(&self) -> String {
        let parts = self
            .unread_by_severity
            .iter()
            .map(|(sev, n)| format!("{}={}", serde_enum_name(sev).unwrap_or_else(|| "unknown".to_string()), n))
            .collect::<Vec<_>>();
        format!(
            "{} alert(s), {} unread [{}]",
            self.total,
            self.unread,
            parts.join(", ")
        )
    }
}

pub fn summarize_alerts(alerts: &BTreeMap<String, Alert>) -> AlertSummary {
    let mut summary = AlertSummary {
        total: alerts.len(),
        ..Default::default()
    };
    for alert in alerts.values().filter(|a| !a.is_read) {
        summary.unread += 1;
        *summary.unread_by_severity.entry(alert.severity).or_default() += 1;
    }
    summary
}

/// Serialize a serde-backed enum into its string name (e.g. "high").
pub fn serde_enum_name<T: Serialize>(val: &T) -> Option<String> {
    serde_json::to_value(val).ok()?.as_str().map(|s| s.to_string())
}
