//! Domain and wire types for the smart-meter backend.
//!
//! Notes
//! - `Device` is the in-memory view of a registered appliance; rows from the
//!   database are converted into it in `crate::db::models`.
//! - Classifier responses are normalized into `RawClassifierPayload` exactly once,
//!   at the client boundary. Nothing downstream inspects raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// =====================
// Devices
// =====================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            "maintenance" => Ok(DeviceStatus::Maintenance),
            other => Err(format!("unknown device status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub user_id: String,
    /// Join key against the classifier label set (e.g. "Bulb 7W").
    pub name: String,
    pub meter_id: String,
    pub location: Option<String>,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

// =====================
// Readings
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub time: DateTime<Utc>,
    pub power_w: f64,
}

// =====================
// Identification endpoint
// =====================

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyRequest<'a> {
    pub power_readings: &'a [f64],
}

/// Classifier output after the shape discriminator has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawClassifierPayload {
    Null,
    Scalar(String),
    TokenList(Vec<String>),
    /// Positional bit rows, e.g. `[[1, 0, 1]]`.
    BitMatrix(Vec<Vec<u8>>),
}

impl RawClassifierPayload {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => RawClassifierPayload::Null,
            Value::Array(items) => match bit_matrix(&items) {
                Some(rows) => RawClassifierPayload::BitMatrix(rows),
                None => RawClassifierPayload::TokenList(items.iter().map(coerce_token).collect()),
            },
            // no scalar reading of an arbitrary object exists
            Value::Object(_) => RawClassifierPayload::Null,
            scalar => RawClassifierPayload::Scalar(coerce_token(&scalar)),
        }
    }
}

/// Best-effort string form of a payload element. Nested arrays flatten comma-joined.
fn coerce_token(value: &Value) -> String {
    match value {
        Value::Null | Value::Object(_) => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items.iter().map(coerce_token).collect::<Vec<_>>().join(","),
    }
}

fn bit_matrix(items: &[Value]) -> Option<Vec<Vec<u8>>> {
    if items.is_empty() {
        return None;
    }
    items
        .iter()
        .map(|row| row.as_array()?.iter().map(bit).collect::<Option<Vec<u8>>>())
        .collect()
}

fn bit(value: &Value) -> Option<u8> {
    match value {
        Value::Bool(b) => Some(u8::from(*b)),
        Value::Number(n) => match n.as_f64()? {
            v if v == 0.0 => Some(0),
            v if v == 1.0 => Some(1),
            _ => None,
        },
        _ => None,
    }
}

/// Decoded body of `POST /identify/device`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierReply {
    pub payload: RawClassifierPayload,
    /// Service-side note such as "Data is stale".
    pub message: Option<String>,
}

impl ClassifierReply {
    pub fn from_body(body: Value) -> Self {
        match body {
            Value::Object(mut map) => {
                let message = map.remove("message").and_then(|m| m.as_str().map(str::to_string));
                let payload = if let Some(states) = map.remove("identified_device_states") {
                    RawClassifierPayload::from_value(states)
                } else if let Some(device) = map.remove("identified_device") {
                    RawClassifierPayload::from_value(device)
                } else {
                    RawClassifierPayload::Null
                };
                ClassifierReply { payload, message }
            }
            other => ClassifierReply {
                payload: RawClassifierPayload::from_value(other),
                message: None,
            },
        }
    }
}

// =====================
// Alerts
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertsResponse {
    #[serde(default)]
    pub alerts: Option<BTreeMap<String, Alert>>,
}
