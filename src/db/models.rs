//! Diesel model structs for devices, power readings and device events.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::meter::{Device, DeviceId, DeviceStatus};
use crate::schema;

// Standard values for `device_events.event_type` and `device_events.source`.
pub mod event_types {
    pub const DEVICE_ONLINE: &str = "DEVICE_ONLINE";
    pub const DEVICE_OFFLINE: &str = "DEVICE_OFFLINE";
    pub const DEVICE_STATUS_SET: &str = "DEVICE_STATUS_SET";
}

pub mod event_source {
    pub const IDENTIFY: &str = "identify";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const MANUAL: &str = "manual";
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct DeviceRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub meter_id: String,
    pub location: Option<String>,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = String;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<DeviceStatus>()
            .map_err(|e| format!("device {}: {}", row.id, e))?;
        Ok(Device {
            id: DeviceId(row.id),
            user_id: row.user_id,
            name: row.name,
            meter_id: row.meter_id,
            location: row.location,
            status,
            last_seen: row.last_seen,
        })
    }
}

/// Partial update; a `None` `last_seen` leaves the column untouched.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = schema::devices)]
pub struct DeviceStatusUpdate {
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// Time-series: power_readings
#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::power_readings)]
pub struct NewPowerReading {
    pub time: DateTime<Utc>,
    pub user_id: String,
    pub current_a: Option<f64>,
    pub voltage_v: Option<f64>,
    pub power_w: f64,
    pub energy_kwh: Option<f64>,
}

// Time-series: device_events
#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::device_events)]
pub struct NewDeviceEvent {
    pub time: DateTime<Utc>,
    pub device_id: String,
    pub source: String,
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
}

impl NewDeviceEvent {
    pub fn status_change(
        time: DateTime<Utc>,
        device_id: &DeviceId,
        source: &str,
        event_type: &str,
        old_status: DeviceStatus,
        new_status: DeviceStatus,
    ) -> Self {
        NewDeviceEvent {
            time,
            device_id: device_id.0.clone(),
            source: source.to_string(),
            event_type: event_type.to_string(),
            payload: Some(serde_json::json!({
                "old_status": old_status,
                "new_status": new_status,
            })),
        }
    }

    /// Event type for a transition produced by the identification cycle.
    pub fn transition_type(new_status: DeviceStatus) -> &'static str {
        match new_status {
            DeviceStatus::Online => event_types::DEVICE_ONLINE,
            DeviceStatus::Offline | DeviceStatus::Maintenance => event_types::DEVICE_OFFLINE,
        }
    }
}
