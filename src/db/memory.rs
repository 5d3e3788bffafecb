//! In-memory store used by unit tests.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::db::models::NewDeviceEvent;
use crate::db::store::{DeviceStore, ReadingSource, StoreError};
use crate::models::meter::{Device, DeviceId, DeviceStatus, PowerSample};

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub devices: BTreeMap<DeviceId, Device>,
    pub readings: Vec<PowerSample>,
    pub events: Vec<NewDeviceEvent>,
    /// Devices whose status writes fail.
    pub failing_writes: BTreeSet<DeviceId>,
    pub fail_list: bool,
    pub fail_readings: bool,
    pub writes: Vec<(DeviceId, DeviceStatus, Option<DateTime<Utc>>)>,
}

impl MemoryStore {
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        MemoryStore {
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
            ..Default::default()
        }
    }

    pub fn status_of(&self, id: &str) -> Option<DeviceStatus> {
        self.devices.get(&DeviceId(id.to_string())).map(|d| d.status)
    }
}

fn unavailable() -> StoreError {
    StoreError::Database(diesel::result::Error::BrokenTransactionManager)
}

impl DeviceStore for MemoryStore {
    fn list_devices(&mut self, user_id: &str) -> Result<Vec<Device>, StoreError> {
        if self.fail_list {
            return Err(unavailable());
        }
        Ok(self.devices.values().filter(|d| d.user_id == user_id).cloned().collect())
    }

    fn get_device(&mut self, id: &DeviceId) -> Result<Option<Device>, StoreError> {
        Ok(self.devices.get(id).cloned())
    }

    fn update_status(
        &mut self,
        id: &DeviceId,
        status: DeviceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if self.failing_writes.contains(id) {
            return Err(unavailable());
        }
        let device = self.devices.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        device.status = status;
        if last_seen.is_some() {
            device.last_seen = last_seen;
        }
        self.writes.push((id.clone(), status, last_seen));
        Ok(())
    }

    fn record_event(&mut self, event: &NewDeviceEvent) -> Result<(), StoreError> {
        self.events.push(event.clone());
        Ok(())
    }
}

impl ReadingSource for MemoryStore {
    fn recent_power(&mut self, _user_id: &str, limit: usize) -> Result<Vec<PowerSample>, StoreError> {
        if self.fail_readings {
            return Err(unavailable());
        }
        let skip = self.readings.len().saturating_sub(limit);
        Ok(self.readings[skip..].to_vec())
    }
}

pub fn device(id: &str, name: &str, status: DeviceStatus) -> Device {
    Device {
        id: DeviceId(id.to_string()),
        user_id: "user-1".to_string(),
        name: name.to_string(),
        meter_id: format!("SM-{id}"),
        location: None,
        status,
        last_seen: None,
    }
}
