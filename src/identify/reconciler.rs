//! Diffs a decoded state against the known devices and persists the deltas.

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::str::FromStr;

use crate::db::models::NewDeviceEvent;
use crate::db::store::{DeviceStore, StoreError};
use crate::identify::decoder::{DecodedState, LabelSet};
use crate::models::meter::{Device, DeviceId, DeviceStatus};

/// What to do with devices an operator has put into maintenance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum MaintenancePolicy {
    #[default]
    Preserve,
    Overwrite,
}

impl FromStr for MaintenancePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preserve" | "skip" => Ok(MaintenancePolicy::Preserve),
            "overwrite" => Ok(MaintenancePolicy::Overwrite),
            other => Err(format!("unknown maintenance policy: {other} (expected preserve or overwrite)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub device_id: DeviceId,
    pub device_name: String,
    pub old_status: DeviceStatus,
    pub new_status: DeviceStatus,
    /// Set only for transitions to online.
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub devices: Vec<Device>,
    pub changes: Vec<StatusChange>,
}

pub fn reconcile(
    current: &[Device],
    decoded: &DecodedState,
    labels: &LabelSet,
    policy: MaintenancePolicy,
    now: DateTime<Utc>,
) -> Reconciliation {
    let mut devices = Vec::with_capacity(current.len());
    let mut changes = Vec::new();

    for device in current {
        let verdict = labels.token_for_device(&device.name).and_then(|token| decoded.get(token));
        let Some(verdict) = verdict else {
            devices.push(device.clone());
            continue;
        };
        if device.status == DeviceStatus::Maintenance && policy == MaintenancePolicy::Preserve {
            devices.push(device.clone());
            continue;
        }

        let new_status = verdict.status();
        if new_status == device.status {
            devices.push(device.clone());
            continue;
        }

        let last_seen = (new_status == DeviceStatus::Online).then_some(now);
        changes.push(StatusChange {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            old_status: device.status,
            new_status,
            last_seen,
        });
        devices.push(Device {
            status: new_status,
            last_seen: last_seen.or(device.last_seen),
            ..device.clone()
        });
    }

    Reconciliation { devices, changes }
}

#[derive(Debug, Default)]
pub struct PersistReport {
    pub persisted: Vec<DeviceId>,
    pub failed: Vec<(DeviceId, StoreError)>,
}

/// Write every change independently. Failures are logged and collected, never
/// propagated; later changes are still attempted.
pub fn persist_changes<S: DeviceStore + ?Sized>(
    store: &mut S,
    changes: &[StatusChange],
    source: &str,
    now: DateTime<Utc>,
) -> PersistReport {
    let mut report = PersistReport::default();

    for change in changes {
        match store.update_status(&change.device_id, change.new_status, change.last_seen) {
            Ok(()) => {
                info!(
                    "Reconcile: {} ({}) {} -> {} persisted",
                    change.device_name, change.device_id, change.old_status, change.new_status
                );
                let event = NewDeviceEvent::status_change(
                    now,
                    &change.device_id,
                    source,
                    NewDeviceEvent::transition_type(change.new_status),
                    change.old_status,
                    change.new_status,
                );
                if let Err(e) = store.record_event(&event) {
                    warn!("Reconcile: event for device {} not recorded: {}", change.device_id, e);
                }
                report.persisted.push(change.device_id.clone());
            }
            Err(e) => {
                warn!(
                    "Reconcile: failed to persist {} ({}) {} -> {}: {}",
                    change.device_name, change.device_id, change.old_status, change.new_status, e
                );
                report.failed.push((change.device_id.clone(), e));
            }
        }
    }

    report
}
