use crate::context::SessionContext;
use crate::db::models::{NewDeviceEvent, event_source, event_types};
use crate::db::store::{DeviceStore, StoreError};
use crate::models::meter::{Device, DeviceId, DeviceStatus};
use chrono::{DateTime, Utc};
use log::{info, warn};

/// Operator override of a device status. This is the only path into or out of
/// `maintenance`.
pub fn set_status_manual<S: DeviceStore + ?Sized>(
    store: &mut S,
    ctx: &SessionContext,
    id: &DeviceId,
    status: DeviceStatus,
    now: DateTime<Utc>,
) -> Result<Device, StoreError> {
    let device = store.get_device(id)?.ok_or_else(|| StoreError::NotFound(id.clone()))?;
    if !ctx.can_manage(&device) {
        return Err(StoreError::Forbidden(format!(
            "user {} may not change device {}",
            ctx.user_id, id
        )));
    }
    if device.status == status {
        info!("Manual: device {} already {}", id, status);
        return Ok(device);
    }

    let last_seen = (status == DeviceStatus::Online).then_some(now);
    store.update_status(id, status, last_seen)?;

    let event = NewDeviceEvent::status_change(
        now,
        id,
        event_source::MANUAL,
        event_types::DEVICE_STATUS_SET,
        device.status,
        status,
    );
    if let Err(e) = store.record_event(&event) {
        warn!("Manual: event for device {} not recorded: {}", id, e);
    }
    info!("Manual: device {} ({}) {} -> {} by {}", device.name, id, device.status, status, ctx.user_id);

    Ok(Device {
        status,
        last_seen: last_seen.or(device.last_seen),
        ..device
    })
}
