//! Persistence seams used by the identification cycle, with the PostgreSQL
//! implementation behind them.

use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use log::warn;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::db::models::{DeviceRow, DeviceStatusUpdate, NewDeviceEvent, NewPowerReading};
use crate::models::meter::{Device, DeviceId, DeviceStatus, PowerSample};
use crate::schema;

#[derive(Debug)]
pub enum StoreError {
    Database(diesel::result::Error),
    NotFound(DeviceId),
    Forbidden(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {}", e),
            StoreError::NotFound(id) => write!(f, "device {} not found", id),
            StoreError::Forbidden(reason) => write!(f, "forbidden: {}", reason),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        StoreError::Database(value)
    }
}

/// Device persistence. Every write is an independent, idempotent upsert keyed by id.
pub trait DeviceStore {
    fn list_devices(&mut self, user_id: &str) -> Result<Vec<Device>, StoreError>;

    fn get_device(&mut self, id: &DeviceId) -> Result<Option<Device>, StoreError>;

    fn update_status(
        &mut self,
        id: &DeviceId,
        status: DeviceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    fn record_event(&mut self, event: &NewDeviceEvent) -> Result<(), StoreError>;
}

pub trait ReadingSource {
    /// Newest `limit` samples for a user, ordered oldest first.
    fn recent_power(&mut self, user_id: &str, limit: usize) -> Result<Vec<PowerSample>, StoreError>;
}

pub struct PgStore {
    conn: PgConnection,
}

impl PgStore {
    pub fn establish(database_url: &str) -> Result<Self, String> {
        let conn = PgConnection::establish(database_url).map_err(|e| format!("DB connection failed: {}", e))?;
        Ok(PgStore { conn })
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub fn insert_readings(&mut self, rows: &[NewPowerReading]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        use schema::power_readings::dsl as R;

        let count = diesel::insert_into(R::power_readings).values(rows).execute(&mut self.conn)?;
        Ok(count)
    }
}

fn rows_to_devices(rows: Vec<DeviceRow>) -> Vec<Device> {
    rows.into_iter()
        .filter_map(|row| match Device::try_from(row) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("Store: skipping device row: {}", e);
                None
            }
        })
        .collect()
}

impl DeviceStore for PgStore {
    fn list_devices(&mut self, user_id: &str) -> Result<Vec<Device>, StoreError> {
        use schema::devices::dsl as D;

        let rows: Vec<DeviceRow> = D::devices
            .filter(D::user_id.eq(user_id))
            .order((D::name.asc(), D::id.asc()))
            .select(DeviceRow::as_select())
            .load(&mut self.conn)?;
        Ok(rows_to_devices(rows))
    }

    fn get_device(&mut self, id: &DeviceId) -> Result<Option<Device>, StoreError> {
        use schema::devices::dsl as D;

        let row: Option<DeviceRow> = D::devices
            .find(id.0.as_str())
            .select(DeviceRow::as_select())
            .first(&mut self.conn)
            .optional()?;
        Ok(row.map(|r| rows_to_devices(vec![r])).and_then(|mut v| v.pop()))
    }

    fn update_status(
        &mut self,
        id: &DeviceId,
        status: DeviceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        use schema::devices::dsl as D;

        let changes = DeviceStatusUpdate {
            status: status.as_str().to_string(),
            last_seen,
            updated_at: Utc::now(),
        };
        let updated = diesel::update(D::devices.find(id.0.as_str()))
            .set(&changes)
            .execute(&mut self.conn)?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    fn record_event(&mut self, event: &NewDeviceEvent) -> Result<(), StoreError> {
        use schema::device_events::dsl as E;

        diesel::insert_into(E::device_events).values(event).execute(&mut self.conn)?;
        Ok(())
    }
}

impl ReadingSource for PgStore {
    fn recent_power(&mut self, user_id: &str, limit: usize) -> Result<Vec<PowerSample>, StoreError> {
        use schema::power_readings::dsl as R;

        let mut rows: Vec<(DateTime<Utc>, f64)> = R::power_readings
            .filter(R::user_id.eq(user_id))
            .order(R::time.desc())
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .select((R::time, R::power_w))
            .load(&mut self.conn)?;
        rows.reverse();
        Ok(rows
            .into_iter()
            .map(|(time, power_w)| PowerSample { time, power_w })
            .collect())
    }
}
