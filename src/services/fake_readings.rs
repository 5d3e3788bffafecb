use crate::db::models::NewPowerReading;
use crate::db::store::PgStore;
use crate::identify::decoder::LabelSet;
use chrono::{DateTime, Duration, Utc};
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const STEP_SECONDS: i64 = 5;
// one load combination per minute
const SEGMENT_SAMPLES: usize = 12;
const MAINS_VOLTAGE: f64 = 230.0;
const BATCH_SIZE: usize = 1_000;
const FALLBACK_WATTAGES: [f64; 3] = [7.0, 12.0, 15.0];

/// Insert `count` synthetic readings for `user_id`, ending now.
pub fn run(store: &mut PgStore, user_id: &str, count: usize, labels: &LabelSet) -> Result<usize, String> {
    let wattages = wattages_from_labels(labels);
    let rows = generate(user_id, count, Utc::now(), &wattages)?;
    info!(
        "Fake readings: generating {} reading(s) for user {} (loads={:?}W)",
        rows.len(),
        user_id,
        wattages
    );

    let mut inserted = 0;
    for batch in rows.chunks(BATCH_SIZE) {
        inserted += store
            .insert_readings(batch)
            .map_err(|e| format!("insert readings failed: {}", e))?;
    }
    info!("Fake readings: complete (inserted={})", inserted);
    Ok(inserted)
}

/// Numeric label tokens are read as bulb wattages.
pub fn wattages_from_labels(labels: &LabelSet) -> Vec<f64> {
    let found: Vec<f64> = labels
        .iter()
        .filter_map(|l| l.token.parse::<f64>().ok())
        .filter(|w| *w > 0.0)
        .collect();
    if found.is_empty() { FALLBACK_WATTAGES.to_vec() } else { found }
}

pub fn generate(
    user_id: &str,
    count: usize,
    end: DateTime<Utc>,
    wattages: &[f64],
) -> Result<Vec<NewPowerReading>, String> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let end = align_to_step(end);
    let start = i64::try_from(count - 1)
        .ok()
        .and_then(|steps| steps.checked_mul(STEP_SECONDS))
        .and_then(Duration::try_seconds)
        .and_then(|span| end.checked_sub_signed(span))
        .ok_or_else(|| format!("{} readings at {}s spacing do not fit in the calendar", count, STEP_SECONDS))?;

    let mut rng = SmallRng::seed_from_u64(0x0007_0012_0015_BEEFu64);
    let step = Duration::seconds(STEP_SECONDS);
    let mut time = start;
    let mut active = vec![false; wattages.len()];
    let mut energy_kwh = 0.0;
    let mut rows = Vec::with_capacity(count.min(BATCH_SIZE));

    for i in 0..count {
        if i % SEGMENT_SAMPLES == 0 {
            for on in active.iter_mut() {
                *on = rng.random_bool(0.45);
            }
        }

        let load: f64 = wattages
            .iter()
            .zip(&active)
            .filter(|(_, on)| **on)
            .map(|(w, _)| *w)
            .sum();
        // idle meters still report a little noise
        let power_w = if load > 0.0 {
            (load + rng.random_range(-0.3..=0.3)).max(0.0)
        } else {
            rng.random_range(0.08..=0.25)
        };
        let voltage_v = MAINS_VOLTAGE + rng.random_range(-2.5..=2.5);
        energy_kwh += power_w * STEP_SECONDS as f64 / 3_600_000.0;

        rows.push(NewPowerReading {
            time,
            user_id: user_id.to_string(),
            current_a: Some(round_to(power_w / voltage_v, 4)),
            voltage_v: Some(round_to(voltage_v, 2)),
            power_w: round_to(power_w, 2),
            energy_kwh: Some(energy_kwh),
        });
        time += step;
    }
    Ok(rows)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn align_to_step(ts: DateTime<Utc>) -> DateTime<Utc> {
    let aligned = (ts.timestamp() / STEP_SECONDS) * STEP_SECONDS;
    DateTime::<Utc>::from_timestamp(aligned, 0).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn end() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 12, 0, 3).unwrap()
    }

    #[test]
    fn readings_are_evenly_spaced_and_end_aligned() {
        let rows = generate("user-1", 30, end(), &FALLBACK_WATTAGES).expect("readings");
        assert_eq!(rows.len(), 30);
        assert_eq!(rows.last().map(|r| r.time), Some(Utc.with_ymd_and_hms(2026, 10, 14, 12, 0, 0).unwrap()));
        for pair in rows.windows(2) {
            assert_eq!(pair[1].time - pair[0].time, Duration::seconds(STEP_SECONDS));
            assert!(pair[1].energy_kwh >= pair[0].energy_kwh);
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let powers = || -> Vec<f64> {
            let rows = generate("u", 120, end(), &FALLBACK_WATTAGES).expect("readings");
            rows.iter().map(|r| r.power_w).collect()
        };
        assert_eq!(powers(), powers());
    }

    #[test]
    fn power_stays_within_possible_load() {
        let max_load: f64 = FALLBACK_WATTAGES.iter().sum::<f64>() + 0.5;
        for row in generate("u", 600, end(), &FALLBACK_WATTAGES).expect("readings") {
            assert!(row.power_w >= 0.0 && row.power_w <= max_load, "power {} out of range", row.power_w);
        }
    }

    #[test]
    fn wattages_come_from_numeric_labels() {
        assert_eq!(wattages_from_labels(&LabelSet::default()), vec![7.0, 12.0, 15.0]);
        let words = LabelSet::parse("kettle=Kettle").expect("labels");
        assert_eq!(wattages_from_labels(&words), FALLBACK_WATTAGES.to_vec());
        assert!(generate("u", 0, end(), &FALLBACK_WATTAGES).expect("no readings").is_empty());
    }

    #[test]
    fn counts_beyond_the_calendar_are_rejected() {
        let err = generate("u", usize::MAX, end(), &FALLBACK_WATTAGES).unwrap_err();
        assert!(err.contains("do not fit"), "unexpected error: {err}");
        assert!(generate("u", 1 << 42, end(), &FALLBACK_WATTAGES).is_err());
    }
}
