use crate::client::{Classifier, MeterClientError};
use crate::context::SessionContext;
use crate::db::models::event_source;
use crate::db::store::{DeviceStore, ReadingSource, StoreError};
use crate::identify::decoder::{self, DecodeRule, DecodedState, LabelSet, Verdict};
use crate::identify::reconciler::{self, MaintenancePolicy};
use crate::models::meter::Device;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::num::NonZeroUsize;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum CycleError {
    Readings(StoreError),
    Classify(MeterClientError),
}

impl Display for CycleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CycleError::Readings(e) => write!(f, "loading readings failed: {}", e),
            CycleError::Classify(e) => write!(f, "identification request failed: {}", e),
        }
    }
}

impl Error for CycleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CycleError::Readings(e) => Some(e),
            CycleError::Classify(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoReadings,
    /// Stale data was already answered with an all-offline pass.
    StaleAlreadyApplied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub rule: DecodeRule,
    pub online: Vec<String>,
    pub changes: usize,
    pub persisted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Applied(CycleReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    Stale { age_secs: i64 },
    StaleHandled,
}

/// Tracks reading freshness and latches the all-offline reaction until new data arrives.
#[derive(Debug, Clone)]
struct Heartbeat {
    stale_after: chrono::Duration,
    offline_applied: bool,
}

impl Heartbeat {
    fn new(stale_after: Duration) -> Self {
        Heartbeat {
            stale_after: chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX),
            offline_applied: false,
        }
    }

    fn observe(&mut self, newest: DateTime<Utc>, now: DateTime<Utc>) -> Freshness {
        let age = now - newest;
        if age <= self.stale_after {
            self.offline_applied = false;
            return Freshness::Fresh;
        }
        if self.offline_applied {
            return Freshness::StaleHandled;
        }
        self.offline_applied = true;
        Freshness::Stale {
            age_secs: age.num_seconds(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub reading_window: NonZeroUsize,
    pub stale_after: Duration,
    pub maintenance_policy: MaintenancePolicy,
}

pub struct IdentificationCycle {
    ctx: SessionContext,
    labels: LabelSet,
    settings: CycleSettings,
    heartbeat: Heartbeat,
    devices: Vec<Device>,
}

impl IdentificationCycle {
    pub fn new(ctx: SessionContext, labels: LabelSet, settings: CycleSettings) -> Self {
        let heartbeat = Heartbeat::new(settings.stale_after);
        IdentificationCycle {
            ctx,
            labels,
            settings,
            heartbeat,
            devices: Vec::new(),
        }
    }

    /// Device list as of the last completed cycle.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn run_once<C, S>(&mut self, classifier: &C, store: &mut S, now: DateTime<Utc>) -> Result<CycleOutcome, CycleError>
    where
        C: Classifier + ?Sized,
        S: DeviceStore + ReadingSource + ?Sized,
    {
        // the store is the source of truth; the cached list only covers a failed reload.
        // `self.devices` changes only once a verdict has been applied.
        let fresh = match store.list_devices(&self.ctx.user_id) {
            Ok(devices) => devices,
            Err(e) => {
                warn!(
                    "Identify: reloading devices failed, using {} cached device(s): {}",
                    self.devices.len(),
                    e
                );
                self.devices.clone()
            }
        };

        let readings = store
            .recent_power(&self.ctx.user_id, self.settings.reading_window.get())
            .map_err(CycleError::Readings)?;
        let Some(newest) = readings.last().map(|r| r.time) else {
            debug!("Identify: no readings for user {}", self.ctx.user_id);
            return Ok(CycleOutcome::Skipped(SkipReason::NoReadings));
        };

        let (decoded, source) = match self.heartbeat.observe(newest, now) {
            Freshness::StaleHandled => return Ok(CycleOutcome::Skipped(SkipReason::StaleAlreadyApplied)),
            Freshness::Stale { age_secs } => {
                warn!("Identify: newest reading is {}s old; marking labelled devices offline", age_secs);
                (
                    DecodedState::uniform(&self.labels, Verdict::Offline, DecodeRule::Stale),
                    event_source::HEARTBEAT,
                )
            }
            Freshness::Fresh => {
                let powers: Vec<f64> = readings.iter().map(|r| r.power_w).collect();
                let reply = classifier.identify(&powers).map_err(CycleError::Classify)?;
                debug!(
                    "Identify: classifier payload {:?} (message={})",
                    reply.payload,
                    reply.message.as_deref().unwrap_or("-")
                );
                (decoder::decode(&reply.payload, &self.labels), event_source::IDENTIFY)
            }
        };

        let rec = reconciler::reconcile(
            &fresh,
            &decoded,
            &self.labels,
            self.settings.maintenance_policy,
            now,
        );
        let persisted = reconciler::persist_changes(store, &rec.changes, source, now);
        self.devices = rec.devices;

        let report = CycleReport {
            rule: decoded.rule,
            online: decoded.online_tokens().into_iter().map(str::to_string).collect(),
            changes: rec.changes.len(),
            persisted: persisted.persisted.len(),
            failed: persisted.failed.len(),
        };
        info!(
            "Identify: rule={:?} online=[{}] changes={} persisted={} failed={}",
            report.rule,
            report.online.join(","),
            report.changes,
            report.persisted,
            report.failed
        );
        Ok(CycleOutcome::Applied(report))
    }
}

/// Run cycles forever on a steady cadence. A failed cycle keeps the last known
/// device state and the loop carries on.
pub fn run_loop<C, S>(cycle: &mut IdentificationCycle, classifier: &C, store: &mut S, interval: Duration)
where
    C: Classifier + ?Sized,
    S: DeviceStore + ReadingSource + ?Sized,
{
    loop {
        let tick_start = Instant::now();

        if let Err(e) = cycle.run_once(classifier, store, Utc::now()) {
            error!("Identify: cycle failed, keeping last known device state: {}", e);
        }

        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Role;
    use crate::db::memory::{MemoryStore, device};
    use crate::models::meter::{ClassifierReply, DeviceStatus, PowerSample, RawClassifierPayload};
    use chrono::TimeZone;
    use std::cell::RefCell;

    use DeviceStatus::{Offline, Online};

    struct ScriptedClassifier {
        replies: RefCell<Vec<Result<RawClassifierPayload, MeterClientError>>>,
        calls: RefCell<Vec<Vec<f64>>>,
    }

    impl ScriptedClassifier {
        fn new(replies: Vec<Result<RawClassifierPayload, MeterClientError>>) -> Self {
            ScriptedClassifier {
                replies: RefCell::new(replies.into_iter().rev().collect()),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Classifier for ScriptedClassifier {
        fn identify(&self, power_readings: &[f64]) -> Result<ClassifierReply, MeterClientError> {
            self.calls.borrow_mut().push(power_readings.to_vec());
            let next = self
                .replies
                .borrow_mut()
                .pop()
                .unwrap_or(Ok(RawClassifierPayload::Null));
            next.map(|payload| ClassifierReply { payload, message: None })
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 9, 0, 0).unwrap()
    }

    fn store_with_bulbs(statuses: [DeviceStatus; 3]) -> MemoryStore {
        let mut store = MemoryStore::with_devices([
            device("a", "Bulb 7W", statuses[0]),
            device("b", "Bulb 12W", statuses[1]),
            device("c", "Bulb 15W", statuses[2]),
        ]);
        store.readings = (0..10)
            .map(|i| PowerSample {
                time: t0() - chrono::Duration::seconds(5 * (9 - i)),
                power_w: 12.0 + i as f64 * 0.1,
            })
            .collect();
        store
    }

    fn cycle() -> IdentificationCycle {
        IdentificationCycle::new(
            SessionContext::new("user-1", Role::User),
            LabelSet::default(),
            CycleSettings {
                reading_window: NonZeroUsize::new(7).unwrap(),
                stale_after: Duration::from_secs(20),
                maintenance_policy: MaintenancePolicy::Preserve,
            },
        )
    }

    fn statuses(store: &MemoryStore) -> Vec<Option<DeviceStatus>> {
        ["a", "b", "c"].iter().map(|id| store.status_of(id)).collect()
    }

    #[test]
    fn applies_classifier_verdicts_and_sends_window() {
        let mut store = store_with_bulbs([Offline, Offline, Online]);
        let classifier = ScriptedClassifier::new(vec![Ok(RawClassifierPayload::Scalar("12".into()))]);
        let mut cycle = cycle();

        let outcome = cycle.run_once(&classifier, &mut store, t0()).expect("cycle succeeds");
        let CycleOutcome::Applied(report) = outcome else {
            panic!("expected applied outcome");
        };
        assert_eq!(report.rule, DecodeRule::Tokens);
        assert_eq!(report.online, vec!["12".to_string()]);
        assert_eq!((report.changes, report.persisted, report.failed), (2, 2, 0));
        assert_eq!(statuses(&store), vec![Some(Offline), Some(Online), Some(Offline)]);

        let calls = classifier.calls.borrow();
        assert_eq!(calls[0].len(), 7);
        assert!((calls[0][6] - 12.9).abs() < 1e-9);
    }

    #[test]
    fn classifier_failure_keeps_state() {
        let mut store = store_with_bulbs([Online, Offline, Offline]);
        let classifier = ScriptedClassifier::new(vec![Err(MeterClientError::Transport("refused".into()))]);
        let mut cycle = cycle();

        let err = cycle.run_once(&classifier, &mut store, t0()).unwrap_err();
        assert!(matches!(err, CycleError::Classify(_)));
        assert_eq!(statuses(&store), vec![Some(Online), Some(Offline), Some(Offline)]);
        assert!(store.writes.is_empty());
    }

    #[test]
    fn empty_payload_forces_offline() {
        let mut store = store_with_bulbs([Online, Online, Online]);
        let classifier = ScriptedClassifier::new(vec![Ok(RawClassifierPayload::Null)]);
        let mut cycle = cycle();

        cycle.run_once(&classifier, &mut store, t0()).expect("cycle succeeds");
        assert_eq!(statuses(&store), vec![Some(Offline), Some(Offline), Some(Offline)]);
    }

    #[test]
    fn no_readings_skips_the_cycle() {
        let mut store = store_with_bulbs([Online, Offline, Offline]);
        store.readings.clear();
        let classifier = ScriptedClassifier::new(vec![]);
        let mut cycle = cycle();

        let outcome = cycle.run_once(&classifier, &mut store, t0()).expect("cycle succeeds");
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::NoReadings));
        assert!(classifier.calls.borrow().is_empty());
    }

    #[test]
    fn stale_readings_force_offline_once() {
        let mut store = store_with_bulbs([Online, Online, Offline]);
        let classifier = ScriptedClassifier::new(vec![Ok(RawClassifierPayload::Scalar("7".into()))]);
        let mut cycle = cycle();
        let later = t0() + chrono::Duration::seconds(60);

        let first = cycle.run_once(&classifier, &mut store, later).expect("stale pass");
        let CycleOutcome::Applied(report) = first else {
            panic!("expected applied outcome");
        };
        assert_eq!(report.rule, DecodeRule::Stale);
        assert_eq!(statuses(&store), vec![Some(Offline), Some(Offline), Some(Offline)]);
        assert!(store.events.iter().all(|e| e.source == event_source::HEARTBEAT));

        let second = cycle.run_once(&classifier, &mut store, later).expect("latched");
        assert_eq!(second, CycleOutcome::Skipped(SkipReason::StaleAlreadyApplied));
        assert!(classifier.calls.borrow().is_empty());

        // fresh data clears the latch
        store.readings.push(PowerSample {
            time: later,
            power_w: 7.1,
        });
        cycle.run_once(&classifier, &mut store, later).expect("fresh pass");
        assert_eq!(statuses(&store), vec![Some(Online), Some(Offline), Some(Offline)]);
    }

    #[test]
    fn failed_write_is_caught_up_next_cycle() {
        let mut store = store_with_bulbs([Offline, Offline, Offline]);
        store.failing_writes.insert(crate::models::meter::DeviceId("a".into()));
        let classifier = ScriptedClassifier::new(vec![
            Ok(RawClassifierPayload::TokenList(vec!["7".into(), "12".into()])),
            Ok(RawClassifierPayload::TokenList(vec!["7".into(), "12".into()])),
        ]);
        let mut cycle = cycle();

        cycle.run_once(&classifier, &mut store, t0()).expect("first pass");
        let shown: Vec<_> = cycle.devices().iter().map(|d| d.status).collect();
        assert_eq!(shown, vec![Online, Online, Offline]);
        assert_eq!(store.status_of("a"), Some(Offline));

        store.failing_writes.clear();
        let outcome = cycle.run_once(&classifier, &mut store, t0()).expect("second pass");
        let CycleOutcome::Applied(report) = outcome else {
            panic!("expected applied outcome");
        };
        assert_eq!((report.changes, report.persisted), (1, 1));
        assert_eq!(store.status_of("a"), Some(Online));
    }

    #[test]
    fn failed_cycle_keeps_last_decoded_verdict() {
        let mut store = store_with_bulbs([Offline, Offline, Offline]);
        store.failing_writes.insert(crate::models::meter::DeviceId("a".into()));
        let classifier = ScriptedClassifier::new(vec![
            Ok(RawClassifierPayload::Scalar("7".into())),
            Err(MeterClientError::Transport("refused".into())),
        ]);
        let mut cycle = cycle();

        cycle.run_once(&classifier, &mut store, t0()).expect("first pass");
        assert_eq!(cycle.devices()[0].status, Online);
        assert_eq!(store.status_of("a"), Some(Offline));

        let err = cycle.run_once(&classifier, &mut store, t0()).unwrap_err();
        assert!(matches!(err, CycleError::Classify(_)));
        assert_eq!(cycle.devices()[0].status, Online);

        store.readings.clear();
        let outcome = cycle.run_once(&classifier, &mut store, t0()).expect("skipped pass");
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::NoReadings));
        assert_eq!(cycle.devices()[0].status, Online);
    }

    #[test]
    fn list_failure_falls_back_to_cached_devices() {
        let mut store = store_with_bulbs([Offline, Offline, Offline]);
        let classifier = ScriptedClassifier::new(vec![
            Ok(RawClassifierPayload::Scalar("ALL_OFF".into())),
            Ok(RawClassifierPayload::Scalar("ALL_ON".into())),
        ]);
        let mut cycle = cycle();
        cycle.run_once(&classifier, &mut store, t0()).expect("first pass");
        assert_eq!(cycle.devices().len(), 3);

        store.fail_list = true;
        cycle.run_once(&classifier, &mut store, t0()).expect("second pass");
        assert_eq!(statuses(&store), vec![Some(Online), Some(Online), Some(Online)]);
    }

    #[test]
    fn reading_failure_surfaces_as_cycle_error() {
        let mut store = store_with_bulbs([Offline, Offline, Offline]);
        store.fail_readings = true;
        let classifier = ScriptedClassifier::new(vec![]);
        let err = cycle().run_once(&classifier, &mut store, t0()).unwrap_err();
        assert!(matches!(err, CycleError::Readings(_)));
    }
}
