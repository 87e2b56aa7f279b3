//! End-to-end sweep scenarios against a scripted generator and field probe.
//!
//! The fakes answer instantly and every settle time is zero, so each scenario runs the real
//! controller logic without waiting on hardware.

use async_trait::async_trait;
use immunisweep::config::SweepSettings;
use immunisweep::probe::FieldReading;
use immunisweep::regulator::{PidController, PowerRegulator, Regulate};
use immunisweep::sweep::{
    FieldSensor, SignalSource, StepOutcome, SweepController, SweepEvent, SweepStopHandle,
    TimeUnit, WarningLog,
};
use immunisweep::{AppResult, SweepError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

#[derive(Debug, Default)]
struct SourceState {
    frequency_mhz: f64,
    power_dbm: f64,
    rf_on: bool,
    modulation_on: bool,
    frequencies: Vec<f64>,
    /// Frequency whose set command times out.
    fail_at_mhz: Option<f64>,
}

struct FakeSource {
    state: Mutex<SourceState>,
    max_power: f64,
}

impl FakeSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SourceState::default()),
            max_power: 9.9,
        })
    }

    fn frequencies(&self) -> Vec<f64> {
        self.state.lock().frequencies.clone()
    }

    fn rf_on(&self) -> bool {
        self.state.lock().rf_on
    }

    fn modulation_on(&self) -> bool {
        self.state.lock().modulation_on
    }

    fn fail_at(&self, mhz: f64) {
        self.state.lock().fail_at_mhz = Some(mhz);
    }
}

#[async_trait]
impl SignalSource for FakeSource {
    async fn set_frequency_mhz(&self, mhz: f64) -> AppResult<f64> {
        let mut state = self.state.lock();
        if state.fail_at_mhz.is_some_and(|f| near(f, mhz)) {
            return Err(SweepError::Timeout(Duration::from_millis(100)));
        }
        state.frequency_mhz = mhz;
        state.frequencies.push(mhz);
        Ok(mhz)
    }

    async fn set_power(&self, dbm: f64) -> AppResult<f64> {
        let applied = dbm.min(self.max_power);
        self.state.lock().power_dbm = applied;
        Ok(applied)
    }

    async fn set_rf_output(&self, on: bool) -> AppResult<bool> {
        self.state.lock().rf_on = on;
        Ok(on)
    }

    async fn set_modulation_state(&self, on: bool) -> AppResult<bool> {
        self.state.lock().modulation_on = on;
        Ok(on)
    }

    fn power(&self) -> f64 {
        self.state.lock().power_dbm
    }

    fn max_power(&self) -> f64 {
        self.max_power
    }
}

type FieldModel = Box<dyn Fn(&SourceState, usize) -> f64 + Send + Sync>;

/// Reports a composite field computed from the fake generator's state and the read count.
struct FakeSensor {
    source: Arc<FakeSource>,
    model: FieldModel,
    reads: AtomicUsize,
}

impl FakeSensor {
    fn new(
        source: &Arc<FakeSource>,
        model: impl Fn(&SourceState, usize) -> f64 + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            source: source.clone(),
            model: Box::new(model),
            reads: AtomicUsize::new(0),
        })
    }

    fn reading(&self) -> FieldReading {
        let reads = self.reads.fetch_add(1, Ordering::SeqCst);
        let composite = (self.model)(&self.source.state.lock(), reads);
        FieldReading {
            composite,
            ..FieldReading::default()
        }
    }
}

#[async_trait]
impl FieldSensor for FakeSensor {
    fn read_current_field(&self) -> FieldReading {
        self.reading()
    }

    async fn next_reading(&self, _within: Duration) -> FieldReading {
        self.reading()
    }
}

fn sweep_settings(start: f64, stop: f64, term: f64) -> SweepSettings {
    SweepSettings {
        start_mhz: start,
        stop_mhz: stop,
        sweep_term: term,
        dwell_ms: 0,
        start_settle_ms: 0,
        resweep_settle_ms: 0,
        step_settle_ms: 0,
        regulation_settle_ms: 0,
        ..SweepSettings::default()
    }
}

fn controller(
    source: &Arc<FakeSource>,
    sensor: &Arc<FakeSensor>,
    settings: SweepSettings,
    regulator: PowerRegulator,
    dir: &TempDir,
) -> SweepController<FakeSource, FakeSensor> {
    SweepController::new(
        source.clone(),
        sensor.clone(),
        settings,
        regulator,
        WarningLog::at(dir.path().join("warnings.txt")),
    )
}

/// A controller whose warning log points into a directory that does not exist.
fn controller_with_unwritable_log(
    source: &Arc<FakeSource>,
    sensor: &Arc<FakeSensor>,
    settings: SweepSettings,
    dir: &TempDir,
) -> SweepController<FakeSource, FakeSensor> {
    SweepController::new(
        source.clone(),
        sensor.clone(),
        settings,
        PowerRegulator::default(),
        WarningLog::at(dir.path().join("missing").join("warnings.txt")),
    )
}

fn drain(events: &mut broadcast::Receiver<SweepEvent>) -> Vec<SweepEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn near(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

fn assert_frequencies(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{:?} vs {:?}", actual, expected);
    for (a, e) in actual.iter().zip(expected) {
        assert!(near(*a, *e), "{:?} vs {:?}", actual, expected);
    }
}

fn log_lines(dir: &TempDir) -> Vec<String> {
    std::fs::read_to_string(dir.path().join("warnings.txt"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

const FORWARD_100_TO_200: [f64; 9] = [
    100.0, 110.0, 121.0, 133.1, 146.41, 161.051, 177.1561, 194.87171, 200.0,
];

#[tokio::test]
async fn test_field_in_band_everywhere_completes_clean() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let sensor = FakeSensor::new(&source, |_, _| 1.2);
    let mut sweep = controller(
        &source,
        &sensor,
        sweep_settings(100.0, 200.0, 0.1),
        PowerRegulator::default(),
        &dir,
    );
    let mut events = sweep.subscribe();

    let outcome = sweep.run().await.unwrap();
    assert_eq!(outcome, StepOutcome::Finished { missed: vec![] });
    assert_frequencies(&source.frequencies(), &FORWARD_100_TO_200);
    assert!(sweep.missed_frequencies().is_empty());
    assert!(!sweep.is_sweeping());
    assert!(!source.rf_on());
    assert!(!source.modulation_on());
    assert!(log_lines(&dir).is_empty());

    let events = drain(&mut events);
    assert_eq!(events.last(), Some(&SweepEvent::SweepCompleted(vec![])));
    assert!(events.contains(&SweepEvent::SweepStatus(100.0)));
    let dwells = events
        .iter()
        .filter(|e| matches!(e, SweepEvent::BeginDwell(_)))
        .count();
    assert_eq!(dwells, FORWARD_100_TO_200.len());
}

#[tokio::test]
async fn test_high_field_is_missed_logged_and_sweep_continues() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let sensor = FakeSensor::new(&source, |state, _| {
        if near(state.frequency_mhz, 110.0) {
            3.0
        } else {
            1.2
        }
    });
    let mut sweep = controller(
        &source,
        &sensor,
        sweep_settings(100.0, 200.0, 0.1),
        PowerRegulator::default(),
        &dir,
    );
    let mut events = sweep.subscribe();

    let outcome = sweep.run().await.unwrap();
    let missed = match outcome {
        StepOutcome::Finished { missed } => missed,
        other => panic!("sweep did not finish: {:?}", other),
    };
    assert_frequencies(&missed, &[110.0]);
    assert_frequencies(&sweep.missed_frequencies(), &[110.0]);
    assert_frequencies(&source.frequencies(), &FORWARD_100_TO_200);

    let lines = log_lines(&dir);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("High Field Detected Warning"), "{}", lines[0]);
    assert!(lines[0].contains("exceeded 2x target level"), "{}", lines[0]);

    let events = drain(&mut events);
    let high_field: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, SweepEvent::HighFieldDetected(_)))
        .collect();
    assert_eq!(
        high_field,
        vec![&SweepEvent::HighFieldDetected(dir.path().join("warnings.txt"))]
    );
    assert!(matches!(events.last(), Some(SweepEvent::SweepCompleted(m)) if m.len() == 1));
}

#[tokio::test]
async fn test_no_field_at_power_limit_aborts_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let sensor = FakeSensor::new(&source, |_, _| 0.2);
    let settings = SweepSettings {
        base_power_dbm: 5.0,
        ..sweep_settings(100.0, 200.0, 0.1)
    };
    let mut sweep = controller(&source, &sensor, settings, PowerRegulator::default(), &dir);
    let mut events = sweep.subscribe();

    let outcome = sweep.run().await.unwrap();
    assert_eq!(outcome, StepOutcome::Aborted);
    assert!(!sweep.is_sweeping());
    assert!(!source.rf_on());
    assert!(!source.modulation_on());
    assert_eq!(source.power(), 5.0);
    assert_frequencies(&source.frequencies(), &[100.0]);

    let events = drain(&mut events);
    let limits: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SweepEvent::PowerLimitExceeded(message) => Some(message.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(limits.len(), 1);
    assert!(limits[0].contains("Aborting sweep"), "{}", limits[0]);
    assert!(!events
        .iter()
        .any(|e| matches!(e, SweepEvent::SweepCompleted(_))));

    let lines = log_lines(&dir);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("Power limit exceeded"), "{}", lines[0]);
}

#[tokio::test]
async fn test_power_limit_with_field_present_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    // Enough field to rule out a broken cable, never enough to reach the target.
    let sensor = FakeSensor::new(&source, |state, _| {
        if near(state.frequency_mhz, 121.0) {
            0.8
        } else {
            1.2
        }
    });
    let settings = SweepSettings {
        base_power_dbm: 9.0,
        ..sweep_settings(100.0, 200.0, 0.1)
    };
    let mut sweep = controller(&source, &sensor, settings, PowerRegulator::default(), &dir);

    let outcome = sweep.run().await.unwrap();
    let missed = match outcome {
        StepOutcome::Finished { missed } => missed,
        other => panic!("sweep did not finish: {:?}", other),
    };
    assert_frequencies(&missed, &[121.0]);
    assert_frequencies(&source.frequencies(), &FORWARD_100_TO_200);
    assert!(source.power() <= 9.9);
}

#[tokio::test]
async fn test_resweep_visits_only_missed_frequencies() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let resweeping = Arc::new(AtomicUsize::new(0));
    let pass = resweeping.clone();
    let sensor = FakeSensor::new(&source, move |state, _| {
        let bad: &[f64] = match pass.load(Ordering::SeqCst) {
            0 => &[110.0, 146.41, 177.1561],
            1 => &[177.1561],
            _ => &[],
        };
        if bad.iter().any(|f| near(state.frequency_mhz, *f)) {
            3.0
        } else {
            1.2
        }
    });
    let mut sweep = controller(
        &source,
        &sensor,
        sweep_settings(100.0, 200.0, 0.1),
        PowerRegulator::default(),
        &dir,
    );

    let first = sweep.run().await.unwrap();
    let missed = match first {
        StepOutcome::Finished { missed } => missed,
        other => panic!("sweep did not finish: {:?}", other),
    };
    assert_frequencies(&missed, &[110.0, 146.41, 177.1561]);

    resweeping.store(1, Ordering::SeqCst);
    let visited_before = source.frequencies().len();
    let second = sweep.run_missed().await.unwrap();
    let missed = match second {
        StepOutcome::Finished { missed } => missed,
        other => panic!("re-sweep did not finish: {:?}", other),
    };
    assert_frequencies(&missed, &[177.1561]);
    assert_frequencies(
        &source.frequencies()[visited_before..],
        &[110.0, 146.41, 177.1561],
    );
    assert!(!sweep.is_sweeping());
    assert_eq!(log_lines(&dir).len(), 4);

    // Nothing left to do once the list is empty.
    resweeping.store(2, Ordering::SeqCst);
    let third = sweep.run_missed().await.unwrap();
    assert_eq!(third, StepOutcome::Finished { missed: vec![] });
    assert_eq!(sweep.run_missed().await.unwrap(), StepOutcome::Idle);
}

#[tokio::test]
async fn test_forward_range_survives_resweep() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let resweeping = Arc::new(AtomicBool::new(false));
    let pass = resweeping.clone();
    let sensor = FakeSensor::new(&source, move |state, _| {
        let bad = [121.0, 146.41];
        if !pass.load(Ordering::SeqCst) && bad.iter().any(|f| near(state.frequency_mhz, *f)) {
            3.0
        } else {
            1.2
        }
    });
    let mut sweep = controller(
        &source,
        &sensor,
        sweep_settings(100.0, 200.0, 0.1),
        PowerRegulator::default(),
        &dir,
    );

    let first = sweep.run().await.unwrap();
    assert!(matches!(first, StepOutcome::Finished { ref missed } if missed.len() == 2));
    resweeping.store(true, Ordering::SeqCst);
    assert_eq!(
        sweep.run_missed().await.unwrap(),
        StepOutcome::Finished { missed: vec![] }
    );
    assert_eq!(sweep.start_frequency(), 100.0);
    assert_eq!(sweep.stop_frequency(), 200.0);
    assert_eq!(sweep.step_count(), 8);

    let visited_before = source.frequencies().len();
    let again = sweep.run().await.unwrap();
    assert_eq!(again, StepOutcome::Finished { missed: vec![] });
    assert_frequencies(&source.frequencies()[visited_before..], &FORWARD_100_TO_200);
    assert_eq!(sweep.state().start_freq, 100.0);
    assert_eq!(sweep.state().stop_freq, 200.0);
}

#[tokio::test]
async fn test_unwritable_log_does_not_interrupt_high_field_miss() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let sensor = FakeSensor::new(&source, |state, _| {
        if near(state.frequency_mhz, 110.0) {
            3.0
        } else {
            1.2
        }
    });
    let mut sweep =
        controller_with_unwritable_log(&source, &sensor, sweep_settings(100.0, 200.0, 0.1), &dir);

    let outcome = sweep.run().await.unwrap();
    let missed = match outcome {
        StepOutcome::Finished { missed } => missed,
        other => panic!("sweep did not finish: {:?}", other),
    };
    assert_frequencies(&missed, &[110.0]);
    assert_frequencies(&source.frequencies(), &FORWARD_100_TO_200);
    assert!(!sweep.is_sweeping());
    assert!(!source.rf_on());
    assert!(!source.modulation_on());
    assert!(!sweep.log_path().exists());
}

#[tokio::test]
async fn test_unwritable_log_still_shuts_down_on_hardware_fault() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let sensor = FakeSensor::new(&source, |_, _| 0.2);
    let settings = SweepSettings {
        base_power_dbm: 5.0,
        ..sweep_settings(100.0, 200.0, 0.1)
    };
    let mut sweep = controller_with_unwritable_log(&source, &sensor, settings, &dir);

    assert_eq!(sweep.run().await.unwrap(), StepOutcome::Aborted);
    assert!(!sweep.is_sweeping());
    assert!(!source.rf_on());
    assert!(!source.modulation_on());
    assert_eq!(source.power(), 5.0);
}

#[tokio::test]
async fn test_failed_step_turns_outputs_off_at_base_power() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    source.fail_at(121.0);
    // Raises power on every frequency before settling in band.
    let sensor = FakeSensor::new(&source, |state, _| if state.power_dbm < -29.0 { 0.8 } else { 1.2 });
    let mut sweep = controller(
        &source,
        &sensor,
        sweep_settings(100.0, 200.0, 0.1),
        PowerRegulator::default(),
        &dir,
    );

    let result = sweep.run().await;
    assert!(matches!(result, Err(SweepError::Timeout(_))), "{:?}", result);
    assert_frequencies(&source.frequencies(), &[100.0, 110.0]);
    assert!(!sweep.is_sweeping());
    assert!(!source.rf_on());
    assert!(!source.modulation_on());
    assert_eq!(source.power(), -30.0);
    assert_eq!(sweep.step_sweep().await.unwrap(), StepOutcome::Idle);
}

#[tokio::test]
async fn test_stop_during_regulation_turns_outputs_off() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let handle: Arc<Mutex<Option<SweepStopHandle>>> = Arc::new(Mutex::new(None));
    let stop_at = handle.clone();
    let sensor = FakeSensor::new(&source, move |state, _| {
        if near(state.frequency_mhz, 121.0) {
            if let Some(stop) = stop_at.lock().as_ref() {
                stop.request_stop();
            }
        }
        1.2
    });
    let mut sweep = controller(
        &source,
        &sensor,
        sweep_settings(100.0, 200.0, 0.1),
        PowerRegulator::default(),
        &dir,
    );
    *handle.lock() = Some(sweep.stop_handle());

    assert_eq!(sweep.run().await.unwrap(), StepOutcome::Aborted);
    assert_frequencies(&source.frequencies(), &[100.0, 110.0, 121.0]);
    assert!(!sweep.is_sweeping());
    assert!(!source.rf_on());
    assert!(!sweep.stop_handle().is_requested());
}

#[tokio::test]
async fn test_stop_interrupts_dwell() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let sensor = FakeSensor::new(&source, |_, _| 1.2);
    let mut sweep = controller(
        &source,
        &sensor,
        sweep_settings(100.0, 200.0, 0.1),
        PowerRegulator::default(),
        &dir,
    );
    sweep.set_dwell(30.0, TimeUnit::Second);

    let stop = sweep.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.request_stop();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), sweep.run())
        .await
        .expect("stop did not interrupt the dwell")
        .unwrap();
    assert_eq!(outcome, StepOutcome::Aborted);
    assert_frequencies(&source.frequencies(), &[100.0]);
    assert!(!source.rf_on());
}

#[tokio::test]
async fn test_pid_state_cleared_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    // Below target on the first read, in band after one correction.
    let sensor = FakeSensor::new(&source, |_, reads| if reads == 0 { 0.8 } else { 1.2 });
    let regulator = PowerRegulator::Pid(PidController::new(0.1, 0.01, 0.01));
    let mut sweep = controller(
        &source,
        &sensor,
        sweep_settings(100.0, 200.0, 0.1),
        regulator,
        &dir,
    );

    let first = sweep.start_sweep().await.unwrap();
    assert_eq!(first, StepOutcome::Dwell(Duration::ZERO));
    let PowerRegulator::Pid(pid) = sweep.regulator() else {
        panic!("expected a PID regulator");
    };
    assert!((pid.integral() - 0.2).abs() < 1e-9);
    assert!(source.power() > -30.0);

    sweep.stop_sweep().await.unwrap();
    let PowerRegulator::Pid(pid) = sweep.regulator() else {
        panic!("expected a PID regulator");
    };
    assert_eq!(pid.integral(), 0.0);
    assert_eq!(pid.prev_error(), 0.0);
    assert_eq!(sweep.regulator().target(), 1.0);
    assert!(!sweep.is_sweeping());
    assert_eq!(source.power(), -30.0);
    assert_eq!(sweep.step_sweep().await.unwrap(), StepOutcome::Idle);
}

#[tokio::test]
async fn test_invalid_range_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let sensor = FakeSensor::new(&source, |_, _| 1.2);
    let mut sweep = controller(
        &source,
        &sensor,
        sweep_settings(200.0, 100.0, 0.1),
        PowerRegulator::default(),
        &dir,
    );

    assert!(sweep.start_sweep().await.is_err());
    assert!(!sweep.is_sweeping());
    assert!(source.frequencies().is_empty());
    assert!(!source.rf_on());
}

#[test]
fn test_sweep_estimates() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let sensor = FakeSensor::new(&source, |_, _| 1.2);
    let mut sweep = controller(
        &source,
        &sensor,
        sweep_settings(100.0, 200.0, 0.1),
        PowerRegulator::default(),
        &dir,
    );
    sweep.set_dwell(1.0, TimeUnit::Second);

    assert_eq!(sweep.step_count(), 8);
    assert_eq!(sweep.dwell(), Duration::from_secs(1));
    assert!((sweep.sweep_time().as_secs_f64() - 8.8).abs() < 1e-9);
}
