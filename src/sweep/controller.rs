//! Closed-loop frequency sweep.
//!
//! The controller steps a geometric frequency sweep. At each frequency it resets the
//! generator to base power, then regulates power until the probe reads a field inside
//! `[target, target * threshold)` or a fault ends regulation:
//!
//! | Condition | Outcome |
//! |---|---|
//! | field in band | accepted |
//! | field above `high_field_factor * target` | missed, logged, sweep continues |
//! | power would exceed the ceiling, field present | missed, logged, sweep continues |
//! | power would exceed the ceiling, field near zero | whole sweep aborted |
//!
//! Dwell belongs to the caller: [`SweepController::step_sweep`] returns
//! [`StepOutcome::Dwell`] and the driver waits before calling it again.
//! [`SweepController::run`] is such a driver.
//!
//! Every exit from regulation leaves power at or below the ceiling.

use crate::config::{Settings, SweepSettings};
use crate::error::{AppResult, SweepError};
use crate::instrument::{FrequencyUnit, InstrumentLink, Readback};
use crate::probe::{FieldReading, ProbeLink};
use crate::regulator::{PowerRegulator, Regulate};
use crate::sweep::plan::{self, TimeUnit};
use crate::sweep::warning_log::WarningLog;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// The generator as seen by the sweep. Setters resolve with the instrument's read-back.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Returns the frequency read back, in MHz.
    async fn set_frequency_mhz(&self, mhz: f64) -> AppResult<f64>;

    /// Returns the power read back, in dBm.
    async fn set_power(&self, dbm: f64) -> AppResult<f64>;

    /// RF output switch.
    async fn set_rf_output(&self, on: bool) -> AppResult<bool>;

    /// Master modulation switch.
    async fn set_modulation_state(&self, on: bool) -> AppResult<bool>;

    /// Last power read back, in dBm.
    fn power(&self) -> f64;

    /// Highest power the source will accept, in dBm.
    fn max_power(&self) -> f64;
}

/// The field probe as seen by the sweep.
#[async_trait]
pub trait FieldSensor: Send + Sync {
    /// Latest reading, without waiting.
    fn read_current_field(&self) -> FieldReading;

    /// Waits up to `within` for a fresh reading, then returns the latest one either way.
    async fn next_reading(&self, within: Duration) -> FieldReading;
}

/// Events for presentation layers.
#[derive(Clone, Debug, PartialEq)]
pub enum SweepEvent {
    /// Frequency in MHz.
    FrequencySet(f64),
    /// Power in dBm after regulation.
    PowerSet(f64),
    /// Reading the step settled on.
    FieldUpdated(FieldReading),
    /// Progress in percent, on a log scale.
    SweepStatus(f64),
    /// Frequencies (MHz) still missed when the sweep ended.
    SweepCompleted(Vec<f64>),
    /// Path of the warning log that received the entry.
    HighFieldDetected(PathBuf),
    /// Human-readable description of the limit hit.
    PowerLimitExceeded(String),
    /// The step finished and the driver should hold the frequency this long.
    BeginDwell(Duration),
}

/// What the driver should do after a call to `step_sweep`.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// Wait this long, then step again.
    Dwell(Duration),
    /// The sweep ended normally with these frequencies (MHz) missed.
    Finished {
        /// In visit order.
        missed: Vec<f64>,
    },
    /// The sweep was stopped or aborted on a hardware fault.
    Aborted,
    /// No sweep is running.
    Idle,
}

/// How regulation at one frequency ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Regulation {
    /// Field landed inside the band.
    Accepted,
    /// Frequency recorded as missed; power is back at base.
    Missed,
    /// Hardware fault; the sweep has already been stopped.
    Aborted,
    /// A stop was requested mid-regulation.
    Interrupted,
}

/// Sweep progress. Frequencies in MHz, power in dBm.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SweepState {
    /// First frequency of the pass in progress. A re-sweep narrows this to its misses.
    pub start_freq: f64,
    /// Last frequency of the pass in progress.
    pub stop_freq: f64,
    /// Frequency being regulated, or the next one to visit.
    pub current_freq: f64,
    /// Fractional step between frequencies.
    pub sweep_term: f64,
    /// Dwell per step, in milliseconds.
    pub dwell_ms: u64,
    /// Power every step starts from.
    pub base_power: f64,
    /// Power last read back from the generator.
    pub current_power: f64,
    /// Last field reading used by regulation.
    pub field: FieldReading,
    /// True between start and finish or stop.
    pub is_sweeping: bool,
    /// The frequency being visited was clamped to `stop_freq`.
    pub last_step: bool,
    /// True while re-visiting missed frequencies.
    pub sweeping_missed: bool,
    /// Frequencies that never reached the target field, in visit order.
    pub missed_frequencies: VecDeque<f64>,
    /// Frequencies missed again during a re-sweep pass.
    pub missed_again: Vec<f64>,
}

/// Cloneable handle that asks a running sweep to stop at its next loop boundary.
#[derive(Clone, Default)]
pub struct SweepStopHandle {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl SweepStopHandle {
    /// Asks the sweep to stop and wakes a dwell in progress.
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether a stop is pending.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

/// Drives sweeps over a [`SignalSource`] and a [`FieldSensor`].
pub struct SweepController<S, F> {
    source: Arc<S>,
    sensor: Arc<F>,
    regulator: PowerRegulator,
    config: SweepSettings,
    state: SweepState,
    /// Forward sweep range (start, stop) in MHz; a re-sweep only narrows `state`.
    forward_range: (f64, f64),
    warning_log: WarningLog,
    events: broadcast::Sender<SweepEvent>,
    stop: SweepStopHandle,
    high_field_active: bool,
    finish_pending: bool,
}

impl<S, F> SweepController<S, F>
where
    S: SignalSource,
    F: FieldSensor,
{
    /// Creates an idle controller. `regulator` is retargeted to the configured field.
    pub fn new(
        source: Arc<S>,
        sensor: Arc<F>,
        config: SweepSettings,
        mut regulator: PowerRegulator,
        warning_log: WarningLog,
    ) -> Self {
        regulator.set_target(config.target_field);
        regulator.set_threshold(config.threshold);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = SweepState {
            start_freq: config.start_mhz,
            stop_freq: config.stop_mhz,
            current_freq: config.start_mhz,
            sweep_term: config.sweep_term,
            dwell_ms: config.dwell_ms,
            base_power: config.base_power_dbm,
            current_power: config.base_power_dbm,
            ..SweepState::default()
        };
        Self {
            source,
            sensor,
            regulator,
            forward_range: (config.start_mhz, config.stop_mhz),
            config,
            state,
            warning_log,
            events,
            stop: SweepStopHandle::default(),
            high_field_active: false,
            finish_pending: false,
        }
    }

    /// Builds a controller from loaded settings, opening a warning log session in `log_dir`.
    pub fn from_settings(source: Arc<S>, sensor: Arc<F>, settings: &Settings) -> AppResult<Self> {
        let warning_log = WarningLog::create_session(&settings.application.log_dir)?;
        let regulator = PowerRegulator::from_settings(
            &settings.regulator,
            settings.sweep.target_field,
            settings.sweep.threshold,
        );
        Ok(Self::new(
            source,
            sensor,
            settings.sweep.clone(),
            regulator,
            warning_log,
        ))
    }

    /// Subscribes to sweep events.
    pub fn subscribe(&self) -> broadcast::Receiver<SweepEvent> {
        self.events.subscribe()
    }

    /// Handle for stopping the sweep from another task.
    pub fn stop_handle(&self) -> SweepStopHandle {
        self.stop.clone()
    }

    /// Progress of the current or last pass.
    pub fn state(&self) -> &SweepState {
        &self.state
    }

    /// True between start and finish or stop.
    pub fn is_sweeping(&self) -> bool {
        self.state.is_sweeping
    }

    /// Frequencies missed so far, in MHz.
    pub fn missed_frequencies(&self) -> Vec<f64> {
        self.state.missed_frequencies.iter().copied().collect()
    }

    /// Path of this session's warning log.
    pub fn log_path(&self) -> &Path {
        self.warning_log.path()
    }

    /// The active regulation strategy.
    pub fn regulator(&self) -> &PowerRegulator {
        &self.regulator
    }

    /// Sets the target field in V/m.
    pub fn set_target_field(&mut self, target: f64) {
        self.config.target_field = target;
        self.regulator.set_target(target);
    }

    /// Target field in V/m.
    pub fn target_field(&self) -> f64 {
        self.config.target_field
    }

    /// Sets the acceptance band's upper factor.
    pub fn set_threshold(&mut self, threshold: f64) {
        self.config.threshold = threshold;
        self.regulator.set_threshold(threshold);
    }

    /// Sets where the next forward sweep starts, in MHz.
    pub fn set_start_frequency(&mut self, mhz: f64) {
        self.forward_range.0 = mhz;
        self.state.start_freq = mhz;
    }

    /// Start of the forward sweep, in MHz.
    pub fn start_frequency(&self) -> f64 {
        self.forward_range.0
    }

    /// Sets where the next forward sweep ends, in MHz.
    pub fn set_stop_frequency(&mut self, mhz: f64) {
        self.forward_range.1 = mhz;
        self.state.stop_freq = mhz;
    }

    /// End of the forward sweep, in MHz.
    pub fn stop_frequency(&self) -> f64 {
        self.forward_range.1
    }

    /// Sets the fractional step between frequencies.
    pub fn set_sweep_term(&mut self, term: f64) {
        self.state.sweep_term = term;
    }

    /// Sets the power each step starts from, in dBm.
    pub fn set_base_power(&mut self, dbm: f64) {
        self.state.base_power = dbm;
    }

    /// Sets the dwell per step, normalised to milliseconds.
    pub fn set_dwell(&mut self, value: f64, unit: TimeUnit) {
        self.state.dwell_ms = plan::to_millis(value, unit);
        debug!(dwell_ms = self.state.dwell_ms, "dwell time set");
    }

    /// Dwell per step.
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.state.dwell_ms)
    }

    /// Number of frequencies a forward sweep visits.
    pub fn step_count(&self) -> u32 {
        let (start, stop) = self.forward_range;
        plan::step_count(start, stop, self.state.sweep_term)
    }

    /// Estimated duration of a forward sweep.
    pub fn sweep_time(&self) -> Duration {
        let (start, stop) = self.forward_range;
        plan::sweep_time(self.state.dwell_ms, start, stop, self.state.sweep_term)
    }

    fn emit(&self, event: SweepEvent) {
        let _ = self.events.send(event);
    }

    fn ceiling(&self) -> f64 {
        self.config.power_ceiling_dbm.min(self.source.max_power())
    }

    /// Starts a forward sweep over the configured range and runs its first step.
    pub async fn start_sweep(&mut self) -> AppResult<StepOutcome> {
        (self.state.start_freq, self.state.stop_freq) = self.forward_range;
        let state = &self.state;
        if !(state.start_freq > 0.0 && state.start_freq < state.stop_freq) {
            return Err(SweepError::InvalidSweep(format!(
                "start frequency {} MHz must be positive and below stop frequency {} MHz",
                state.start_freq, state.stop_freq
            )));
        }
        if state.sweep_term <= 0.0 {
            return Err(SweepError::InvalidSweep(format!(
                "sweep term must be positive, got {}",
                state.sweep_term
            )));
        }

        self.state.current_freq = self.state.start_freq;
        self.state.missed_frequencies.clear();
        self.state.missed_again.clear();
        self.state.last_step = false;
        self.state.sweeping_missed = false;
        self.state.is_sweeping = true;
        self.finish_pending = false;
        self.high_field_active = false;
        self.stop.reset();
        self.regulator.clear();

        info!(
            start_mhz = self.state.start_freq,
            stop_mhz = self.state.stop_freq,
            sweep_term = self.state.sweep_term,
            steps = self.step_count(),
            "starting sweep"
        );
        self.enable_outputs(Duration::from_millis(self.config.start_settle_ms))
            .await?;
        self.step_sweep().await
    }

    /// Re-visits the frequencies missed by the last sweep, one at a time.
    pub async fn sweep_missed_frequencies(&mut self) -> AppResult<StepOutcome> {
        let (Some(&first), Some(&last)) = (
            self.state.missed_frequencies.front(),
            self.state.missed_frequencies.back(),
        ) else {
            debug!("no missed frequencies to re-sweep");
            return Ok(StepOutcome::Idle);
        };

        self.state.start_freq = first;
        self.state.stop_freq = last;
        self.state.current_freq = first;
        self.state.missed_frequencies.pop_front();
        self.state.missed_again.clear();
        self.state.last_step = false;
        self.state.sweeping_missed = true;
        self.state.is_sweeping = true;
        self.finish_pending = false;
        self.high_field_active = false;
        self.stop.reset();
        self.regulator.clear();

        info!(
            start_mhz = first,
            stop_mhz = last,
            remaining = self.state.missed_frequencies.len() + 1,
            "re-sweeping missed frequencies"
        );
        self.enable_outputs(Duration::from_millis(self.config.resweep_settle_ms))
            .await?;
        self.step_sweep().await
    }

    async fn enable_outputs(&mut self, settle: Duration) -> AppResult<()> {
        let result = async {
            self.state.current_power = self.source.set_power(self.state.base_power).await?;
            self.source.set_rf_output(true).await?;
            self.source.set_modulation_state(true).await?;
            Ok::<(), SweepError>(())
        }
        .await;
        if let Err(e) = result {
            self.state.is_sweeping = false;
            return Err(e);
        }
        sleep(settle).await;
        Ok(())
    }

    /// Runs one frequency step, or finishes the sweep when no frequencies remain.
    pub async fn step_sweep(&mut self) -> AppResult<StepOutcome> {
        match self.step_inner().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(frequency_mhz = self.state.current_freq, "sweep step failed: {}", e);
                self.state.is_sweeping = false;
                self.end_resweep();
                self.finish_pending = false;
                self.high_field_active = false;
                self.regulator.clear();
                self.shut_down_best_effort().await;
                Err(e)
            }
        }
    }

    async fn step_inner(&mut self) -> AppResult<StepOutcome> {
        if !self.state.is_sweeping {
            return Ok(StepOutcome::Idle);
        }
        if self.stop.is_requested() {
            self.stop_sweep().await?;
            return Ok(StepOutcome::Aborted);
        }
        if self.finish_pending || self.state.current_freq > self.state.stop_freq {
            return self.finish().await;
        }

        let frequency = self.state.current_freq;
        self.state.current_power = self.source.set_power(self.state.base_power).await?;
        self.source.set_frequency_mhz(frequency).await?;
        sleep(Duration::from_millis(self.config.step_settle_ms)).await;

        self.emit(SweepEvent::FrequencySet(frequency));
        self.emit(SweepEvent::SweepStatus(plan::log_percentage(
            frequency,
            self.state.start_freq,
            self.state.stop_freq,
        )));

        match self.adjust_power_to_target_level().await? {
            Regulation::Aborted => return Ok(StepOutcome::Aborted),
            Regulation::Interrupted => {
                self.stop_sweep().await?;
                return Ok(StepOutcome::Aborted);
            }
            Regulation::Accepted | Regulation::Missed => {}
        }

        self.emit(SweepEvent::PowerSet(self.state.current_power));
        self.emit(SweepEvent::FieldUpdated(self.state.field));
        let dwell = self.dwell();
        self.emit(SweepEvent::BeginDwell(dwell));

        self.advance();
        Ok(StepOutcome::Dwell(dwell))
    }

    fn advance(&mut self) {
        if self.state.sweeping_missed {
            match self.state.missed_frequencies.pop_front() {
                Some(next) => self.state.current_freq = next,
                None => self.finish_pending = true,
            }
        } else if self.state.last_step {
            self.finish_pending = true;
        } else {
            let (next, last) = plan::next_frequency(
                self.state.current_freq,
                self.state.stop_freq,
                self.state.sweep_term,
            );
            debug!(next_mhz = next, last_step = last, "advancing");
            self.state.current_freq = next;
            self.state.last_step = last;
        }
    }

    async fn finish(&mut self) -> AppResult<StepOutcome> {
        self.state.is_sweeping = false;
        self.finish_pending = false;
        self.end_resweep();
        self.regulator.clear();

        let outputs = self.outputs_off().await;
        let missed = self.missed_frequencies();
        info!(missed = missed.len(), "sweep completed");
        self.emit(SweepEvent::FrequencySet(self.state.current_freq));
        self.emit(SweepEvent::SweepStatus(100.0));
        self.emit(SweepEvent::SweepCompleted(missed.clone()));
        outputs?;
        Ok(StepOutcome::Finished { missed })
    }

    /// Misses repeated during a re-sweep go back on the missed list.
    fn end_resweep(&mut self) {
        if self.state.sweeping_missed {
            let again = std::mem::take(&mut self.state.missed_again);
            self.state.missed_frequencies.extend(again);
            self.state.sweeping_missed = false;
        }
    }

    async fn outputs_off(&self) -> AppResult<()> {
        self.source.set_rf_output(false).await?;
        self.source.set_modulation_state(false).await?;
        Ok(())
    }

    /// Outputs off and base power after a failed step. Each command is tried even if an
    /// earlier one fails.
    async fn shut_down_best_effort(&mut self) {
        if let Err(e) = self.source.set_rf_output(false).await {
            warn!("could not turn RF output off: {}", e);
        }
        if let Err(e) = self.source.set_modulation_state(false).await {
            warn!("could not turn modulation off: {}", e);
        }
        match self.source.set_power(self.state.base_power).await {
            Ok(dbm) => self.state.current_power = dbm,
            Err(e) => warn!("could not restore base power: {}", e),
        }
    }

    /// Stops immediately: RF and modulation off, base power restored, regulator cleared.
    pub async fn stop_sweep(&mut self) -> AppResult<()> {
        info!(frequency_mhz = self.state.current_freq, "stopping sweep");
        self.state.is_sweeping = false;
        self.end_resweep();
        self.finish_pending = false;
        self.high_field_active = false;
        self.stop.reset();
        self.regulator.clear();

        self.outputs_off().await?;
        self.state.current_power = self.source.set_power(self.state.base_power).await?;
        Ok(())
    }

    fn record_miss(&mut self, frequency: f64, message: &str) {
        if self.state.sweeping_missed {
            self.state.missed_again.push(frequency);
        } else {
            self.state.missed_frequencies.push_back(frequency);
        }
        self.log_warning(message);
    }

    /// A warning that cannot be written never interrupts the sweep.
    fn log_warning(&self, message: &str) {
        if let Err(e) = self.warning_log.append(message) {
            warn!(
                log = %self.warning_log.path().display(),
                "could not write warning log: {}", e
            );
        }
    }

    /// Regulates power at the current frequency until the field is in band or a fault fires.
    pub async fn adjust_power_to_target_level(&mut self) -> AppResult<Regulation> {
        let frequency = self.state.current_freq;
        let target = self.config.target_field;
        let upper = target * self.config.threshold;
        let ceiling = self.ceiling();
        let settle = Duration::from_millis(self.config.regulation_settle_ms);

        let mut reading = self.sensor.read_current_field();
        for iteration in 0..self.config.max_regulation_iterations {
            if self.stop.is_requested() {
                return Ok(Regulation::Interrupted);
            }
            self.state.field = reading;
            let field = reading.composite;

            if field >= target && field < upper {
                debug!(frequency_mhz = frequency, field, iteration, "field within threshold");
                self.high_field_active = false;
                return Ok(Regulation::Accepted);
            }

            if field > target * self.config.high_field_factor {
                let message = format!(
                    "Field level exceeded {}x target level: {} V/m at frequency: {} MHz and power: {} dBm",
                    self.config.high_field_factor, field, frequency, self.state.current_power
                );
                self.state.current_power = self.source.set_power(self.state.base_power).await?;
                self.record_miss(frequency, &message);
                if !self.high_field_active {
                    self.high_field_active = true;
                    self.emit(SweepEvent::HighFieldDetected(self.warning_log.path().to_path_buf()));
                }
                return Ok(Regulation::Missed);
            }

            let power = self.source.power();
            let proposed = power + self.regulator.calculate(field);

            if proposed > ceiling {
                self.high_field_active = false;
                let mut message = format!(
                    "Power limit exceeded: {:.3} dBm at frequency: {} MHz and field level: {} V/m.",
                    proposed, frequency, field
                );
                let hardware_fault = field <= self.config.hardware_fault_field;
                if hardware_fault {
                    message.push_str(" Aborting sweep. Please check hardware connection.");
                }
                warn!(frequency_mhz = frequency, power_dbm = proposed, field, "{}", message);
                self.emit(SweepEvent::PowerLimitExceeded(message.clone()));
                self.state.current_power = self.source.set_power(self.state.base_power).await?;

                if hardware_fault {
                    self.stop_sweep().await?;
                    self.log_warning(&message);
                    return Ok(Regulation::Aborted);
                }
                self.record_miss(frequency, &message);
                return Ok(Regulation::Missed);
            }

            let proposed = proposed.max(self.config.power_floor_dbm);
            self.state.current_power = self.source.set_power(proposed).await?;
            reading = self.sensor.next_reading(settle).await;
        }

        let message = format!(
            "Field did not settle within {} iterations: {} V/m at frequency: {} MHz and power: {} dBm",
            self.config.max_regulation_iterations,
            self.state.field.composite,
            frequency,
            self.state.current_power
        );
        self.high_field_active = false;
        self.state.current_power = self.source.set_power(self.state.base_power).await?;
        self.record_miss(frequency, &message);
        Ok(Regulation::Missed)
    }

    async fn drive(&mut self, mut outcome: StepOutcome) -> AppResult<StepOutcome> {
        loop {
            match outcome {
                StepOutcome::Dwell(dwell) => {
                    let stop = self.stop.clone();
                    let notified = stop.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if !stop.is_requested() {
                        tokio::select! {
                            _ = sleep(dwell) => {}
                            _ = &mut notified => {}
                        }
                    }
                    outcome = self.step_sweep().await?;
                }
                done => return Ok(done),
            }
        }
    }

    /// Runs a full forward sweep, dwelling between steps. Returns `Finished` or `Aborted`.
    pub async fn run(&mut self) -> AppResult<StepOutcome> {
        let first = self.start_sweep().await?;
        self.drive(first).await
    }

    /// Runs a re-sweep of the missed frequencies to completion.
    pub async fn run_missed(&mut self) -> AppResult<StepOutcome> {
        let first = self.sweep_missed_frequencies().await?;
        self.drive(first).await
    }
}

fn expect_readback<T>(
    command: &str,
    readback: Readback,
    extract: impl FnOnce(&Readback) -> Option<T>,
) -> AppResult<T> {
    extract(&readback).ok_or_else(|| SweepError::UnexpectedResponse {
        command: command.to_string(),
        response: format!("{:?}", readback),
    })
}

#[async_trait]
impl SignalSource for InstrumentLink {
    async fn set_frequency_mhz(&self, mhz: f64) -> AppResult<f64> {
        let readback = self.set_frequency(mhz, FrequencyUnit::MHz).wait().await?;
        expect_readback(":FREQ", readback, |r| match r {
            Readback::Frequency(hz) => Some(hz / FrequencyUnit::MHz.scale()),
            _ => None,
        })
    }

    async fn set_power(&self, dbm: f64) -> AppResult<f64> {
        let readback = InstrumentLink::set_power(self, dbm).wait().await?;
        expect_readback(":POW", readback, |r| match r {
            Readback::Power(dbm) => Some(*dbm),
            _ => None,
        })
    }

    async fn set_rf_output(&self, on: bool) -> AppResult<bool> {
        let readback = InstrumentLink::set_rf_output(self, on).wait().await?;
        expect_readback(":OUTP:STAT", readback, |r| match r {
            Readback::RfOutput(on) => Some(*on),
            _ => None,
        })
    }

    async fn set_modulation_state(&self, on: bool) -> AppResult<bool> {
        let readback = InstrumentLink::set_modulation_state(self, on).wait().await?;
        expect_readback(":OUTP:MOD:STAT", readback, |r| match r {
            Readback::ModulationState(on) => Some(*on),
            _ => None,
        })
    }

    fn power(&self) -> f64 {
        InstrumentLink::power(self)
    }

    fn max_power(&self) -> f64 {
        InstrumentLink::max_power(self)
    }
}

#[async_trait]
impl FieldSensor for ProbeLink {
    fn read_current_field(&self) -> FieldReading {
        ProbeLink::read_current_field(self)
    }

    async fn next_reading(&self, within: Duration) -> FieldReading {
        let mut field = self.watch_field();
        let _ = tokio::time::timeout(within, field.changed()).await;
        let reading = *field.borrow();
        reading
    }
}
