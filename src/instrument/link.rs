//! Single-writer command link to the signal generator.
//!
//! Setters never touch the socket. They push a typed [`Command`] onto one unbounded FIFO
//! and return a [`Pending`] handle. A dedicated writer task pops commands one at a time
//! and runs the full cycle for each:
//!
//! ```text
//! write(payload) -> *OPC? -> <header>? -> publish InstrumentEvent + resolve Pending
//! ```
//!
//! so exactly one command is in flight no matter how many producers share the link.
//! Every completion carries the instrument's read-back value, not the requested one.
//!
//! Transport faults (timeout, closed socket) end the writer and surface as
//! [`InstrumentEvent::ConnectionError`]; protocol faults surface as
//! [`InstrumentEvent::Error`] and the writer keeps going.

use crate::adapters::scpi_adapter::{connect_tcp, ScpiStream};
use crate::config::SignalGeneratorSettings;
use crate::error::{AppResult, SweepError};
use crate::error_recovery::{retry_detection, Reachable, RetryPolicy};
use crate::instrument::scpi::{
    AmMode, AmType, Command, CommandKind, Coupling, FrequencyUnit, Modulation, ModulationSource,
    PmBandwidth, Readback,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Events published by the link.
#[derive(Clone, Debug, PartialEq)]
pub enum InstrumentEvent {
    /// `*IDN?` answered.
    Connected(String),
    /// Result of the reachability check. Published once per detection run.
    Detected(bool),
    /// A queued command finished; carries the read-back value.
    Completed(Readback),
    /// A power request was above the instrument maximum and was clamped.
    PowerClamped {
        /// dBm asked for.
        requested: f64,
        /// dBm queued.
        applied: f64,
    },
    /// Protocol fault. The link keeps running.
    Error(String),
    /// Transport fault. The writer has stopped.
    ConnectionError(String),
}

/// Last read-back values, updated by the writer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeneratorState {
    /// `*IDN?` answer, once seen.
    pub identity: Option<String>,
    /// Carrier frequency in Hz.
    pub frequency_hz: f64,
    /// Output power in dBm.
    pub power_dbm: f64,
    /// RF output switch.
    pub rf_on: bool,
    /// Master modulation switch.
    pub modulation_on: bool,
}

/// Completion handle for one queued command.
#[must_use = "a pending command is still queued; await it or drop it to fire and forget"]
pub struct Pending {
    rx: oneshot::Receiver<AppResult<Readback>>,
}

impl Pending {
    /// Waits for the instrument's read-back. Fails with `LinkClosed` if the writer is gone.
    pub async fn wait(self) -> AppResult<Readback> {
        self.rx.await.unwrap_or(Err(SweepError::LinkClosed))
    }
}

struct Queued {
    command: Command,
    epoch: u64,
    ack: oneshot::Sender<AppResult<Readback>>,
}

/// Handle to the signal generator.
pub struct InstrumentLink {
    commands: mpsc::UnboundedSender<Queued>,
    epoch: Arc<AtomicU64>,
    events: broadcast::Sender<InstrumentEvent>,
    state: watch::Receiver<GeneratorState>,
    running: Arc<AtomicBool>,
    settings: SignalGeneratorSettings,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl InstrumentLink {
    /// Opens the SCPI socket, starts the writer and queues `*IDN?`.
    pub async fn connect(settings: SignalGeneratorSettings) -> AppResult<Self> {
        let scpi = connect_tcp(&settings.address, settings.port, settings.timeout()).await?;
        info!(address = %settings.address, port = settings.port, "signal generator connected");
        let link = Self::spawn(scpi, settings);
        drop(link.init_instrument());
        Ok(link)
    }

    /// Starts the writer over an already-open SCPI session.
    pub fn spawn<T>(scpi: ScpiStream<T>, settings: SignalGeneratorSettings) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state) = watch::channel(GeneratorState::default());
        let epoch = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let writer = Writer {
            scpi,
            epoch: epoch.clone(),
            events: events.clone(),
            state: state_tx,
            running: running.clone(),
        };
        let task = tokio::spawn(writer.run(rx));

        Self {
            commands,
            epoch,
            events,
            state,
            running,
            settings,
            writer: Mutex::new(Some(task)),
        }
    }

    /// Subscribes to link events.
    pub fn subscribe(&self) -> broadcast::Receiver<InstrumentEvent> {
        self.events.subscribe()
    }

    /// Latest read-back snapshot.
    pub fn state(&self) -> GeneratorState {
        self.state.borrow().clone()
    }

    /// Read-back snapshots, updated after every completed command.
    pub fn watch_state(&self) -> watch::Receiver<GeneratorState> {
        self.state.clone()
    }

    /// False once the writer has stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Last power read back from the instrument, in dBm.
    pub fn power(&self) -> f64 {
        self.state.borrow().power_dbm
    }

    /// Last carrier frequency read back from the instrument, in Hz.
    pub fn frequency_hz(&self) -> f64 {
        self.state.borrow().frequency_hz
    }

    /// Power clamp applied to every request, in dBm.
    pub fn max_power(&self) -> f64 {
        self.settings.max_power_dbm
    }

    fn enqueue(&self, command: Command) -> Pending {
        let (ack, rx) = oneshot::channel();
        let queued = Queued {
            command,
            epoch: self.epoch.load(Ordering::SeqCst),
            ack,
        };
        if let Err(mpsc::error::SendError(queued)) = self.commands.send(queued) {
            debug!(kind = ?queued.command.kind, "writer stopped, command dropped");
        }
        Pending { rx }
    }

    /// Queues `*IDN?`. Publishes [`InstrumentEvent::Connected`] when answered.
    pub fn init_instrument(&self) -> Pending {
        self.enqueue(Command::identity())
    }

    /// Queues a carrier frequency change.
    pub fn set_frequency(&self, value: f64, unit: FrequencyUnit) -> Pending {
        self.enqueue(Command::frequency(value, unit))
    }

    /// Queues a power change, clamping to the instrument maximum with a warning.
    pub fn set_power(&self, dbm: f64) -> Pending {
        let (command, clamped) = Command::power(dbm, self.settings.max_power_dbm);
        if let Some(applied) = clamped {
            warn!(requested = dbm, applied, "Power above amplifier maximum input, clamping");
            let _ = self.events.send(InstrumentEvent::PowerClamped {
                requested: dbm,
                applied,
            });
        }
        self.enqueue(command)
    }

    /// Queues the RF output switch.
    pub fn set_rf_output(&self, on: bool) -> Pending {
        self.enqueue(Command::rf_output(on))
    }

    /// Queues the master modulation switch.
    pub fn set_modulation_state(&self, on: bool) -> Pending {
        self.enqueue(Command::modulation_state(on))
    }

    /// Enables one modulation scheme after switching the other two off.
    /// The returned handle resolves with the chosen scheme's state.
    pub fn set_modulation_type(&self, modulation: Modulation) -> Pending {
        let [first, second, chosen] = Command::modulation_type(modulation);
        drop(self.enqueue(first));
        drop(self.enqueue(second));
        self.enqueue(chosen)
    }

    /// Switches one modulation scheme without touching the others.
    pub fn set_sub_state(&self, modulation: Modulation, on: bool) -> Pending {
        self.enqueue(Command::sub_state(modulation, on))
    }

    /// Selects internal or external modulation for one scheme.
    pub fn set_source(&self, modulation: Modulation, source: ModulationSource) -> Pending {
        self.enqueue(Command::source(modulation, source))
    }

    /// Sets the external input coupling for one scheme.
    pub fn set_coupling(&self, modulation: Modulation, coupling: Coupling) -> Pending {
        self.enqueue(Command::coupling(modulation, coupling))
    }

    /// Linear or exponential AM.
    pub fn set_am_type(&self, am_type: AmType) -> Pending {
        self.enqueue(Command::am_type(am_type))
    }

    /// Normal or deep AM.
    pub fn set_am_mode(&self, mode: AmMode) -> Pending {
        self.enqueue(Command::am_mode(mode))
    }

    /// Linear AM depth in percent.
    pub fn set_am_linear_depth(&self, percent: f64) -> Pending {
        self.enqueue(Command::am_linear_depth(percent))
    }

    /// Exponential AM depth in dB.
    pub fn set_am_exponential_depth(&self, db: f64) -> Pending {
        self.enqueue(Command::am_exponential_depth(db))
    }

    /// AM internal rate in kHz.
    pub fn set_am_rate(&self, khz: f64) -> Pending {
        self.enqueue(Command::am_rate(khz))
    }

    /// FM internal rate.
    pub fn set_fm_rate(&self, value: f64, unit: FrequencyUnit) -> Pending {
        self.enqueue(Command::angle_rate(Modulation::Fm, value, unit))
    }

    /// PM internal rate.
    pub fn set_pm_rate(&self, value: f64, unit: FrequencyUnit) -> Pending {
        self.enqueue(Command::angle_rate(Modulation::Pm, value, unit))
    }

    /// PM bandwidth.
    pub fn set_pm_bandwidth(&self, bandwidth: PmBandwidth) -> Pending {
        self.enqueue(Command::pm_bandwidth(bandwidth))
    }

    /// Flushes every command queued so far without executing it.
    ///
    /// Their handles resolve with `CommandCancelled`. A command already in flight completes.
    pub fn clear_queue(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, "command queue cleared");
    }

    /// Runs the reachability check and publishes [`InstrumentEvent::Detected`].
    pub async fn detect(&self) -> bool {
        let detected = detect(&self.settings).await;
        let _ = self.events.send(InstrumentEvent::Detected(detected));
        detected
    }

    /// Turns RF off, stops the writer and waits for it to exit.
    pub async fn shutdown(&self) {
        if self.is_running() {
            drop(self.set_rf_output(false));
            drop(self.enqueue(Command::exit()));
        }
        let task = self.writer.lock().take();
        if let Some(task) = task {
            let grace = self.settings.timeout() * 3;
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => info!("signal generator link stopped"),
                Ok(Err(e)) => warn!("signal generator writer task failed: {}", e),
                Err(_) => warn!("signal generator writer did not stop within {:?}", grace),
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

struct Writer<T> {
    scpi: ScpiStream<T>,
    epoch: Arc<AtomicU64>,
    events: broadcast::Sender<InstrumentEvent>,
    state: watch::Sender<GeneratorState>,
    running: Arc<AtomicBool>,
}

impl<T> Writer<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Queued>) {
        debug!("SCPI writer started");
        while let Some(Queued {
            command,
            epoch,
            ack,
        }) = commands.recv().await
        {
            if command.kind == CommandKind::Exit {
                debug!("SCPI writer exiting");
                let _ = ack.send(Err(SweepError::LinkClosed));
                break;
            }
            if epoch < self.epoch.load(Ordering::SeqCst) {
                let _ = ack.send(Err(SweepError::CommandCancelled));
                continue;
            }

            match self.execute(&command).await {
                Ok(readback) => {
                    self.publish(&readback);
                    let _ = ack.send(Ok(readback));
                }
                Err(e) if e.is_transport() => {
                    error!(kind = ?command.kind, "signal generator transport fault: {}", e);
                    let _ = self.events.send(InstrumentEvent::ConnectionError(e.to_string()));
                    let _ = ack.send(Err(e));
                    break;
                }
                Err(e) => {
                    warn!(kind = ?command.kind, "signal generator protocol fault: {}", e);
                    let _ = self.events.send(InstrumentEvent::Error(e.to_string()));
                    let _ = ack.send(Err(e));
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn execute(&mut self, command: &Command) -> AppResult<Readback> {
        if !command.payload.is_empty() {
            self.scpi.write(&command.payload).await?;
        }
        self.scpi.wait_operation_complete().await?;
        let raw = self.scpi.query(&command.kind.readback_query()).await?;
        debug!(kind = ?command.kind, readback = %raw, "command complete");
        command.kind.parse_readback(&raw)
    }

    fn publish(&self, readback: &Readback) {
        self.state.send_modify(|state| match readback {
            Readback::Identity(id) => state.identity = Some(id.clone()),
            Readback::Frequency(hz) => state.frequency_hz = *hz,
            Readback::Power(dbm) => state.power_dbm = *dbm,
            Readback::RfOutput(on) => state.rf_on = *on,
            Readback::ModulationState(on) => state.modulation_on = *on,
            _ => {}
        });
        let event = match readback {
            Readback::Identity(id) => InstrumentEvent::Connected(id.clone()),
            other => InstrumentEvent::Completed(other.clone()),
        };
        let _ = self.events.send(event);
    }
}

struct Reachability<'a> {
    settings: &'a SignalGeneratorSettings,
}

#[async_trait]
impl Reachable for Reachability<'_> {
    async fn check(&mut self) -> AppResult<()> {
        let timeout = self.settings.timeout();
        let address = (self.settings.address.as_str(), self.settings.port);
        tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| SweepError::Timeout(timeout))??;
        Ok(())
    }
}

/// Checks that the generator accepts connections, retrying `detection_attempts` times.
pub async fn detect(settings: &SignalGeneratorSettings) -> bool {
    let mut target = Reachability { settings };
    match retry_detection(&mut target, RetryPolicy::from(settings)).await {
        Ok(attempt) => {
            info!(address = %settings.address, attempt, "signal generator detected");
            true
        }
        Err(e) => {
            warn!(address = %settings.address, "signal generator not detected: {}", e);
            false
        }
    }
}
