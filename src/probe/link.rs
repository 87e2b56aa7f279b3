//! Field probe I/O loop.
//!
//! One task owns the serial line and interleaves three duties:
//! - composite data every `data_interval_ms`, feeding the latest-value snapshot
//! - battery and temperature every `info_interval_ms`
//! - ad-hoc requests queued through [`ProbeLink`]
//!
//! Each transaction writes the command bytes and reads exactly the command's block size.
//! The snapshot is level-triggered: readers always see the most recent parse and may
//! observe the same reading twice or skip one.
//!
//! A transport fault publishes [`ProbeEvent::ConnectionError`] and ends the loop.
//! Reconnecting is an explicit [`ProbeLink::start`].

use crate::adapters::serial_adapter::{open_probe_port, read_block};
use crate::config::ProbeSettings;
use crate::error::{AppResult, SweepError};
use crate::probe::protocol::{
    decode, ErrorCode, FieldReading, ProbeCommand, ProbeFault, ProbeIdentity, ProbeResponse,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Events published by the probe link.
#[derive(Clone, Debug, PartialEq)]
pub enum ProbeEvent {
    /// Answer to an identity request. One is queued on every start.
    Identity(ProbeIdentity),
    /// Battery charge in percent.
    Battery(u8),
    /// Probe temperature in °F.
    Temperature(f64),
    /// Protocol fault: error frame, battery failure or unparseable response.
    Error(ProbeFault),
    /// Transport fault. The I/O loop has stopped.
    ConnectionError(String),
}

struct Session {
    commands: mpsc::UnboundedSender<ProbeCommand>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Handle to the field probe.
pub struct ProbeLink {
    settings: ProbeSettings,
    field: Arc<watch::Sender<FieldReading>>,
    events: broadcast::Sender<ProbeEvent>,
    running: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
}

impl ProbeLink {
    /// Creates a stopped link. Nothing touches the port until [`ProbeLink::start`].
    pub fn new(settings: ProbeSettings) -> Self {
        let (field, _) = watch::channel(FieldReading::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            field: Arc::new(field),
            events,
            running: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
        }
    }

    /// Opens the configured serial port and starts the I/O loop.
    ///
    /// An open failure is published as [`ProbeEvent::ConnectionError`] and returned.
    pub fn start(&self) -> AppResult<()> {
        match open_probe_port(&self.settings.port, self.settings.baud_rate) {
            Ok(port) => {
                info!(port = %self.settings.port, "field probe port open");
                self.start_with(port);
                Ok(())
            }
            Err(e) => {
                error!(port = %self.settings.port, "cannot open field probe: {}", e);
                self.running.store(false, Ordering::SeqCst);
                let _ = self.events.send(ProbeEvent::ConnectionError(e.to_string()));
                Err(e)
            }
        }
    }

    /// Starts the I/O loop over an already-open byte stream and queues an identity request.
    pub fn start_with<T>(&self, io: T)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = self.session.lock();
        if self.is_running() {
            warn!("field probe already running");
            return;
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let _ = commands.send(ProbeCommand::Identity);
        self.running.store(true, Ordering::SeqCst);

        let io_loop = IoLoop {
            io,
            read_timeout: Duration::from_millis(self.settings.read_timeout_ms),
            data_interval: Duration::from_millis(self.settings.data_interval_ms.max(1)),
            info_interval: Duration::from_millis(self.settings.info_interval_ms.max(1)),
            field: self.field.clone(),
            events: self.events.clone(),
            running: self.running.clone(),
            battery_failed: false,
        };
        let task = tokio::spawn(io_loop.run(command_rx, shutdown_rx));

        *session = Some(Session {
            commands,
            shutdown,
            task,
        });
    }

    /// Stops the I/O loop and waits for it to release the port.
    pub async fn stop(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            let _ = session.shutdown.send(true);
            drop(session.commands);
            if let Err(e) = session.task.await {
                warn!("field probe task failed: {}", e);
            }
            info!("field probe stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// False before start, after stop, and once a transport fault ends the loop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribes to probe events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.events.subscribe()
    }

    /// Receiver that is notified on every new field reading.
    pub fn watch_field(&self) -> watch::Receiver<FieldReading> {
        self.field.subscribe()
    }

    /// Most recent parsed reading. Never blocks.
    pub fn read_current_field(&self) -> FieldReading {
        *self.field.borrow()
    }

    fn request(&self, command: ProbeCommand) {
        match self.session.lock().as_ref() {
            Some(session) if self.is_running() => {
                let _ = session.commands.send(command);
            }
            _ => debug!(?command, "field probe not running, request dropped"),
        }
    }

    /// Queues an identity read; the answer arrives as [`ProbeEvent::Identity`].
    pub fn request_identity(&self) {
        self.request(ProbeCommand::Identity);
    }

    /// Queues a battery read ahead of the next periodic one.
    pub fn request_battery(&self) {
        self.request(ProbeCommand::Battery);
    }

    /// Queues a temperature read ahead of the next periodic one.
    pub fn request_temperature(&self) {
        self.request(ProbeCommand::Temperature);
    }
}

struct IoLoop<T> {
    io: T,
    read_timeout: Duration,
    data_interval: Duration,
    info_interval: Duration,
    field: Arc<watch::Sender<FieldReading>>,
    events: broadcast::Sender<ProbeEvent>,
    running: Arc<AtomicBool>,
    battery_failed: bool,
}

impl<T> IoLoop<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ProbeCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut data = interval(self.data_interval);
        data.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut info = interval_at(Instant::now() + self.info_interval, self.info_interval);
        info.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut backlog: VecDeque<ProbeCommand> = VecDeque::new();

        debug!("field probe I/O loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let command = match backlog.pop_front() {
                Some(command) => command,
                None => tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(command) = commands.recv() => command,
                    _ = data.tick() => ProbeCommand::CompositeData,
                    _ = info.tick() => {
                        backlog.push_back(ProbeCommand::Temperature);
                        ProbeCommand::Battery
                    }
                },
            };

            if let Err(e) = self.transact(command).await {
                error!(?command, "field probe transport fault: {}", e);
                let _ = self.events.send(ProbeEvent::ConnectionError(e.to_string()));
                break;
            }
        }
        self.running.store(false, Ordering::SeqCst);
        debug!("field probe I/O loop stopped");
    }

    /// Runs one command. Only transport faults are returned.
    async fn transact(&mut self, command: ProbeCommand) -> Result<(), SweepError> {
        self.io.write_all(command.bytes()).await?;
        self.io.flush().await?;
        let block = read_block(&mut self.io, command.block_size(), self.read_timeout).await?;

        match decode(command, &block) {
            Ok(frame) => {
                self.battery_fail(frame.battery_fail);
                self.dispatch(frame.response);
            }
            Err(fault) => {
                warn!(?command, "field probe fault: {}", fault);
                let _ = self.events.send(ProbeEvent::Error(fault));
            }
        }
        Ok(())
    }

    // Reported once per failure, not on every 5 ms sample.
    fn battery_fail(&mut self, failed: bool) {
        if failed && !self.battery_failed {
            warn!("field probe reports battery failure");
            let _ = self
                .events
                .send(ProbeEvent::Error(ProbeFault::Device(ErrorCode::BatteryFail)));
        }
        self.battery_failed = failed;
    }

    fn dispatch(&self, response: ProbeResponse) {
        let event = match response {
            ProbeResponse::Field(reading) => {
                self.field.send_replace(reading);
                return;
            }
            ProbeResponse::Identity(identity) => {
                info!(model = %identity.model, serial = %identity.serial_number, "field probe identified");
                ProbeEvent::Identity(identity)
            }
            ProbeResponse::Battery(percent) => ProbeEvent::Battery(percent),
            ProbeResponse::Temperature(temperature) => ProbeEvent::Temperature(temperature),
        };
        let _ = self.events.send(event);
    }
}
