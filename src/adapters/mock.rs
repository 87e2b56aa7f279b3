//! In-process instrument simulators.
//!
//! [`SimulatedBench`] models a signal generator driving an antenna and a field probe
//! measuring the result. Both speak their real wire protocols over `tokio::io::duplex`
//! pipes, so the links under test cannot tell them from hardware. The probe reports a
//! field derived from the generator's power, frequency and RF state, unless a fixed
//! reading has been forced.

use crate::adapters::scpi_adapter::ScpiStream;
use crate::probe::{ErrorCode, FieldReading, ProbeCommand};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tracing::trace;

const PIPE_CAPACITY: usize = 4096;

/// Identity string returned by the simulated generator.
pub const SIMULATED_IDN: &str = "Agilent Technologies, N5181A, MY-SIM0001, A.01.80";

#[derive(Debug)]
struct BenchState {
    settings: HashMap<&'static str, String>,
    frequency_hz: f64,
    power_dbm: f64,
    rf_on: bool,
    command_log: Vec<String>,
    fixed_field: Option<FieldReading>,
    probe_errors: VecDeque<ErrorCode>,
    battery_fail: bool,
    battery_percent: u8,
    temperature_f: f64,
    generator_delay: Duration,
}

impl Default for BenchState {
    fn default() -> Self {
        Self {
            settings: HashMap::new(),
            frequency_hz: 1e9,
            power_dbm: -30.0,
            rf_on: false,
            command_log: Vec::new(),
            fixed_field: None,
            probe_errors: VecDeque::new(),
            battery_fail: false,
            battery_percent: 87,
            temperature_f: 72.5,
            generator_delay: Duration::ZERO,
        }
    }
}

impl BenchState {
    // 0 dBm gives roughly 1 V/m, with a gentle ripple across frequency.
    fn modelled_field(&self) -> FieldReading {
        if !self.rf_on {
            return FieldReading::default();
        }
        let mhz = self.frequency_hz / 1e6;
        let coupling_db = 2.0 * (mhz.max(1.0).ln() * 3.0).sin();
        let composite = 10f64.powf((self.power_dbm + coupling_db) / 20.0).min(99.99);
        let axis = composite / 3f64.sqrt();
        FieldReading {
            composite,
            x: axis,
            y: axis,
            z: axis,
        }
    }
}

/// Shared state of a simulated generator + probe pair.
#[derive(Clone, Default)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
}

impl SimulatedBench {
    /// A bench with RF off at -30 dBm and 1 GHz, and the field following the model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the generator simulator and returns the host side of its SCPI session.
    pub fn generator(&self, timeout: Duration) -> ScpiStream<DuplexStream> {
        let (host, device) = duplex(PIPE_CAPACITY);
        tokio::spawn(run_generator(device, self.state.clone()));
        ScpiStream::new(host, timeout)
    }

    /// Starts the probe simulator and returns the host side of its serial line.
    pub fn probe(&self) -> DuplexStream {
        let (host, device) = duplex(PIPE_CAPACITY);
        tokio::spawn(run_probe(device, self.state.clone()));
        host
    }

    /// Every non-query line the generator received, in order.
    pub fn command_log(&self) -> Vec<String> {
        self.state.lock().command_log.clone()
    }

    /// Forces the probe to report `reading` regardless of generator state.
    pub fn set_fixed_field(&self, reading: Option<FieldReading>) {
        self.state.lock().fixed_field = reading;
    }

    /// The next probe response, whatever was asked, is `E<code>`.
    pub fn inject_probe_error(&self, code: ErrorCode) {
        self.state.lock().probe_errors.push_back(code);
    }

    /// Sets the probe's trailing `F` battery status flag.
    pub fn set_battery_fail(&self, failed: bool) {
        self.state.lock().battery_fail = failed;
    }

    /// Delay before each generator reply.
    pub fn set_generator_delay(&self, delay: Duration) {
        self.state.lock().generator_delay = delay;
    }

    /// Generator RF output switch.
    pub fn rf_on(&self) -> bool {
        self.state.lock().rf_on
    }

    /// Generator output power, at the instrument's 0.01 dB resolution.
    pub fn power_dbm(&self) -> f64 {
        self.state.lock().power_dbm
    }
}

fn header_key(header: &str) -> Option<&'static str> {
    const HEADERS: [&str; 21] = [
        ":FREQ",
        ":POW",
        ":OUTP:STAT",
        ":OUTP:MOD:STAT",
        ":AM:STAT",
        ":FM:STAT",
        ":PM:STAT",
        ":AM:SOUR",
        ":FM:SOUR",
        ":PM:SOUR",
        ":AM:EXT:COUP",
        ":FM:EXT:COUP",
        ":PM:EXT:COUP",
        ":AM:INT:FREQ",
        ":FM:INT:FREQ",
        ":PM:INT:FREQ",
        ":AM:TYPE",
        ":AM:MODE",
        ":AM:DEPT:LIN",
        ":AM:DEPT:EXP",
        ":PM:BAND",
    ];
    HEADERS.iter().copied().find(|h| h.eq_ignore_ascii_case(header))
}

fn unit_scale(unit: &str) -> f64 {
    match unit.to_ascii_uppercase().as_str() {
        "GHZ" => 1e9,
        "MHZ" => 1e6,
        "KHZ" => 1e3,
        _ => 1.0,
    }
}

fn apply_setting(state: &mut BenchState, header: &'static str, args: &[&str]) {
    let Some(first) = args.first() else {
        return;
    };
    let stored = match header {
        ":FREQ" | ":AM:INT:FREQ" | ":FM:INT:FREQ" | ":PM:INT:FREQ" => {
            let hz = first.parse::<f64>().unwrap_or(0.0) * args.get(1).map_or(1.0, |u| unit_scale(u));
            if header == ":FREQ" {
                state.frequency_hz = hz;
            }
            format!("{:E}", hz)
        }
        ":POW" => {
            // The instrument resolves power to 0.01 dB.
            let dbm = (first.parse::<f64>().unwrap_or(state.power_dbm) * 100.0).round() / 100.0;
            state.power_dbm = dbm;
            format!("{:E}", dbm)
        }
        _ => match first.to_ascii_uppercase().as_str() {
            "ON" => "1".to_string(),
            "OFF" => "0".to_string(),
            other => other.to_string(),
        },
    };
    if header == ":OUTP:STAT" {
        state.rf_on = stored == "1";
    }
    state.settings.insert(header, stored);
}

fn answer_query(state: &BenchState, query: &str) -> String {
    if query.eq_ignore_ascii_case("*OPC") {
        return "1".to_string();
    }
    if query.eq_ignore_ascii_case("*IDN") {
        return SIMULATED_IDN.to_string();
    }
    match header_key(query) {
        Some(":FREQ") => format!("{:E}", state.frequency_hz),
        Some(":POW") => format!("{:E}", state.power_dbm),
        Some(key) => state
            .settings
            .get(key)
            .cloned()
            .unwrap_or_else(|| "0".to_string()),
        None => "-113,\"Undefined header\"".to_string(),
    }
}

async fn run_generator(device: DuplexStream, state: Arc<Mutex<BenchState>>) {
    let (reader, mut writer) = tokio::io::split(device);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        trace!(line, "simulated generator received");
        let (reply, delay) = {
            let mut state = state.lock();
            let delay = state.generator_delay;
            let reply = if let Some(query) = line.strip_suffix('?') {
                Some(answer_query(&state, query))
            } else {
                state.command_log.push(line.to_string());
                let mut parts = line.split_whitespace();
                let header = parts.next().unwrap_or_default();
                let args: Vec<&str> = parts.collect();
                if let Some(key) = header_key(header) {
                    apply_setting(&mut state, key, &args);
                }
                None
            };
            (reply, delay)
        };
        if let Some(reply) = reply {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if writer.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

fn pad_frame(mut frame: String, size: usize, terminator: &str) -> Vec<u8> {
    while frame.len() + terminator.len() < size {
        frame.push(' ');
    }
    frame.push_str(terminator);
    frame.into_bytes()
}

fn probe_frame(state: &mut BenchState, command: ProbeCommand) -> Vec<u8> {
    let size = command.block_size();
    if let Some(code) = state.probe_errors.pop_front() {
        return pad_frame(format!(":E{}", code.index()), size, "\r\n");
    }
    match command {
        ProbeCommand::Identity => pad_frame(
            format!(":I{:<4}{:<10}{:<8}{:<8}", "6006", "1.0.0", "SIM00001", "01012025"),
            size,
            "\r\n",
        ),
        ProbeCommand::Battery => format!(":B{:02X}\r\n", state.battery_percent).into_bytes(),
        ProbeCommand::Temperature => format!(":T{:05.1}\n", state.temperature_f).into_bytes(),
        ProbeCommand::CompositeData => {
            let reading = state.fixed_field.unwrap_or_else(|| state.modelled_field());
            let field = |v: f64| format!("{:05.2}", v.clamp(0.0, 99.99));
            format!(
                ":D{}{}{}{}{}\n",
                field(reading.x),
                field(reading.y),
                field(reading.z),
                field(reading.composite),
                if state.battery_fail { 'F' } else { 'N' }
            )
            .into_bytes()
        }
    }
}

async fn run_probe(mut device: DuplexStream, state: Arc<Mutex<BenchState>>) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = match device.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);

        loop {
            let command = match pending.as_slice() {
                [b'I', ..] => Some((ProbeCommand::Identity, 1)),
                [b'B', b'P', ..] => Some((ProbeCommand::Battery, 2)),
                [b'T', b'F', ..] => Some((ProbeCommand::Temperature, 2)),
                [b'D', b'5', ..] => Some((ProbeCommand::CompositeData, 2)),
                [b'B' | b'T' | b'D'] | [] => None,
                [_, ..] => {
                    // Unknown byte: answer like the probe does.
                    pending.remove(0);
                    let frame = pad_frame(
                        format!(":E{}", ErrorCode::InvalidCommand.index()),
                        ProbeCommand::Battery.block_size(),
                        "\r\n",
                    );
                    if device.write_all(&frame).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            let Some((command, consumed)) = command else {
                break;
            };
            pending.drain(..consumed);
            let frame = probe_frame(&mut state.lock(), command);
            if device.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}
