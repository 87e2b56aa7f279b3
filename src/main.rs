//! `immunisweep` command-line driver.
//!
//! Runs closed-loop field sweeps against the bench hardware, or against the in-process
//! simulator with `--simulate`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use immunisweep::adapters::SimulatedBench;
use immunisweep::config::{Settings, DEFAULT_CONFIG_PATH};
use immunisweep::instrument::{self, InstrumentEvent, InstrumentLink};
use immunisweep::probe::{ProbeEvent, ProbeLink};
use immunisweep::sweep::{StepOutcome, SweepController, SweepEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "immunisweep", version, about = "Radiated-immunity field sweep controller")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the in-process generator and probe simulators instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a field sweep
    Sweep {
        /// Start frequency in MHz
        #[arg(long)]
        start: Option<f64>,
        /// Stop frequency in MHz
        #[arg(long)]
        stop: Option<f64>,
        /// Fractional step between frequencies (0.01 = 1 %)
        #[arg(long)]
        term: Option<f64>,
        /// Target field in V/m
        #[arg(long)]
        target: Option<f64>,
        /// Dwell per frequency in milliseconds
        #[arg(long)]
        dwell_ms: Option<u64>,
        /// Re-sweep the missed frequencies once the sweep completes
        #[arg(long)]
        resweep: bool,
    },
    /// Stream field probe readings
    Probe {
        /// How long to stream, in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Query generator and probe identities
    Identify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(name = %settings.application.name, simulate = cli.simulate, "starting");

    match cli.command {
        Commands::Sweep {
            start,
            stop,
            term,
            target,
            dwell_ms,
            resweep,
        } => {
            let sweep = &mut settings.sweep;
            sweep.start_mhz = start.unwrap_or(sweep.start_mhz);
            sweep.stop_mhz = stop.unwrap_or(sweep.stop_mhz);
            sweep.sweep_term = term.unwrap_or(sweep.sweep_term);
            sweep.target_field = target.unwrap_or(sweep.target_field);
            sweep.dwell_ms = dwell_ms.unwrap_or(sweep.dwell_ms);
            settings.validate().context("invalid sweep parameters")?;
            run_sweep(&settings, cli.simulate, resweep).await
        }
        Commands::Probe { seconds } => stream_probe(&settings, cli.simulate, seconds).await,
        Commands::Identify => identify(&settings, cli.simulate).await,
    }
}

async fn open_generator(
    settings: &Settings,
    bench: Option<&SimulatedBench>,
) -> Result<Arc<InstrumentLink>> {
    let generator = match bench {
        Some(bench) => {
            let link = InstrumentLink::spawn(
                bench.generator(settings.signal_generator.timeout()),
                settings.signal_generator.clone(),
            );
            drop(link.init_instrument());
            link
        }
        None => InstrumentLink::connect(settings.signal_generator.clone())
            .await
            .with_context(|| {
                format!(
                    "connecting to signal generator at {}:{}",
                    settings.signal_generator.address, settings.signal_generator.port
                )
            })?,
    };
    Ok(Arc::new(generator))
}

fn start_probe(probe: &ProbeLink, bench: Option<&SimulatedBench>) -> Result<()> {
    match bench {
        Some(bench) => {
            probe.start_with(bench.probe());
            Ok(())
        }
        None => probe.start().context("opening field probe"),
    }
}

async fn shutdown(generator: &InstrumentLink, probe: &ProbeLink) {
    generator.shutdown().await;
    probe.stop().await;
}

async fn run_sweep(settings: &Settings, simulate: bool, resweep: bool) -> Result<()> {
    let bench = simulate.then(SimulatedBench::new);
    let generator = open_generator(settings, bench.as_ref()).await?;
    let probe = Arc::new(ProbeLink::new(settings.probe.clone()));
    tokio::spawn(log_probe_events(probe.subscribe()));
    tokio::spawn(log_generator_events(generator.subscribe()));
    start_probe(&probe, bench.as_ref())?;

    let mut controller = SweepController::from_settings(generator.clone(), probe.clone(), settings)?;
    println!(
        "Sweeping {} to {} MHz in {} steps, about {:.0?}. Warnings go to {}",
        controller.start_frequency(),
        controller.stop_frequency(),
        controller.step_count(),
        controller.sweep_time(),
        controller.log_path().display()
    );

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping sweep");
            stop.request_stop();
        }
    });
    let printer = tokio::spawn(print_sweep_events(controller.subscribe()));

    let mut result = controller.run().await;
    if resweep {
        if let Ok(StepOutcome::Finished { missed }) = &result {
            if !missed.is_empty() {
                println!("Re-sweeping {} missed frequencies", missed.len());
                result = controller.run_missed().await;
            }
        }
    }

    if controller.is_sweeping() {
        if let Err(e) = controller.stop_sweep().await {
            warn!("could not stop sweep cleanly: {}", e);
        }
    }
    drop(controller);
    let _ = printer.await;
    shutdown(&generator, &probe).await;

    match result.context("sweep failed")? {
        StepOutcome::Finished { missed } if missed.is_empty() => {
            println!("Sweep complete, every frequency reached the target field");
            Ok(())
        }
        StepOutcome::Finished { missed } => {
            println!("Sweep complete, {} frequencies missed:", missed.len());
            for mhz in missed {
                println!("  {:.6} MHz", mhz);
            }
            Ok(())
        }
        StepOutcome::Aborted => bail!("sweep aborted"),
        other => bail!("sweep ended unexpectedly: {:?}", other),
    }
}

async fn stream_probe(settings: &Settings, simulate: bool, seconds: u64) -> Result<()> {
    let bench = simulate.then(SimulatedBench::new);
    let probe = ProbeLink::new(settings.probe.clone());
    tokio::spawn(log_probe_events(probe.subscribe()));
    start_probe(&probe, bench.as_ref())?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    let mut report = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                let reading = probe.read_current_field();
                println!(
                    "E = {:6.2} V/m  (x {:5.2}, y {:5.2}, z {:5.2})",
                    reading.composite, reading.x, reading.y, reading.z
                );
            }
        }
        if !probe.is_running() {
            break;
        }
    }

    let running = probe.is_running();
    probe.stop().await;
    if !running {
        bail!("field probe link stopped");
    }
    Ok(())
}

async fn identify(settings: &Settings, simulate: bool) -> Result<()> {
    let bench = simulate.then(SimulatedBench::new);
    if bench.is_none() && !instrument::detect(&settings.signal_generator).await {
        bail!(
            "signal generator not reachable at {}:{}",
            settings.signal_generator.address,
            settings.signal_generator.port
        );
    }

    let generator = open_generator(settings, bench.as_ref()).await?;
    let probe = ProbeLink::new(settings.probe.clone());
    let mut probe_events = probe.subscribe();
    start_probe(&probe, bench.as_ref())?;

    let timeout = settings.signal_generator.timeout();
    let mut state = generator.watch_state();
    let generator_id = tokio::time::timeout(timeout, state.wait_for(|s| s.identity.is_some()))
        .await
        .ok()
        .and_then(|seen| seen.ok().and_then(|s| s.identity.clone()));

    let probe_id = tokio::time::timeout(timeout, async {
        loop {
            match probe_events.recv().await {
                Ok(ProbeEvent::Identity(identity)) => return Some(identity),
                Ok(ProbeEvent::ConnectionError(_)) | Err(RecvError::Closed) => return None,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    })
    .await
    .ok()
    .flatten();

    shutdown(&generator, &probe).await;

    match generator_id {
        Some(id) => println!("Signal generator: {}", id),
        None => println!("Signal generator: no identity received"),
    }
    match probe_id {
        Some(id) => println!(
            "Field probe: {} revision {} serial {} calibrated {}",
            id.model, id.revision, id.serial_number, id.calibration_date
        ),
        None => println!("Field probe: no identity received"),
    }
    Ok(())
}

async fn print_sweep_events(mut events: broadcast::Receiver<SweepEvent>) {
    loop {
        match events.recv().await {
            Ok(SweepEvent::FrequencySet(mhz)) => print!("{:>12.6} MHz", mhz),
            Ok(SweepEvent::SweepStatus(percent)) => print!("  [{:5.1} %]", percent),
            Ok(SweepEvent::PowerSet(dbm)) => print!("  {:7.2} dBm", dbm),
            Ok(SweepEvent::FieldUpdated(field)) => println!("  {:6.2} V/m", field.composite),
            Ok(SweepEvent::HighFieldDetected(path)) => {
                println!("\nHigh field detected, see {}", path.display())
            }
            Ok(SweepEvent::PowerLimitExceeded(message)) => println!("\n{}", message),
            Ok(SweepEvent::SweepCompleted(_)) => println!(),
            Ok(SweepEvent::BeginDwell(_)) => {}
            Err(RecvError::Lagged(n)) => warn!("sweep display skipped {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_probe_events(mut events: broadcast::Receiver<ProbeEvent>) {
    loop {
        match events.recv().await {
            Ok(ProbeEvent::Battery(percent)) => info!(percent, "probe battery"),
            Ok(ProbeEvent::Temperature(fahrenheit)) => info!(fahrenheit, "probe temperature"),
            Ok(ProbeEvent::Error(fault)) => warn!("probe: {}", fault),
            Ok(ProbeEvent::ConnectionError(e)) => warn!("probe connection lost: {}", e),
            Ok(ProbeEvent::Identity(_)) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_generator_events(mut events: broadcast::Receiver<InstrumentEvent>) {
    loop {
        match events.recv().await {
            Ok(InstrumentEvent::Connected(id)) => info!(identity = %id, "signal generator"),
            Ok(InstrumentEvent::ConnectionError(e)) => {
                warn!("signal generator connection lost: {}", e)
            }
            Ok(InstrumentEvent::Error(e)) => warn!("signal generator: {}", e),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
