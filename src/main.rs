//! CLI entry point for radmon.
//!
//! Subcommands:
//! - `run`: poll the configured devices every logging cycle and append
//!   readings to the CSV log until Ctrl-C.
//! - `info`: print a metadata report for each configured device.
//! - `history`: download new Rad Pro datalog records into the CSV log,
//!   resuming from the last downloaded timestamp.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};
use radmon::config::Settings;
use radmon::device::minimon::MiniMon;
use radmon::device::radpro::history::DeviceHistoryStore;
use radmon::device::radpro::RadPro;
use radmon::sink::{CsvSink, RecordSink};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "radmon")]
#[command(about = "Radiation and air-quality monitor logger", long_about = None)]
struct Cli {
    /// Configuration name under config/ (without extension).
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll devices and log readings until interrupted
    Run,
    /// Print device metadata
    Info,
    /// Download new Rad Pro datalog records into the log
    History,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run => run(&settings).await,
        Commands::Info => print_info(&settings),
        Commands::History => download_history(&settings),
    }
}

async fn run(settings: &Settings) -> Result<()> {
    let minimon = match &settings.minimon {
        Some(cfg) => match MiniMon::open(cfg, settings.log_cycle_secs) {
            Ok(device) => Some(device),
            Err(e) => {
                error!("could not open MiniMon: {}", e);
                None
            }
        },
        None => None,
    };

    let mut radpro = match &settings.radpro {
        Some(cfg) => match RadPro::open(cfg, settings.log_cycle_secs) {
            Ok(device) => {
                info!("Rad Pro device {} ready", device.id());
                Some(Arc::new(Mutex::new(device)))
            }
            Err(e) => {
                error!("could not open Rad Pro device: {}", e);
                None
            }
        },
        None => None,
    };

    if minimon.is_none() && radpro.is_none() {
        bail!("no devices available");
    }

    let mut sink = CsvSink::create(Path::new(&settings.output_path))
        .with_context(|| format!("opening {}", settings.output_path))?;

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(settings.log_cycle_secs));
    info!(
        "logging every {} s to {}",
        settings.log_cycle_secs, settings.output_path
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let timestamp = Utc::now();
                let mut samples = std::collections::HashMap::new();

                if let Some(device) = &minimon {
                    let varlist = device.variables().to_vec();
                    samples.extend(device.get_samples(&varlist));
                }

                if let Some(device) = radpro.as_ref().map(Arc::clone) {
                    match poll_radpro(device).await {
                        Ok(values) => samples.extend(values),
                        Err(e) => {
                            error!("Rad Pro read failed: {}", e);
                            radpro = None;
                        }
                    }
                }

                if !samples.is_empty() {
                    sink.write_samples(timestamp, &samples)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    if let Some(mut device) = minimon {
        device.close();
    }
    if let Some(device) = radpro {
        if let Ok(mut device) = device.lock() {
            device.close();
        }
    }
    Ok(())
}

/// Serial reads block, so they run off the async executor.
async fn poll_radpro(
    device: Arc<Mutex<RadPro>>,
) -> Result<std::collections::HashMap<String, f64>> {
    tokio::task::spawn_blocking(move || {
        let mut device = device
            .lock()
            .map_err(|_| anyhow::anyhow!("Rad Pro driver lock poisoned"))?;
        let varlist = device.variables();
        device.get_values(&varlist).map_err(Into::into)
    })
    .await
    .context("Rad Pro polling task")?
}

fn print_info(settings: &Settings) -> Result<()> {
    let mut printed = false;

    if let Some(cfg) = &settings.minimon {
        match MiniMon::open(cfg, settings.log_cycle_secs) {
            Ok(mut device) => {
                println!("== MiniMon ==");
                print!("{}", device.info());
                println!();
                device.close();
            }
            Err(e) => warn!("could not open MiniMon: {}", e),
        }
        printed = true;
    }

    if let Some(cfg) = &settings.radpro {
        match RadPro::open(cfg, settings.log_cycle_secs) {
            Ok(mut device) => {
                println!("== Rad Pro ==");
                println!("Configured Connection:        Port \"{}\"", device.port_name());
                for (key, value) in device.device_info() {
                    println!("{:<32}: {}", key, value);
                }
                device.close();
            }
            Err(e) => warn!("could not open Rad Pro device: {}", e),
        }
        printed = true;
    }

    if !printed {
        bail!("no devices configured");
    }
    Ok(())
}

fn download_history(settings: &Settings) -> Result<()> {
    let Some(cfg) = &settings.radpro else {
        bail!("no Rad Pro device configured");
    };

    let mut device =
        RadPro::open(cfg, settings.log_cycle_secs).context("opening Rad Pro device")?;
    let mut store =
        DeviceHistoryStore::load(Path::new(&cfg.history_file)).context("loading device history")?;
    let mut sink = CsvSink::create(Path::new(&settings.output_path))
        .with_context(|| format!("opening {}", settings.output_path))?;

    let count = device
        .download_history(&mut store, &mut sink)
        .context("downloading history")?;
    device.close();

    println!("Got {} records", count);
    Ok(())
}
