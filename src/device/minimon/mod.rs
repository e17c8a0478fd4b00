//! MiniMon USB CO2/temperature/humidity monitor driver.
//!
//! The device is a Holtek-based "CO2 mini" monitor exposed as a hidraw
//! character device (a udev rule keeps a stable `/dev/minimon` symlink). A
//! background thread reads one 8-byte frame per cycle, decodes it through
//! [`codec`] and keeps the latest raw value per opcode in a [`SampleCache`].
//! The logging path converts cached opcodes into physical units on demand
//! and applies duplicate suppression between forced emissions.
//!
//! ## Configuration
//!
//! ```toml
//! [minimon]
//! device = "/dev/minimon"
//! interval_secs = 60.0
//! variables = ["Temp", "Humidity", "CO2"]
//! ```

pub mod cache;
pub mod codec;
mod hid;

use crate::config::{MiniMonSettings, ValueScale};
use crate::error::AppResult;
use cache::SampleCache;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Bounded wait for the poll thread to exit on close.
const JOIN_TIMEOUT: Duration = Duration::from_millis(3000);

const LOST_MSG: &str =
    "Lost connection to MiniMon device; stopping MiniMon. Reconnect to continue.";

/// Role of a positional variable slot. The slot-to-role mapping is fixed by
/// the device contract: slot 0 reports temperature, slot 1 humidity, slot 2
/// CO2, regardless of the configured variable names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableSlot {
    Temperature,
    Humidity,
    Co2,
}

impl VariableSlot {
    fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Temperature),
            1 => Some(Self::Humidity),
            2 => Some(Self::Co2),
            _ => None,
        }
    }

    fn opcode(self) -> u8 {
        match self {
            // Humidity is opcode 0x41, not the 0x44 some reference decoders
            // use; devices without a humidity sensor report 0 there.
            Self::Temperature => codec::OP_TEMPERATURE,
            Self::Humidity => codec::OP_HUMIDITY,
            Self::Co2 => codec::OP_CO2,
        }
    }

    /// Convert a raw cached value into physical units.
    fn convert(self, raw: u16) -> f64 {
        match self {
            Self::Temperature => round2(f64::from(raw) / 16.0 - 273.15),
            Self::Humidity => round2(f64::from(raw) / 100.0),
            Self::Co2 => f64::from(raw),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Default)]
struct EmissionState {
    /// Bit-exact copy of the last emitted value set.
    last_values: HashMap<String, u64>,
    last_emit: Option<Instant>,
}

pub struct MiniMon {
    device: String,
    handle: Option<File>,
    cache: Arc<SampleCache>,
    stop: Arc<AtomicBool>,
    poll_thread: Option<thread::JoinHandle<()>>,
    variables: Vec<String>,
    scale: HashMap<String, ValueScale>,
    interval: Duration,
    emission: Mutex<EmissionState>,
}

impl MiniMon {
    /// Open the device, arm it with the feature report and start the poll
    /// thread. Open failures are fatal for the driver.
    pub fn open(settings: &MiniMonSettings, log_cycle_secs: f64) -> AppResult<Self> {
        let handle = File::options()
            .read(true)
            .append(true)
            .open(&settings.device)
            .map_err(|e| {
                error!(
                    "Could not open MiniMon device '{}' - is it connected and powered?",
                    settings.device
                );
                e
            })?;

        hid::arm_device(&handle, &codec::KEY)?;

        let cache = Arc::new(SampleCache::new());
        let stop = Arc::new(AtomicBool::new(false));
        let reader = handle.try_clone()?;
        let poll_thread = thread::spawn({
            let cache = Arc::clone(&cache);
            let stop = Arc::clone(&stop);
            let device = settings.device.clone();
            move || poll_loop(reader, device, cache, stop, log_cycle_secs)
        });

        info!("MiniMon connected on '{}'", settings.device);

        Ok(Self {
            device: settings.device.clone(),
            handle: Some(handle),
            cache,
            stop,
            poll_thread: Some(poll_thread),
            variables: truncate_slots(settings.variables.clone()),
            scale: settings.scale.clone(),
            interval: Duration::from_secs_f64(settings.interval_secs),
            emission: Mutex::new(EmissionState::default()),
        })
    }

    /// Stop the poll thread (bounded wait) and release the device handle.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(handle) = self.poll_thread.take() {
            let start = Instant::now();
            while !handle.is_finished() && start.elapsed() < JOIN_TIMEOUT {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
                debug!("MiniMon poll thread stopped after {:?}", start.elapsed());
            } else {
                warn!("MiniMon poll thread still blocked in read; releasing device anyway");
            }
        }

        // The handle is dropped regardless of the join outcome.
        self.handle = None;
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Build the sample set for one logging tick.
    ///
    /// Slots are positional: index 0 is temperature, 1 humidity, 2 CO2. A
    /// slot named "None" is skipped, as is any slot whose opcode was never
    /// observed. Returns an empty map when nothing new should be recorded.
    pub fn get_samples(&self, varlist: &[String]) -> HashMap<String, f64> {
        if let Some(message) = self.cache.take_error() {
            error!("{}", message);
            return HashMap::new();
        }

        let snapshot = self.cache.snapshot();
        let mut samples = HashMap::new();

        for (index, name) in varlist.iter().take(3).enumerate() {
            if name == "None" {
                continue;
            }
            let Some(slot) = VariableSlot::from_index(index) else {
                continue;
            };
            if let Some(&raw) = snapshot.get(&slot.opcode()) {
                let mut value = slot.convert(raw);
                if let Some(scale) = self.scale.get(name) {
                    value = scale.apply(value);
                }
                samples.insert(name.clone(), value);
            }
        }

        self.gate(samples)
    }

    /// Duplicate suppression between forced emissions: once the configured
    /// interval has elapsed the set is emitted even if unchanged; inside the
    /// interval an unchanged set collapses to an empty map.
    ///
    /// A forced emission resets only the timer. The suppression baseline
    /// holds the last set emitted on the changed-value path, so a change
    /// that lands exactly on a forced tick is emitted again on the next one.
    fn gate(&self, samples: HashMap<String, f64>) -> HashMap<String, f64> {
        let Ok(mut state) = self.emission.lock() else {
            return samples;
        };

        let now = Instant::now();
        let force = match state.last_emit {
            Some(at) => now.duration_since(at) >= self.interval,
            None => true,
        };

        if force {
            state.last_emit = Some(now);
            return samples;
        }

        let bits: HashMap<String, u64> = samples
            .iter()
            .map(|(name, value)| (name.clone(), value.to_bits()))
            .collect();

        if bits == state.last_values {
            return HashMap::new();
        }

        state.last_values = bits;
        state.last_emit = Some(now);
        samples
    }

    /// Driver summary for the `info` command.
    pub fn info(&self) -> String {
        format!(
            "Configured Connection:        {}\nConfigured Variables:         {}\n",
            self.device,
            self.variables.join(", ")
        )
    }

    #[cfg(test)]
    fn offline(variables: Vec<String>, scale: HashMap<String, ValueScale>, interval: f64) -> Self {
        Self {
            device: "offline".to_string(),
            handle: None,
            cache: Arc::new(SampleCache::new()),
            stop: Arc::new(AtomicBool::new(false)),
            poll_thread: None,
            variables: truncate_slots(variables),
            scale,
            interval: Duration::from_secs_f64(interval),
            emission: Mutex::new(EmissionState::default()),
        }
    }
}

impl Drop for MiniMon {
    fn drop(&mut self) {
        self.close();
    }
}

/// No more than three variable slots are meaningful.
fn truncate_slots(mut variables: Vec<String>) -> Vec<String> {
    variables.truncate(3);
    variables
}

/// Sleep half a log cycle between reads, bounded to stay responsive without
/// busy-looping.
fn poll_sleep(log_cycle_secs: f64) -> Duration {
    Duration::from_secs_f64((log_cycle_secs * 0.5).clamp(0.05, 3.0))
}

fn poll_loop(
    mut reader: File,
    device: String,
    cache: Arc<SampleCache>,
    stop: Arc<AtomicBool>,
    log_cycle_secs: f64,
) {
    while !stop.load(Ordering::Relaxed) {
        if std::fs::metadata(&device).is_err() {
            error!("MiniMon device '{}' is no longer readable", device);
            cache.set_error(LOST_MSG.to_string());
            break;
        }

        let mut frame = [0u8; codec::FRAME_LEN];
        match reader.read(&mut frame) {
            Ok(n) if n == codec::FRAME_LEN => match codec::decode(&frame) {
                Ok(sample) => {
                    if matches!(
                        sample.opcode,
                        codec::OP_CO2 | codec::OP_TEMPERATURE | codec::OP_HUMIDITY
                    ) {
                        cache.store(sample.opcode, sample.value);
                    }
                }
                // Next frame is independent; drop this one.
                Err(e) => debug!("MiniMon frame dropped: {}", e),
            },
            Ok(n) => warn!("MiniMon short read of {} bytes", n),
            Err(e) => {
                if is_connection_lost(&e) {
                    error!("MiniMon read failed: {}", e);
                    cache.set_error(LOST_MSG.to_string());
                    break;
                }
                warn!("MiniMon read failed: {}", e);
            }
        }

        thread::sleep(poll_sleep(log_cycle_secs));
    }
}

/// EIO from hidraw means the device went away.
#[cfg(target_os = "linux")]
fn is_connection_lost(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

#[cfg(not(target_os = "linux"))]
fn is_connection_lost(_e: &std::io::Error) -> bool {
    false
}
