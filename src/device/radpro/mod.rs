//! Driver for Geiger counters running the Rad Pro firmware.
//!
//! The device speaks a line-oriented query protocol over USB serial (FS2011,
//! Bosean FS-600/FS-1000 and friends). Everything is request/response: live
//! rates, device metadata, clock sync and the on-device datalog all go
//! through [`protocol::LineClient::query`].

pub mod history;
pub mod protocol;
pub mod rate;

use crate::config::RadProSettings;
use crate::error::{AppResult, RadmonError};
use crate::sink::RecordSink;
use chrono::{Local, TimeZone, Utc};
use history::DeviceHistoryStore;
use log::{debug, info, warn};
use protocol::{LineClient, LineTransport};
use rate::{CpsEstimator, RatePoint};
use std::collections::HashMap;

pub struct RadPro {
    port_name: String,
    client: LineClient,
    hardware_id: String,
    software_id: String,
    device_id: String,
    /// Stable device identity: `hardwareId;deviceId`. The software id is
    /// excluded so firmware updates keep the datalog history cursor.
    id: String,
    cps: CpsEstimator,
}

impl RadPro {
    /// Probe serial ports and open the first responding device.
    ///
    /// A port configured as `"auto"` scans every detected serial port; each
    /// candidate gets two connection attempts, since the firmware sometimes
    /// drops the first command after enumeration.
    #[cfg(feature = "device_radpro")]
    pub fn open(settings: &RadProSettings, log_cycle_secs: f64) -> AppResult<Self> {
        let ports: Vec<String> = if settings.port == "auto" {
            serialport::available_ports()
                .map_err(|e| RadmonError::ConnectionLost(e.to_string()))?
                .into_iter()
                .map(|p| p.port_name)
                .collect()
        } else {
            vec![settings.port.clone()]
        };

        for port in &ports {
            for attempt in 0..2 {
                debug!("Rad Pro connection attempt {} on {}", attempt, port);
                let transport = match serialport::new(port, protocol::BAUD_RATE)
                    .timeout(protocol::READ_TIMEOUT)
                    .open()
                {
                    Ok(transport) => transport,
                    Err(e) => {
                        debug!("could not open {}: {}", port, e);
                        break;
                    }
                };

                match Self::with_transport(Box::new(transport), port, settings, log_cycle_secs) {
                    Ok(device) => {
                        info!("Rad Pro device {} on {}", device.id, port);
                        return Ok(device);
                    }
                    Err(e) => debug!("no Rad Pro device on {}: {}", port, e),
                }
            }
        }

        Err(RadmonError::ConnectionLost(
            "a Rad Pro device was not detected".to_string(),
        ))
    }

    #[cfg(not(feature = "device_radpro"))]
    pub fn open(_settings: &RadProSettings, _log_cycle_secs: f64) -> AppResult<Self> {
        Err(RadmonError::SerialFeatureDisabled)
    }

    /// Run the identification handshake over an already-open transport.
    pub fn with_transport(
        transport: Box<dyn LineTransport>,
        port_name: &str,
        settings: &RadProSettings,
        log_cycle_secs: f64,
    ) -> AppResult<Self> {
        let mut client = LineClient::new(transport);

        let response = client.query("GET deviceId")?;
        let parts: Vec<&str> = response.split(';').collect();
        let [hardware_id, software_id, device_id] = parts.as_slice() else {
            return Err(RadmonError::MalformedRecord(format!(
                "deviceId response \"{}\" does not have 3 fields",
                response
            )));
        };

        let mut device = Self {
            port_name: port_name.to_string(),
            client,
            hardware_id: hardware_id.to_string(),
            software_id: software_id.to_string(),
            device_id: device_id.to_string(),
            id: format!("{};{}", hardware_id, device_id),
            cps: CpsEstimator::new(log_cycle_secs),
        };

        if settings.sync_time {
            let now = Utc::now().timestamp();
            // Best effort; an old firmware without SET support still logs.
            if let Err(e) = device.client.query(&format!("SET deviceTime {}", now)) {
                warn!("could not sync device time: {}", e);
            }
        }

        Ok(device)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn variables(&self) -> Vec<String> {
        vec!["CPM".to_string(), "CPS".to_string()]
    }

    pub fn close(&mut self) {
        self.client.close();
        debug!("closed Rad Pro device on {}", self.port_name);
    }

    /// Read the current values for the requested variables.
    ///
    /// Soft failures (timeout, rejected command, unparseable number) drop
    /// that variable from the map; a lost connection aborts the read.
    pub fn get_values(&mut self, varlist: &[String]) -> AppResult<HashMap<String, f64>> {
        let mut values = HashMap::new();

        for key in varlist {
            let value = match key.as_str() {
                "CPM" => self.read_cpm()?,
                "CPS" => self.read_cps()?,
                other => {
                    warn!("unknown Rad Pro variable \"{}\"", other);
                    None
                }
            };
            if let Some(value) = value {
                values.insert(key.clone(), value);
            }
        }

        Ok(values)
    }

    fn read_cpm(&mut self) -> AppResult<Option<f64>> {
        match self.soft_query("GET tubeRate")? {
            Some(payload) => Ok(parse_float("tubeRate", &payload)),
            None => Ok(None),
        }
    }

    fn read_cps(&mut self) -> AppResult<Option<f64>> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let Some(payload) = self.soft_query("GET tubePulseCount")? else {
            return Ok(None);
        };
        let Some(count) = parse_float("tubePulseCount", &payload) else {
            return Ok(None);
        };
        Ok(self.cps.update(now, count))
    }

    /// Query, demoting timeouts and rejections to `None`.
    fn soft_query(&mut self, request: &str) -> AppResult<Option<String>> {
        match self.client.query(request) {
            Ok(payload) => Ok(Some(payload)),
            Err(RadmonError::Timeout) => {
                warn!("Rad Pro request \"{}\" timed out", request);
                Ok(None)
            }
            Err(RadmonError::Rejected(response)) => {
                warn!("Rad Pro rejected \"{}\": \"{}\"", request, response);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Ordered device metadata for display. Fields the firmware cannot
    /// answer render as "n/a" rather than failing the whole report.
    pub fn device_info(&mut self) -> Vec<(String, String)> {
        let battery = self.info_field("GET deviceBatteryVoltage");
        let time = self.info_field("GET deviceTime");
        let tube_time = self.info_field("GET tubeTime");
        let pulse_count = self.info_field("GET tubePulseCount");
        let tube_rate = self.info_field("GET tubeRate");
        let conversion = self.info_field("GET tubeConversionFactor");
        let dead_time = self.info_field("GET tubeDeadTime");
        let compensation = self.info_field("GET tubeDeadTimeCompensation");
        let hv_frequency = self.info_field("GET tubeHVFrequency");
        let hv_duty_cycle = self.info_field("GET tubeHVDutyCycle");

        vec![
            ("Hardware ID".to_string(), self.hardware_id.clone()),
            ("Software ID".to_string(), self.software_id.clone()),
            ("Device ID".to_string(), self.device_id.clone()),
            ("Device battery voltage".to_string(), battery + "V"),
            ("Device time".to_string(), format_datetime(&time)),
            ("Tube life time".to_string(), format_duration(&tube_time)),
            ("Tube life pulse count".to_string(), pulse_count),
            ("Tube rate".to_string(), tube_rate + " CPM"),
            (
                "Tube conversion factor".to_string(),
                conversion + " CPM/µSv/h",
            ),
            ("Tube dead time".to_string(), dead_time + " s"),
            (
                "Tube dead-time compensation".to_string(),
                compensation + " s",
            ),
            ("Tube HV PWM frequency".to_string(), hv_frequency + " Hz"),
            ("Tube HV PWM duty cycle".to_string(), hv_duty_cycle + " %"),
        ]
    }

    fn info_field(&mut self, request: &str) -> String {
        match self.client.query(request) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("info request \"{}\" failed: {}", request, e);
                "n/a".to_string()
            }
        }
    }

    /// Download datalog records recorded at or after `start_epoch` and
    /// derive CPM points from them.
    pub fn datalog(&mut self, start_epoch: i64) -> AppResult<Vec<RatePoint>> {
        let payload = self.client.query(&format!("GET datalog {}", start_epoch))?;
        Ok(rate::parse_datalog(&payload))
    }

    /// Incremental history download: resume from the last synced timestamp
    /// for this device, write derived rate points to the sink, and advance
    /// the cursor to the newest downloaded point.
    pub fn download_history(
        &mut self,
        store: &mut DeviceHistoryStore,
        sink: &mut dyn RecordSink,
    ) -> AppResult<usize> {
        let start_epoch = store
            .last_fetch(&self.id)
            .and_then(|t| t.and_local_timezone(Local).latest())
            .map(|t| t.timestamp())
            .unwrap_or(0);

        let points = self.datalog(start_epoch)?;
        for point in &points {
            sink.write_rate_point(point)?;
        }

        if let Some(last) = points.last() {
            if let Some(timestamp) = Local
                .timestamp_opt(last.epoch_seconds, 0)
                .latest()
                .map(|t| t.naive_local())
            {
                store.record_fetch(&self.id, timestamp)?;
            }
        }

        info!("downloaded {} history records from {}", points.len(), self.id);
        Ok(points.len())
    }
}

fn parse_float(name: &str, payload: &str) -> Option<f64> {
    match payload.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("{} payload \"{}\" is not a number", name, payload);
            None
        }
    }
}

/// Render an epoch-seconds payload as a local datetime, or pass the payload
/// through when it is not numeric (e.g. "n/a").
fn format_datetime(payload: &str) -> String {
    payload
        .parse::<i64>()
        .ok()
        .and_then(|epoch| Local.timestamp_opt(epoch, 0).latest())
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| payload.to_string())
}

/// Render a seconds payload as `days, H:MM:SS`.
fn format_duration(payload: &str) -> String {
    let Ok(total) = payload.parse::<i64>() else {
        return payload.to_string();
    };
    let days = total / 86_400;
    let hours = total % 86_400 / 3_600;
    let minutes = total % 3_600 / 60;
    let seconds = total % 60;
    match days {
        0 => format!("{}:{:02}:{:02}", hours, minutes, seconds),
        1 => format!("1 day, {}:{:02}:{:02}", hours, minutes, seconds),
        n => format!("{} days, {}:{:02}:{:02}", n, hours, minutes, seconds),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{ErrorKind, Read, Write};
    use std::sync::{Arc, Mutex};

    /// Transport double that arms the next scripted reply each time a full
    /// request line is written.
    struct Script {
        replies: VecDeque<&'static str>,
        pending: Vec<u8>,
        written: Arc<Mutex<Vec<String>>>,
        line: Vec<u8>,
    }

    impl Script {
        fn new(replies: &[&'static str]) -> (Self, Arc<Mutex<Vec<String>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    replies: replies.iter().copied().collect(),
                    pending: Vec::new(),
                    written: Arc::clone(&written),
                    line: Vec::new(),
                },
                written,
            )
        }
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                return Err(std::io::Error::new(ErrorKind::TimedOut, "read timeout"));
            }
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.line.extend_from_slice(buf);
            if self.line.ends_with(b"\n") {
                let request = String::from_utf8_lossy(&self.line).trim().to_string();
                if let Ok(mut written) = self.written.lock() {
                    written.push(request);
                }
                self.line.clear();
                if let Some(reply) = self.replies.pop_front() {
                    self.pending.extend_from_slice(reply.as_bytes());
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn settings(sync_time: bool) -> RadProSettings {
        RadProSettings {
            port: "offline".to_string(),
            sync_time,
            history_file: "unused.conf".to_string(),
        }
    }

    fn open_scripted(
        replies: &[&'static str],
        sync_time: bool,
    ) -> (AppResult<RadPro>, Arc<Mutex<Vec<String>>>) {
        let (transport, written) = Script::new(replies);
        let device =
            RadPro::with_transport(Box::new(transport), "offline", &settings(sync_time), 3.0);
        (device, written)
    }

    #[test]
    fn handshake_parses_device_identity() {
        let (device, _) = open_scripted(&["OK FS2011;Rad Pro 2.0;a1b2\n"], false);
        let device = device.expect("handshake");
        assert_eq!(device.id(), "FS2011;a1b2");
        assert_eq!(device.hardware_id, "FS2011");
        assert_eq!(device.software_id, "Rad Pro 2.0");
        assert_eq!(device.device_id, "a1b2");
    }

    #[test]
    fn handshake_rejects_wrong_field_count() {
        let (device, _) = open_scripted(&["OK FS2011;a1b2\n"], false);
        assert!(matches!(device, Err(RadmonError::MalformedRecord(_))));
    }

    #[test]
    fn sync_time_sends_set_device_time() {
        let (device, written) = open_scripted(&["OK FS2011;2.0;a1b2\n", "OK\n"], true);
        device.expect("handshake");

        let written = written.lock().expect("written");
        assert_eq!(written.len(), 2);
        assert!(written[1].starts_with("SET deviceTime "));
    }

    #[test]
    fn get_values_reads_cpm_and_seeds_cps() {
        let (device, _) = open_scripted(
            &["OK FS2011;2.0;a1b2\n", "OK 17.5\n", "OK 123456\n"],
            false,
        );
        let mut device = device.expect("handshake");

        let varlist = device.variables();
        let values = device.get_values(&varlist).expect("values");
        assert_eq!(values.get("CPM"), Some(&17.5));
        // First pulse-count reading only seeds the estimator.
        assert_eq!(values.get("CPS"), None);
    }

    #[test]
    fn get_values_skips_unparseable_payloads() {
        let (device, _) = open_scripted(&["OK FS2011;2.0;a1b2\n", "OK garbage\n"], false);
        let mut device = device.expect("handshake");

        let values = device.get_values(&["CPM".to_string()]).expect("values");
        assert!(values.is_empty());
    }

    #[test]
    fn device_info_renders_missing_fields_as_na() {
        // Only the battery query gets an answer; the rest time out.
        let (device, _) = open_scripted(&["OK FS2011;2.0;a1b2\n", "OK 3.2\n"], false);
        let mut device = device.expect("handshake");

        let info = device.device_info();
        let map: HashMap<_, _> = info.iter().cloned().collect();
        assert_eq!(info[0].0, "Hardware ID");
        assert_eq!(map["Device battery voltage"], "3.2V");
        assert_eq!(map["Tube rate"], "n/a CPM");
        assert_eq!(map["Tube life time"], "n/a");
        assert_eq!(map["Tube conversion factor"], "n/a CPM/µSv/h");
    }

    #[test]
    fn datalog_derives_rate_points() {
        let (device, written) = open_scripted(
            &[
                "OK FS2011;2.0;a1b2\n",
                "OK time,tubePulseCount;0,100;60,160;120,220;181,300\n",
            ],
            false,
        );
        let mut device = device.expect("handshake");

        let points = device.datalog(0).expect("datalog");
        assert_eq!(
            points,
            vec![RatePoint {
                epoch_seconds: 120,
                cpm: 60.0
            }]
        );
        assert_eq!(
            written.lock().expect("written").last().map(String::as_str),
            Some("GET datalog 0")
        );
    }

    #[test]
    fn duration_formatting_matches_report_style() {
        assert_eq!(format_duration("59"), "0:00:59");
        assert_eq!(format_duration("3725"), "1:02:05");
        assert_eq!(format_duration("90061"), "1 day, 1:01:01");
        assert_eq!(format_duration("180122"), "2 days, 2:02:02");
        assert_eq!(format_duration("n/a"), "n/a");
    }
}
