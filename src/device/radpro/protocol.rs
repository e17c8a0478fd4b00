//! Line-oriented request/response framing for Rad Pro devices.
//!
//! One transaction: write `command + "\n"`, accumulate reads until the
//! response carries its trailing newline, then check the `OK` status prefix.
//! The client is fully synchronous; callers serialize access to a device
//! instance.
//!
//! Failure classification matters to callers:
//! - an empty or timed-out read is a [`RadmonError::Timeout`] (soft, the
//!   channel stays open and the command may be retried),
//! - any other I/O error is a [`RadmonError::ConnectionLost`] and closes the
//!   channel,
//! - a response without the `OK` prefix is a [`RadmonError::Rejected`] (the
//!   link is fine, the value is not).

use crate::error::{AppResult, RadmonError};
use log::debug;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

pub const BAUD_RATE: u32 = 115_200;
pub const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Byte channel the client talks over. Implemented by serial ports and by
/// in-memory doubles in tests.
pub trait LineTransport: Read + Write + Send {}
impl<T: Read + Write + Send> LineTransport for T {}

pub struct LineClient {
    transport: Option<Box<dyn LineTransport>>,
}

impl LineClient {
    pub fn new(transport: Box<dyn LineTransport>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn close(&mut self) {
        self.transport = None;
    }

    /// Run one request/response transaction and return the `OK` payload.
    pub fn query(&mut self, request: &str) -> AppResult<String> {
        debug!("Rad Pro request: \"{}\"", request);

        let mut transport = self
            .transport
            .take()
            .ok_or_else(|| RadmonError::ConnectionLost("channel is closed".to_string()))?;

        let result = exchange(transport.as_mut(), request);

        // Timeouts and rejections leave the channel usable; real I/O
        // failures drop it.
        match result {
            Ok(response) => {
                self.transport = Some(transport);
                debug!("Rad Pro response: \"{}\"", response);
                parse_status(&response)
            }
            Err(RadmonError::ConnectionLost(e)) => Err(RadmonError::ConnectionLost(e)),
            Err(other) => {
                self.transport = Some(transport);
                Err(other)
            }
        }
    }
}

fn exchange(transport: &mut dyn LineTransport, request: &str) -> AppResult<String> {
    transport
        .write_all(request.as_bytes())
        .and_then(|()| transport.write_all(b"\n"))
        .map_err(|e| RadmonError::ConnectionLost(e.to_string()))?;

    let mut response = String::new();
    let mut buf = [0u8; 256];
    loop {
        match transport.read(&mut buf) {
            // An empty read is the transport's timeout signal; the overall
            // transaction times out rather than retrying indefinitely.
            Ok(0) => return Err(RadmonError::Timeout),
            Ok(n) => {
                response.push_str(&String::from_utf8_lossy(&buf[..n]));
                if response.ends_with('\n') {
                    return Ok(response.trim().to_string());
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Err(RadmonError::Timeout)
            }
            Err(e) => return Err(RadmonError::ConnectionLost(e.to_string())),
        }
    }
}

/// A well-formed response is `OK` plus an optional separator and payload;
/// the payload is everything after the 3-character prefix, trimmed.
fn parse_status(response: &str) -> AppResult<String> {
    if response.starts_with("OK") {
        Ok(response.get(3..).unwrap_or("").trim().to_string())
    } else {
        Err(RadmonError::Rejected(response.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Transport double: each read hands out the next scripted chunk; when
    /// the script runs dry the read times out. Writes are recorded.
    struct Scripted {
        chunks: VecDeque<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Scripted {
        fn new(chunks: &[&[u8]]) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    chunks: chunks.iter().map(|c| c.to_vec()).collect(),
                    written: Arc::clone(&written),
                },
                written,
            )
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => Err(std::io::Error::new(ErrorKind::TimedOut, "read timeout")),
            }
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Ok(mut written) = self.written.lock() {
                written.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn client_with(chunks: &[&[u8]]) -> (LineClient, Arc<Mutex<Vec<u8>>>) {
        let (transport, written) = Scripted::new(chunks);
        (LineClient::new(Box::new(transport)), written)
    }

    #[test]
    fn query_returns_ok_payload() {
        let (mut client, _) = client_with(&[b"OK 3.2\n"]);
        let payload = client.query("GET deviceBatteryVoltage").expect("payload");
        assert_eq!(payload, "3.2");
        assert!(client.is_open());
    }

    #[test]
    fn query_appends_newline_to_request() {
        let (mut client, written) = client_with(&[b"OK\n"]);
        client.query("GET deviceId").expect("query");
        assert_eq!(written.lock().expect("written").as_slice(), b"GET deviceId\n");
    }

    #[test]
    fn bare_ok_yields_empty_payload() {
        let (mut client, _) = client_with(&[b"OK\n"]);
        assert_eq!(client.query("SET deviceTime 0").expect("payload"), "");
    }

    #[test]
    fn response_split_across_reads_is_accumulated() {
        let (mut client, _) = client_with(&[b"OK 12", b"34\n"]);
        let payload = client.query("GET tubePulseCount").expect("payload");
        assert_eq!(payload, "1234");
    }

    #[test]
    fn non_ok_prefix_is_rejected() {
        let (mut client, _) = client_with(&[b"ERROR\n"]);
        match client.query("GET tubeRate") {
            Err(RadmonError::Rejected(response)) => assert_eq!(response, "ERROR"),
            other => panic!("expected rejection, got {:?}", other.map_err(|e| e.to_string())),
        }
        // Rejection does not close the channel.
        assert!(client.is_open());
    }

    #[test]
    fn silence_is_a_timeout_and_keeps_channel_open() {
        let (mut client, _) = client_with(&[]);
        assert!(matches!(
            client.query("GET tubeRate"),
            Err(RadmonError::Timeout)
        ));
        assert!(client.is_open());
    }

    #[test]
    fn partial_line_then_silence_is_a_timeout() {
        let (mut client, _) = client_with(&[b"OK 12"]);
        assert!(matches!(
            client.query("GET tubeRate"),
            Err(RadmonError::Timeout)
        ));
    }

    #[test]
    fn io_error_closes_channel() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::BrokenPipe, "gone"))
            }
        }
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::BrokenPipe, "gone"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut client = LineClient::new(Box::new(Broken));
        assert!(matches!(
            client.query("GET tubeRate"),
            Err(RadmonError::ConnectionLost(_))
        ));
        assert!(!client.is_open());

        // Further queries fail fast on the closed channel.
        assert!(matches!(
            client.query("GET tubeRate"),
            Err(RadmonError::ConnectionLost(_))
        ));
    }
}
