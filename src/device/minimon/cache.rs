//! Shared state between the poll thread and the sample-request path.

use std::collections::HashMap;
use std::sync::Mutex;

/// Latest raw value per opcode, plus a one-shot error slot.
///
/// Single writer (the poll thread), any number of readers. Readers get a
/// snapshot copy under the lock; values never expire, and an absent opcode
/// means it was never observed.
#[derive(Debug, Default)]
pub struct SampleCache {
    values: Mutex<HashMap<u8, u16>>,
    error: Mutex<Option<String>>,
}

impl SampleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, opcode: u8, value: u16) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(opcode, value);
        }
    }

    pub fn snapshot(&self) -> HashMap<u8, u16> {
        self.values
            .lock()
            .map(|values| values.clone())
            .unwrap_or_default()
    }

    /// Record a terminal driver error. The first message wins; the poll loop
    /// stops right after setting it.
    pub fn set_error(&self, message: String) {
        if let Ok(mut slot) = self.error.lock() {
            slot.get_or_insert(message);
        }
    }

    /// Consume the stored error, if any. Surfaced to the caller exactly once.
    pub fn take_error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }
}
