//! MiniMon frame codec.
//!
//! The monitor streams fixed 8-byte reports over hidraw. Most firmware
//! revisions obfuscate each report with a reversible byte-shuffle/XOR/rotate
//! transform keyed by the feature-report secret; newer revisions send
//! plaintext. The transform is a reverse-engineered format necessity, not
//! cryptography.
//!
//! A valid (decrypted) frame looks like:
//!
//! ```text
//! [opcode, value_hi, value_lo, checksum, 0x0D, 0, 0, 0]
//! ```
//!
//! where `checksum = (opcode + value_hi + value_lo) & 0xFF`.

use crate::error::{AppResult, RadmonError};

/// One raw read unit from the hidraw device.
pub const FRAME_LEN: usize = 8;

/// Frame terminator sentinel in byte 4.
const TERMINATOR: u8 = 0x0D;

/// Feature-report secret, also the decryption key.
pub const KEY: [u8; 8] = [0xC4, 0xC6, 0xC0, 0x92, 0x40, 0x23, 0xDC, 0x96];

/// Hardcoded cipher state; per-position constants are its nibble-swapped
/// bytes.
const CSTATE: [u8; 8] = [0x48, 0x74, 0x65, 0x6D, 0x70, 0x39, 0x39, 0x65];

/// Output position `SHUFFLE[i]` receives input byte `i`.
const SHUFFLE: [usize; 8] = [2, 4, 0, 7, 1, 6, 5, 3];

/// Opcodes with a downstream variable mapping. Other opcodes decode fine but
/// are ignored by the sample stage.
pub const OP_CO2: u8 = 0x50;
pub const OP_TEMPERATURE: u8 = 0x42;
pub const OP_HUMIDITY: u8 = 0x41;

/// A validated `(opcode, value)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedSample {
    pub opcode: u8,
    pub value: u16,
}

/// Reverse the device obfuscation for one frame.
pub fn decrypt(key: &[u8; 8], data: &[u8; FRAME_LEN]) -> [u8; FRAME_LEN] {
    let mut shuffled = [0u8; FRAME_LEN];
    for (i, &target) in SHUFFLE.iter().enumerate() {
        shuffled[target] = data[i];
    }

    let mut xored = [0u8; FRAME_LEN];
    for i in 0..FRAME_LEN {
        xored[i] = shuffled[i] ^ key[i];
    }

    // Rotate-like mixing with the previous position's low bits.
    let mut mixed = [0u8; FRAME_LEN];
    for i in 0..FRAME_LEN {
        mixed[i] = (xored[i] >> 3) | (xored[(i + FRAME_LEN - 1) % FRAME_LEN] << 5);
    }

    let mut out = [0u8; FRAME_LEN];
    for i in 0..FRAME_LEN {
        out[i] = mixed[i].wrapping_sub(swap_nibbles(CSTATE[i]));
    }
    out
}

fn swap_nibbles(byte: u8) -> u8 {
    (byte >> 4) | (byte << 4)
}

/// Decode and validate one raw frame.
///
/// Frames whose byte 4 already equals the terminator are taken as plaintext
/// and never decrypted. An encrypted frame whose incidental byte 4 happens to
/// be 0x0D is therefore misclassified and will usually fail the checksum;
/// this matches the device's established decoding behavior.
pub fn decode(raw: &[u8; FRAME_LEN]) -> AppResult<DecodedSample> {
    let data = if raw[4] == TERMINATOR {
        *raw
    } else {
        decrypt(&KEY, raw)
    };

    if data[4] != TERMINATOR {
        return Err(RadmonError::Decode(format!(
            "byte 4 is {:#04X}, expected frame terminator {:#04X}: {}",
            data[4],
            TERMINATOR,
            hex_frame(&data)
        )));
    }

    let checksum = data[0].wrapping_add(data[1]).wrapping_add(data[2]);
    if checksum != data[3] {
        return Err(RadmonError::Decode(format!(
            "checksum {:#04X} does not match byte 3 in frame {}",
            checksum,
            hex_frame(&data)
        )));
    }

    Ok(DecodedSample {
        opcode: data[0],
        value: u16::from(data[1]) << 8 | u16::from(data[2]),
    })
}

fn hex_frame(data: &[u8; FRAME_LEN]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
