//! # PCM Frame Processing
//!
//! Validation and level measurement for the raw audio frames a client streams
//! over the voice socket.
//!
//! ## Frame Format:
//! - **Encoding**: 16-bit signed little-endian PCM
//! - **Layout**: interleaved if more than one channel (only mono is accepted)
//! - **Size**: any even, non-empty number of bytes

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Audio format a client declares when its microphone is ready.
///
/// ## Example:
/// ```json
/// { "sample_rate": 16000, "channels": 1, "bit_depth": 16 }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u8, bit_depth: u8) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
        }
    }

    /// Milliseconds of audio in `samples` mono samples.
    pub fn duration_ms(&self, samples: usize) -> u64 {
        (samples as u64 * 1000) / self.sample_rate.max(1) as u64
    }

    /// Number of mono samples in `ms` milliseconds.
    pub fn samples_for_ms(&self, ms: u64) -> usize {
        ((ms * self.sample_rate as u64) / 1000) as usize
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(16000, 1, 16)
    }
}

/// Check that a client's declared format is one the capture pipeline accepts.
///
/// ## Validation Checks:
/// 1. **Sample rate** must match the configured rate
/// 2. **Channels** must be mono
/// 3. **Bit depth** must be 16
pub fn check_format(expected: &AudioFormat, declared: &AudioFormat) -> Result<(), String> {
    if declared.sample_rate != expected.sample_rate {
        return Err(format!(
            "Sample rate mismatch: expected {}, got {}",
            expected.sample_rate, declared.sample_rate
        ));
    }
    if declared.channels != 1 {
        return Err(format!("Only mono audio is supported, got {} channels", declared.channels));
    }
    if declared.bit_depth != 16 {
        return Err(format!("Only 16-bit PCM is supported, got {} bits", declared.bit_depth));
    }
    Ok(())
}

/// Decode one frame of 16-bit little-endian PCM.
pub fn decode_frame(data: &[u8]) -> Result<Vec<i16>, String> {
    if data.is_empty() {
        return Err("Audio frame is empty".to_string());
    }
    if data.len() % 2 != 0 {
        return Err("Audio frame length must be even for 16-bit samples".to_string());
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Root-mean-square level of `samples`, normalized to `[0.0, 1.0]`.
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}
