//! # Utterance Buffer
//!
//! Accumulates the samples of one utterance while the capture session is recording,
//! and packages them as a WAV segment for upload.
//!
//! ## Key Features:
//! - **Bounded**: stops accepting audio once `max_utterance_ms` is reached
//! - **WAV encoding**: canonical 44-byte RIFF/PCM header written with `byteorder`

use crate::audio::processor::AudioFormat;
use crate::conversation::collaborators::AudioSegment;
use byteorder::{LittleEndian, WriteBytesExt};

/// Size of the canonical PCM WAV header.
pub const WAV_HEADER_LEN: usize = 44;

/// Sample store for a single recording.
///
/// Not thread-safe on its own; the capture session keeps it behind its lock.
#[derive(Debug)]
pub struct UtteranceBuffer {
    samples: Vec<i16>,
    format: AudioFormat,
    max_samples: usize,
}

impl UtteranceBuffer {
    /// ## Example:
    /// A 30 second limit at 16kHz keeps at most 30000ms * 16000Hz / 1000 = 480,000 samples.
    pub fn new(format: AudioFormat, max_utterance_ms: u64) -> Self {
        Self {
            samples: Vec::new(),
            format,
            max_samples: format.samples_for_ms(max_utterance_ms),
        }
    }

    /// Append decoded samples. Returns `true` once the buffer is full;
    /// anything past the limit is dropped.
    pub fn append(&mut self, samples: &[i16]) -> bool {
        let room = self.max_samples.saturating_sub(self.samples.len());
        let take = room.min(samples.len());
        self.samples.extend_from_slice(&samples[..take]);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.max_samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        self.format.duration_ms(self.samples.len())
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Drain the buffer into a WAV segment. `None` if nothing was recorded.
    pub fn take_segment(&mut self) -> Option<AudioSegment> {
        if self.samples.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.samples);
        let duration_ms = self.format.duration_ms(samples.len());
        Some(AudioSegment::wav(encode_wav(&samples, &self.format), duration_ms))
    }
}

/// Encode mono 16-bit samples as a WAV file.
///
/// ## Layout:
/// `RIFF <size> WAVE`, a 16-byte `fmt ` chunk (PCM), then the `data` chunk.
pub fn encode_wav(samples: &[i16], format: &AudioFormat) -> Vec<u8> {
    let channels = format.channels.max(1) as u16;
    let bits = 16u16;
    let block_align = channels * bits / 8;
    let byte_rate = format.sample_rate * block_align as u32;
    let data_len = (samples.len() * 2) as u32;

    let mut out = Vec::with_capacity(WAV_HEADER_LEN + samples.len() * 2);
    // Writes into a Vec cannot fail
    let _ = write_wav(&mut out, samples, channels, format.sample_rate, byte_rate, block_align, data_len);
    out
}

fn write_wav(
    out: &mut Vec<u8>,
    samples: &[i16],
    channels: u16,
    sample_rate: u32,
    byte_rate: u32,
    block_align: u16,
    data_len: u32,
) -> std::io::Result<()> {
    out.extend_from_slice(b"RIFF");
    out.write_u32::<LittleEndian>(36 + data_len)?;
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.write_u32::<LittleEndian>(16)?;
    out.write_u16::<LittleEndian>(1)?; // PCM
    out.write_u16::<LittleEndian>(channels)?;
    out.write_u32::<LittleEndian>(sample_rate)?;
    out.write_u32::<LittleEndian>(byte_rate)?;
    out.write_u16::<LittleEndian>(block_align)?;
    out.write_u16::<LittleEndian>(16)?;

    out.extend_from_slice(b"data");
    out.write_u32::<LittleEndian>(data_len)?;
    for &sample in samples {
        out.write_i16::<LittleEndian>(sample)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::Cursor;

    #[test]
    fn test_buffer_stops_at_limit() {
        // 100ms at 16kHz = 1600 samples
        let mut buffer = UtteranceBuffer::new(AudioFormat::default(), 100);

        assert!(!buffer.append(&[1; 1000]));
        assert!(buffer.append(&[1; 1000]));
        assert_eq!(buffer.len(), 1600);
        assert_eq!(buffer.duration_ms(), 100);
    }

    #[test]
    fn test_take_segment_drains() {
        let mut buffer = UtteranceBuffer::new(AudioFormat::default(), 1000);
        assert!(buffer.take_segment().is_none());

        buffer.append(&[5; 8000]);
        let segment = buffer.take_segment().unwrap();

        assert_eq!(segment.duration_ms, 500);
        assert_eq!(segment.mime_type, "audio/wav");
        assert_eq!(segment.bytes.len(), WAV_HEADER_LEN + 16000);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_wav_header() {
        let wav = encode_wav(&[0, 1, -1], &AudioFormat::default());

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");

        let mut cursor = Cursor::new(&wav[4..8]);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 36 + 6);

        let mut cursor = Cursor::new(&wav[24..28]);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 16000);

        let mut cursor = Cursor::new(&wav[40..44]);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 6);
    }
}
