//! # Voice Activity Detection
//!
//! Two-phase energy detector that decides when a spoken utterance is complete.
//!
//! ## Phases:
//! 1. **Waiting for voice**: frames louder than `voice_start_threshold` must be
//!    sustained for `voice_start_ms` before speech counts as started. Any quieter
//!    frame resets the run, so clicks and short noises are ignored.
//! 2. **Monitoring silence**: frames quieter than `silence_threshold` sustained for
//!    `silence_timeout_ms` end the utterance. Any louder frame resets the run.
//!
//! Time is counted in samples rather than wall clock, so the same audio always
//! produces the same decision.

use crate::audio::processor::rms_level;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    pub sample_rate: u32,
    pub voice_start_threshold: f32,
    pub voice_start_ms: u64,
    pub silence_threshold: f32,
    pub silence_timeout_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            voice_start_threshold: 0.05,
            voice_start_ms: 250,
            silence_threshold: 0.02,
            silence_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadPhase {
    WaitingForVoice,
    MonitoringSilence,
    /// Silence was reported; nothing more until `reset`
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// Nothing to report for this frame
    Pending,
    /// Sustained speech was just confirmed
    VoiceStarted,
    /// Sustained silence after speech; reported exactly once
    SilenceDetected,
}

#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    phase: VadPhase,
    voice_run: usize,
    silence_run: usize,
    voice_start_samples: usize,
    silence_samples: usize,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        let per_ms = |ms: u64| ((ms * config.sample_rate as u64) / 1000) as usize;
        Self {
            voice_start_samples: per_ms(config.voice_start_ms),
            silence_samples: per_ms(config.silence_timeout_ms),
            config,
            phase: VadPhase::WaitingForVoice,
            voice_run: 0,
            silence_run: 0,
        }
    }

    pub fn phase(&self) -> VadPhase {
        self.phase
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.phase = VadPhase::WaitingForVoice;
        self.voice_run = 0;
        self.silence_run = 0;
    }

    /// Feed one frame of mono samples.
    pub fn process(&mut self, samples: &[i16]) -> VadDecision {
        if samples.is_empty() {
            return VadDecision::Pending;
        }
        let level = rms_level(samples);

        match self.phase {
            VadPhase::WaitingForVoice => {
                if level > self.config.voice_start_threshold {
                    self.voice_run += samples.len();
                    if self.voice_run >= self.voice_start_samples {
                        self.phase = VadPhase::MonitoringSilence;
                        self.silence_run = 0;
                        return VadDecision::VoiceStarted;
                    }
                } else {
                    self.voice_run = 0;
                }
                VadDecision::Pending
            }
            VadPhase::MonitoringSilence => {
                if level < self.config.silence_threshold {
                    self.silence_run += samples.len();
                    if self.silence_run >= self.silence_samples {
                        self.phase = VadPhase::Finished;
                        return VadDecision::SilenceDetected;
                    }
                } else {
                    self.silence_run = 0;
                }
                VadDecision::Pending
            }
            VadPhase::Finished => VadDecision::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 100ms frames at 16kHz
    const FRAME: usize = 1600;

    fn loud() -> Vec<i16> {
        vec![8000; FRAME]
    }

    fn quiet() -> Vec<i16> {
        vec![50; FRAME]
    }

    fn feed(vad: &mut VoiceActivityDetector, frame: &[i16], times: usize) -> Vec<VadDecision> {
        (0..times).map(|_| vad.process(frame)).collect()
    }

    #[test]
    fn test_voice_then_silence() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());

        // 250ms of voice needs three 100ms frames
        let decisions = feed(&mut vad, &loud(), 3);
        assert_eq!(decisions[2], VadDecision::VoiceStarted);
        assert_eq!(vad.phase(), VadPhase::MonitoringSilence);

        // 2000ms of silence = 20 frames; the 20th reports
        let decisions = feed(&mut vad, &quiet(), 20);
        assert!(decisions[..19].iter().all(|d| *d == VadDecision::Pending));
        assert_eq!(decisions[19], VadDecision::SilenceDetected);

        // Reported once only
        assert_eq!(vad.process(&quiet()), VadDecision::Pending);
        assert_eq!(vad.phase(), VadPhase::Finished);
    }

    #[test]
    fn test_silence_before_voice_never_ends_utterance() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        let decisions = feed(&mut vad, &quiet(), 100);
        assert!(decisions.iter().all(|d| *d == VadDecision::Pending));
        assert_eq!(vad.phase(), VadPhase::WaitingForVoice);
    }

    #[test]
    fn test_short_noise_does_not_start_voice() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        feed(&mut vad, &loud(), 2);
        vad.process(&quiet());
        feed(&mut vad, &loud(), 2);
        assert_eq!(vad.phase(), VadPhase::WaitingForVoice);
    }

    #[test]
    fn test_speech_resets_silence_run() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        feed(&mut vad, &loud(), 3);

        feed(&mut vad, &quiet(), 15);
        vad.process(&loud());
        let decisions = feed(&mut vad, &quiet(), 19);
        assert!(decisions.iter().all(|d| *d == VadDecision::Pending));
        assert_eq!(vad.process(&quiet()), VadDecision::SilenceDetected);
    }

    #[test]
    fn test_reset() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        feed(&mut vad, &loud(), 3);
        vad.reset();
        assert_eq!(vad.phase(), VadPhase::WaitingForVoice);
    }
}
