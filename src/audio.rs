//! Audio player contract and the gain/silence preparation shared by players.

use crate::backends::PcmBuffer;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Per-speech playback settings, already resolved against defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackParams {
    pub pitch: Option<f32>,
    pub rate: f32,
    pub volume: f32,
}

impl Default for PlaybackParams {
    fn default() -> Self {
        Self {
            pitch: None,
            rate: 1.0,
            volume: 1.0,
        }
    }
}

/// Plays PCM. Each call produces one live output; the caller guarantees at
/// most one is live at a time.
pub trait AudioPlayer: Send + Sync {
    fn play_audio(
        &self,
        pcm: Arc<PcmBuffer>,
        trailing_silence_secs: f32,
        params: PlaybackParams,
    ) -> Result<Box<dyn Playing>>;
}

/// A sounding buffer.
#[async_trait]
pub trait Playing: Send {
    /// Resolves once the buffer (and its trailing silence) has played out.
    ///
    /// Must be cancel-safe: the controller races it against incoming commands
    /// and may drop the future and call it again later.
    async fn finished(&mut self) -> Result<()>;

    /// Stop output, remembering the position reached.
    fn pause(self: Box<Self>) -> Box<dyn Paused>;

    /// Stop output for good.
    fn stop(self: Box<Self>) {
        drop(self.pause());
    }
}

/// A stopped buffer that can continue from where it was paused.
pub trait Paused: Send {
    fn resume(self: Box<Self>) -> Result<Box<dyn Playing>>;
}

/// Largest absolute sample value.
pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}

/// Gain that brings the buffer's peak to `volume`, so phrases synthesized at
/// different natural loudness come out level. Near-silent buffers are capped
/// at 100x.
pub fn normalized_gain(peak: f32, volume: f32) -> f32 {
    volume / peak.max(0.01)
}

/// Samples of `pcm` followed by `silence_secs` of zeros on every channel.
pub fn with_trailing_silence(pcm: &PcmBuffer, silence_secs: f32) -> Vec<f32> {
    let channels = pcm.num_channels.max(1) as usize;
    let silence_frames = (silence_secs.max(0.0) * pcm.sample_rate as f32).round() as usize;
    let mut samples = Vec::with_capacity(pcm.samples.len() + silence_frames * channels);
    samples.extend_from_slice(&pcm.samples);
    samples.resize(pcm.samples.len() + silence_frames * channels, 0.0);
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: Vec<f32>, channels: u16) -> PcmBuffer {
        PcmBuffer {
            samples,
            sample_rate: 10,
            num_channels: channels,
        }
    }

    #[test]
    fn test_peak_uses_absolute_value() {
        assert_eq!(peak_amplitude(&[0.1, -0.6, 0.4]), 0.6);
        assert_eq!(peak_amplitude(&[]), 0.0);
    }

    #[test]
    fn test_gain_normalizes_to_volume() {
        assert!((normalized_gain(0.5, 1.0) - 2.0).abs() < 1e-6);
        assert!((normalized_gain(0.25, 0.5) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_gain_floor_on_silence() {
        assert!((normalized_gain(0.0, 1.0) - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_trailing_silence_per_channel() {
        let out = with_trailing_silence(&pcm(vec![0.5, 0.5, 0.25, 0.25], 2), 0.2);
        // 0.2s at 10Hz = 2 frames x 2 channels
        assert_eq!(out, vec![0.5, 0.5, 0.25, 0.25, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_zero_silence_keeps_samples() {
        let out = with_trailing_silence(&pcm(vec![0.1, 0.2], 1), 0.0);
        assert_eq!(out, vec![0.1, 0.2]);
    }
}
