pub mod espeak;
pub mod piper;

use crate::error::Result;
use async_trait::async_trait;

/// A phonemized piece of a unit: the smallest item sent to inference.
#[derive(Debug, Clone, PartialEq)]
pub struct Phrase {
    pub phonemes: Vec<String>,
    pub phoneme_ids: Vec<i64>,
    pub silence_seconds: f32,
}

/// Interleaved PCM produced by inference. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub num_channels: u16,
}

impl PcmBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.num_channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate.max(1) as f64
    }
}

/// Converts text into phrases. Implementations talk to espeak-ng, a remote
/// phonemize service, etc.
#[async_trait]
pub trait Phonemizer: Send + Sync {
    /// Phonemize several texts in one round trip. The result has one entry per
    /// input text, in order.
    async fn batch_phonemize(&self, texts: &[String]) -> Result<Vec<Vec<Phrase>>>;

    async fn phonemize(&self, text: &str) -> Result<Vec<Phrase>> {
        let mut results = self.batch_phonemize(&[text.to_string()]).await?;
        Ok(results.pop().unwrap_or_default())
    }
}

/// Turns a phoneme id sequence into audio. May be slow; the caller does not
/// impose a timeout.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn infer(&self, phoneme_ids: &[i64], speaker_id: Option<u32>) -> Result<PcmBuffer>;
}
